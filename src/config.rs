use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};

use crate::{
    aggregator::EndorsementPolicy,
    error::{BuilderError, GatewayError},
    identity::Identity,
    peer::{PeerId, PeerSet, PeerTarget},
};

/// Where a peer or orderer listens, e.g. `https://localhost:7051`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    /// PEM encoded TLS CA certificate. Plain-text endpoints leave this empty.
    pub tls_ca: Option<Vec<u8>>,
    /// Overrides the TLS server name, needed when connecting through `localhost`.
    pub tls_domain: Option<String>,
}

impl Endpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Endpoint {
            url: url.into(),
            tls_ca: None,
            tls_domain: None,
        }
    }

    pub fn with_tls(mut self, ca_pem: impl Into<Vec<u8>>, domain: Option<String>) -> Self {
        self.tls_ca = Some(ca_pem.into());
        self.tls_domain = domain;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpoint {
    pub id: PeerId,
    pub endpoint: Endpoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one, for transport failures only.
    pub budget: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            budget: 1,
            backoff: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Per peer proposal call.
    pub proposal: Duration,
    /// Whole PROPOSE stage across all peers.
    pub endorsement: Duration,
    pub submit: Duration,
    pub commit: Duration,
    pub query: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            proposal: Duration::from_secs(30),
            endorsement: Duration::from_secs(45),
            submit: Duration::from_secs(30),
            commit: Duration::from_secs(60),
            query: Duration::from_secs(30),
        }
    }
}

/// Process wide gateway settings.
///
/// Built once and shared behind an `Arc`; requests hold the snapshot they
/// started with, so a reload never affects work already in flight.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    identity: Identity,
    peers: Vec<PeerEndpoint>,
    orderer: Endpoint,
    channel_peers: HashMap<String, Vec<PeerId>>,
    default_peer: Option<PeerId>,
    policy: EndorsementPolicy,
    retry: RetryPolicy,
    timeouts: Timeouts,
    commit_poll_interval: Duration,
}

impl GatewayConfig {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn peers(&self) -> &[PeerEndpoint] {
        &self.peers
    }

    pub fn peer(&self, id: &PeerId) -> Option<&PeerEndpoint> {
        self.peers.iter().find(|peer| &peer.id == id)
    }

    pub fn orderer(&self) -> &Endpoint {
        &self.orderer
    }

    pub fn policy(&self) -> &EndorsementPolicy {
        &self.policy
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    pub fn commit_poll_interval(&self) -> Duration {
        self.commit_poll_interval
    }

    /// Resolves the peers of a write flow.
    ///
    /// `Default` uses the channel's configured peers, falling back to every
    /// configured peer.
    pub fn resolve_peers(
        &self,
        channel: &str,
        target: &PeerTarget,
    ) -> Result<PeerSet, GatewayError> {
        match target {
            PeerTarget::Default => match self.channel_peers.get(channel) {
                Some(peers) => PeerSet::new(peers.iter().cloned()),
                None => PeerSet::new(self.peers.iter().map(|peer| peer.id.clone())),
            },
            explicit => self.resolve_explicit(explicit),
        }
    }

    /// Resolves the peers of a query.
    ///
    /// `Default` puts the configured default peer first, so single peer
    /// queries go there.
    pub fn resolve_query_peers(
        &self,
        channel: &str,
        target: &PeerTarget,
    ) -> Result<PeerSet, GatewayError> {
        match (target, &self.default_peer) {
            (PeerTarget::Default, Some(default_peer)) => {
                let rest = self.resolve_peers(channel, target)?;
                PeerSet::new(std::iter::once(default_peer.clone()).chain(rest.iter().cloned()))
            }
            _ => self.resolve_peers(channel, target),
        }
    }

    fn resolve_explicit(&self, target: &PeerTarget) -> Result<PeerSet, GatewayError> {
        let mut resolved = vec![];
        match target {
            PeerTarget::Names(names) => {
                for name in names {
                    let id = PeerId::new(name.trim());
                    if self.peer(&id).is_none() {
                        return Err(GatewayError::validation(format!("unknown peer {}", name)));
                    }
                    resolved.push(id);
                }
            }
            PeerTarget::Indices(indices) => {
                for index in indices {
                    match self.peers.get(*index) {
                        Some(peer) => resolved.push(peer.id.clone()),
                        None => {
                            return Err(GatewayError::validation(format!(
                                "peer index {} out of range, {} peers configured",
                                index,
                                self.peers.len()
                            )));
                        }
                    }
                }
            }
            PeerTarget::Default => {}
        }
        PeerSet::new(resolved)
    }
}

/// Builder for [`GatewayConfig`].
///
/// # Examples
///
/// ```rust,ignore
///  let config = GatewayConfigBuilder::new()
///    .with_identity(identity)?
///    .with_peer("peer0", Endpoint::new("https://localhost:7051"))?
///    .with_peer("peer1", Endpoint::new("https://localhost:9051"))?
///    .with_orderer(Endpoint::new("https://localhost:7050"))?
///    .with_channel_peers("mychannel", ["peer0", "peer1"])?
///    .build()?;
/// ```
#[derive(Default)]
pub struct GatewayConfigBuilder {
    identity: Option<Identity>,
    peers: Vec<PeerEndpoint>,
    orderer: Option<Endpoint>,
    channel_peers: HashMap<String, Vec<PeerId>>,
    default_peer: Option<PeerId>,
    policy: Option<EndorsementPolicy>,
    retry: Option<RetryPolicy>,
    timeouts: Option<Timeouts>,
    commit_poll_interval: Option<Duration>,
}

impl GatewayConfigBuilder {
    pub fn new() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }

    pub fn with_identity(
        mut self,
        identity: Identity,
    ) -> Result<GatewayConfigBuilder, BuilderError> {
        self.identity = Some(identity);
        Ok(self)
    }

    pub fn with_peer(
        mut self,
        id: impl Into<String>,
        endpoint: Endpoint,
    ) -> Result<GatewayConfigBuilder, BuilderError> {
        let id = id.into().trim().to_string();
        if id.is_empty() {
            return Err(BuilderError::InvalidParameter("peer id cannot be empty".into()));
        }
        let id = PeerId::new(id);
        if self.peers.iter().any(|peer| peer.id == id) {
            return Err(BuilderError::InvalidParameter(format!(
                "peer {} configured twice",
                id
            )));
        }
        self.peers.push(PeerEndpoint { id, endpoint });
        Ok(self)
    }

    pub fn with_orderer(
        mut self,
        endpoint: Endpoint,
    ) -> Result<GatewayConfigBuilder, BuilderError> {
        if endpoint.url.trim().is_empty() {
            return Err(BuilderError::InvalidParameter(
                "orderer url cannot be empty".into(),
            ));
        }
        self.orderer = Some(endpoint);
        Ok(self)
    }

    /// Default peer set for requests on `channel` that do not name peers.
    pub fn with_channel_peers<I, S>(
        mut self,
        channel: impl Into<String>,
        peers: I,
    ) -> Result<GatewayConfigBuilder, BuilderError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let channel = channel.into().trim().to_string();
        if channel.is_empty() {
            return Err(BuilderError::InvalidParameter(
                "channel name cannot be empty".into(),
            ));
        }
        let peers: Vec<PeerId> = peers.into_iter().map(|p| PeerId::new(p)).collect();
        if peers.is_empty() {
            return Err(BuilderError::InvalidParameter(format!(
                "channel {} needs at least one peer",
                channel
            )));
        }
        self.channel_peers.insert(channel, peers);
        Ok(self)
    }

    /// Peer contacted first by single peer queries.
    pub fn with_default_peer(
        mut self,
        peer: impl Into<String>,
    ) -> Result<GatewayConfigBuilder, BuilderError> {
        self.default_peer = Some(PeerId::new(peer));
        Ok(self)
    }

    pub fn with_policy(
        mut self,
        policy: EndorsementPolicy,
    ) -> Result<GatewayConfigBuilder, BuilderError> {
        self.policy = Some(policy);
        Ok(self)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Result<GatewayConfigBuilder, BuilderError> {
        self.retry = Some(retry);
        Ok(self)
    }

    pub fn with_timeouts(
        mut self,
        timeouts: Timeouts,
    ) -> Result<GatewayConfigBuilder, BuilderError> {
        if timeouts.proposal.is_zero()
            || timeouts.endorsement.is_zero()
            || timeouts.commit.is_zero()
        {
            return Err(BuilderError::InvalidParameter(
                "timeouts must be greater than zero".into(),
            ));
        }
        self.timeouts = Some(timeouts);
        Ok(self)
    }

    pub fn with_commit_poll_interval(
        mut self,
        interval: Duration,
    ) -> Result<GatewayConfigBuilder, BuilderError> {
        if interval.is_zero() {
            return Err(BuilderError::InvalidParameter(
                "commit poll interval must be greater than zero".into(),
            ));
        }
        self.commit_poll_interval = Some(interval);
        Ok(self)
    }

    /// Collects and validates the values. Building does not contact the network.
    pub fn build(self) -> Result<GatewayConfig, BuilderError> {
        let identity = match self.identity {
            Some(identity) => identity,
            None => return Err(BuilderError::MissingParameter("identity".into())),
        };
        if self.peers.is_empty() {
            return Err(BuilderError::MissingParameter("peers".into()));
        }
        let orderer = match self.orderer {
            Some(orderer) => orderer,
            None => return Err(BuilderError::MissingParameter("orderer".into())),
        };
        let known = |id: &PeerId| self.peers.iter().any(|peer| &peer.id == id);
        for (channel, peers) in &self.channel_peers {
            if let Some(unknown) = peers.iter().find(|peer| !known(peer)) {
                return Err(BuilderError::InvalidParameter(format!(
                    "channel {} references unknown peer {}",
                    channel, unknown
                )));
            }
        }
        if let Some(default_peer) = &self.default_peer
            && !known(default_peer)
        {
            return Err(BuilderError::InvalidParameter(format!(
                "default peer {} is not configured",
                default_peer
            )));
        }
        let policy = self.policy.unwrap_or_default();
        policy.validate()?;
        Ok(GatewayConfig {
            identity,
            peers: self.peers,
            orderer,
            channel_peers: self.channel_peers,
            default_peer: self.default_peer,
            policy,
            retry: self.retry.unwrap_or_default(),
            timeouts: self.timeouts.unwrap_or_default(),
            commit_poll_interval: self.commit_poll_interval.unwrap_or(Duration::from_secs(1)),
        })
    }
}

/// Reloadable holder of the current configuration.
pub struct ConfigHandle {
    current: RwLock<Arc<GatewayConfig>>,
}

impl ConfigHandle {
    pub fn new(config: GatewayConfig) -> Self {
        ConfigHandle {
            current: RwLock::new(Arc::new(config)),
        }
    }

    /// Configuration a request keeps for its whole lifetime.
    pub fn snapshot(&self) -> Arc<GatewayConfig> {
        match self.current.read() {
            Ok(current) => current.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Swaps in a new configuration for requests started from now on.
    pub fn reload(&self, config: GatewayConfig) {
        let config = Arc::new(config);
        match self.current.write() {
            Ok(mut current) => *current = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
        tracing::info!("gateway configuration reloaded");
    }
}
