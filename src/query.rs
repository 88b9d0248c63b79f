use std::{collections::BTreeMap, sync::Arc};

use futures_util::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    config::GatewayConfig,
    error::{ClientError, ErrorKind, GatewayError, Stage},
    peer::{
        BlockInfo, ChaincodeInfo, ChannelInfo, LedgerQuery, LedgerRecord, PeerClient, PeerId,
        PeerTarget, TransactionInfo,
    },
    request::{split_chaincode_id, validate_channel_name},
    retry::with_retry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryKind {
    ListChannels,
    ChannelInfo,
    ListChaincodes,
    ChaincodeInfo,
    InstalledChaincode,
    Block,
    Transaction,
    Ledger,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::ListChannels => "LIST_CHANNELS",
            QueryKind::ChannelInfo => "CHANNEL_INFO",
            QueryKind::ListChaincodes => "LIST_CHAINCODES",
            QueryKind::ChaincodeInfo => "CHAINCODE_INFO",
            QueryKind::InstalledChaincode => "INSTALLED_CHAINCODE",
            QueryKind::Block => "BLOCK",
            QueryKind::Transaction => "TRANSACTION",
            QueryKind::Ledger => "LEDGER",
        }
    }

    fn needs_channel(&self) -> bool {
        !matches!(self, QueryKind::ListChannels | QueryKind::InstalledChaincode)
    }
}

/// What a query looks up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum QuerySelector {
    #[default]
    None,
    /// `name` or `name@version`.
    ChaincodeId(String),
    BlockNumber(u64),
    /// Hex encoded block hash.
    BlockHash(String),
    TransactionId(String),
    Chaincode { chaincode_id: String, args: Vec<String> },
}

/// Loose parameters of a generic ledger query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerParams {
    pub chaincode_id: Option<String>,
    pub block_id: Option<u64>,
    pub block_hash: Option<String>,
    pub txn_id: Option<String>,
    pub args: Vec<String>,
}

impl QuerySelector {
    /// Picks the selector of a ledger query. A transaction id wins over a
    /// block number, which wins over a block hash, which wins over a
    /// chaincode query.
    pub fn from_ledger_params(params: LedgerParams) -> Result<QuerySelector, GatewayError> {
        let present = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        if let Some(txn_id) = present(&params.txn_id) {
            return Ok(QuerySelector::TransactionId(txn_id));
        }
        if let Some(block_id) = params.block_id {
            return Ok(QuerySelector::BlockNumber(block_id));
        }
        if let Some(block_hash) = present(&params.block_hash) {
            return Ok(QuerySelector::BlockHash(block_hash));
        }
        if let Some(chaincode_id) = present(&params.chaincode_id) {
            return Ok(QuerySelector::Chaincode {
                chaincode_id,
                args: params.args,
            });
        }
        Err(GatewayError::validation(
            "ledger query needs a transaction id, block id, block hash or chaincode id",
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum QueryResult {
    Channels(Vec<String>),
    ChannelInfo(ChannelInfo),
    Chaincodes(Vec<ChaincodeInfo>),
    Chaincode(ChaincodeInfo),
    /// One entry per targeted peer; install state differs between peers.
    Installed(BTreeMap<PeerId, Result<ChaincodeInfo, GatewayError>>),
    Block(BlockInfo),
    Transaction(TransactionInfo),
    Payload(Vec<u8>),
}

/// Answers read requests from a single authoritative peer, or from every
/// targeted peer for installed chaincode lookups.
pub struct QueryDispatcher {
    peers: Arc<dyn PeerClient>,
}

impl QueryDispatcher {
    pub fn new(peers: Arc<dyn PeerClient>) -> Self {
        QueryDispatcher { peers }
    }

    pub async fn query(
        &self,
        config: &GatewayConfig,
        kind: QueryKind,
        channel: &str,
        selector: QuerySelector,
        target: &PeerTarget,
        cancel: &CancellationToken,
    ) -> Result<QueryResult, GatewayError> {
        let request = plan(kind, channel, selector)?;
        let peers = config.resolve_query_peers(channel, target)?;
        debug!(query = kind.as_str(), channel, peer = %peers.first(), "dispatching query");

        let answer = async {
            match request {
                Planned::Installed(chaincode_id) => {
                    let lookups = peers
                        .iter()
                        .map(|peer| self.installed_on(config, peer, &chaincode_id));
                    Ok(QueryResult::Installed(join_all(lookups).await.into_iter().collect()))
                }
                Planned::ChannelInfo => {
                    let peer = peers.first();
                    let timeout = config.timeouts().query;
                    let info = with_retry(config.retry(), timeout, "channel info", Some(peer), || {
                        self.peers.get_channel_info(peer, channel, timeout)
                    })
                    .await
                    .map_err(|err| unavailable(err, peer))?;
                    Ok(QueryResult::ChannelInfo(info))
                }
                Planned::Ledger { channel, query, find } => {
                    let peer = peers.first();
                    let timeout = config.timeouts().query;
                    let record =
                        with_retry(config.retry(), timeout, "ledger query", Some(peer), || {
                            self.peers.query_ledger(peer, channel, &query, timeout)
                        })
                        .await
                        .map_err(|err| unavailable(err, peer))?;
                    into_result(record, find.as_deref(), peer)
                }
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GatewayError::cancelled(Stage::Query)),
            answer = answer => {
                if let Err(err) = &answer {
                    warn!(
                        query = kind.as_str(),
                        channel,
                        kind = %err.kind,
                        "query failed: {}",
                        err.message
                    );
                }
                answer
            }
        }
    }

    async fn installed_on(
        &self,
        config: &GatewayConfig,
        peer: &PeerId,
        chaincode_id: &str,
    ) -> (PeerId, Result<ChaincodeInfo, GatewayError>) {
        let timeout = config.timeouts().query;
        let installed = with_retry(config.retry(), timeout, "installed chaincodes", Some(peer), || {
            self.peers.query_installed(peer, timeout)
        })
        .await;
        let result = match installed {
            Ok(chaincodes) => match chaincodes.into_iter().find(|cc| cc.matches(chaincode_id)) {
                Some(chaincode) => Ok(chaincode),
                None => Err(GatewayError::new(
                    ErrorKind::NotFound,
                    Stage::Query,
                    format!("chaincode {} is not installed", chaincode_id),
                )
                .with_peer(peer.clone())),
            },
            Err(err) => Err(unavailable(err, peer)),
        };
        (peer.clone(), result)
    }
}

enum Planned<'a> {
    Installed(String),
    ChannelInfo,
    Ledger {
        channel: &'a str,
        query: LedgerQuery,
        /// Chaincode id to pick out of an instantiated chaincode list.
        find: Option<String>,
    },
}

/// Checks that `selector` fits `kind` and maps it to a peer call. Runs before
/// any peer is contacted.
fn plan(
    kind: QueryKind,
    channel: &str,
    selector: QuerySelector,
) -> Result<Planned<'_>, GatewayError> {
    if kind.needs_channel() {
        validate_channel_name(channel)?;
    }
    let ledger = |query| Planned::Ledger {
        channel,
        query,
        find: None,
    };
    let planned = match (kind, selector) {
        (QueryKind::ListChannels, QuerySelector::None) => Planned::Ledger {
            channel: "",
            query: LedgerQuery::Channels,
            find: None,
        },
        (QueryKind::ChannelInfo, QuerySelector::None) => Planned::ChannelInfo,
        (QueryKind::ListChaincodes, QuerySelector::None) => {
            ledger(LedgerQuery::InstantiatedChaincodes)
        }
        (QueryKind::ChaincodeInfo, QuerySelector::ChaincodeId(id)) => Planned::Ledger {
            channel,
            query: LedgerQuery::InstantiatedChaincodes,
            find: Some(chaincode_id(&id)?),
        },
        (QueryKind::InstalledChaincode, QuerySelector::ChaincodeId(id)) => {
            Planned::Installed(chaincode_id(&id)?)
        }
        (QueryKind::Block | QueryKind::Ledger, QuerySelector::BlockNumber(number)) => {
            ledger(LedgerQuery::BlockByNumber(number))
        }
        (QueryKind::Block | QueryKind::Ledger, QuerySelector::BlockHash(hash)) => {
            let hash = match hex::decode(hash.trim()) {
                Ok(hash) if !hash.is_empty() => hash,
                _ => {
                    return Err(GatewayError::validation(format!(
                        "block hash {} is not hex encoded",
                        hash
                    )));
                }
            };
            ledger(LedgerQuery::BlockByHash(hash))
        }
        (QueryKind::Transaction | QueryKind::Ledger, QuerySelector::TransactionId(tx_id)) => {
            if tx_id.trim().is_empty() {
                return Err(GatewayError::validation("transaction id cannot be empty"));
            }
            ledger(LedgerQuery::TransactionById(tx_id.trim().to_string()))
        }
        (QueryKind::Ledger, QuerySelector::Chaincode { chaincode_id: id, args }) => {
            if args.first().is_none_or(|function| function.trim().is_empty()) {
                return Err(GatewayError::validation(
                    "chaincode query needs the function name as first argument",
                ));
            }
            ledger(LedgerQuery::Chaincode {
                chaincode_id: chaincode_id(&id)?,
                args,
            })
        }
        (kind, selector) => {
            return Err(GatewayError::validation(format!(
                "{} query does not accept selector {:?}",
                kind.as_str(),
                selector
            )));
        }
    };
    Ok(planned)
}

fn chaincode_id(id: &str) -> Result<String, GatewayError> {
    let (name, _) = split_chaincode_id(id);
    if name.is_empty() {
        return Err(GatewayError::validation("chaincode id cannot be empty"));
    }
    Ok(id.trim().to_string())
}

fn unavailable(err: ClientError, peer: &PeerId) -> GatewayError {
    GatewayError::from_client(err, Stage::Query, Some(peer.clone()), ErrorKind::UpstreamUnavailable)
}

fn into_result(
    record: LedgerRecord,
    find: Option<&str>,
    peer: &PeerId,
) -> Result<QueryResult, GatewayError> {
    let result = match (record, find) {
        (LedgerRecord::Chaincodes(chaincodes), Some(id)) => {
            match chaincodes.into_iter().find(|cc| cc.matches(id)) {
                Some(chaincode) => QueryResult::Chaincode(chaincode),
                None => {
                    return Err(GatewayError::new(
                        ErrorKind::NotFound,
                        Stage::Query,
                        format!("chaincode {} is not instantiated", id),
                    )
                    .with_peer(peer.clone()));
                }
            }
        }
        (LedgerRecord::Channels(channels), None) => QueryResult::Channels(channels),
        (LedgerRecord::Chaincodes(chaincodes), None) => QueryResult::Chaincodes(chaincodes),
        (LedgerRecord::Block(block), None) => QueryResult::Block(block),
        (LedgerRecord::Transaction(transaction), None) => QueryResult::Transaction(transaction),
        (LedgerRecord::Payload(payload), None) => QueryResult::Payload(payload),
        (record, _) => {
            return Err(GatewayError::new(
                ErrorKind::MalformedResponse,
                Stage::Query,
                format!("unexpected ledger record {:?}", record),
            )
            .with_peer(peer.clone()));
        }
    };
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_id_takes_precedence() {
        let selector = QuerySelector::from_ledger_params(LedgerParams {
            chaincode_id: Some("basic".into()),
            block_id: Some(4),
            block_hash: Some("abc123".into()),
            txn_id: Some("tx1".into()),
            args: vec![],
        })
        .unwrap();
        assert_eq!(selector, QuerySelector::TransactionId("tx1".into()));
    }

    #[test]
    fn block_number_beats_hash_and_chaincode() {
        let selector = QuerySelector::from_ledger_params(LedgerParams {
            chaincode_id: Some("basic".into()),
            block_id: Some(0),
            block_hash: Some("abc123".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(selector, QuerySelector::BlockNumber(0));

        let selector = QuerySelector::from_ledger_params(LedgerParams {
            chaincode_id: Some("basic".into()),
            block_hash: Some("abc123".into()),
            txn_id: Some("  ".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(selector, QuerySelector::BlockHash("abc123".into()));
    }

    #[test]
    fn chaincode_query_keeps_args() {
        let selector = QuerySelector::from_ledger_params(LedgerParams {
            chaincode_id: Some("basic@1.0".into()),
            args: vec!["ReadAsset".into(), "asset1".into()],
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            selector,
            QuerySelector::Chaincode {
                chaincode_id: "basic@1.0".into(),
                args: vec!["ReadAsset".into(), "asset1".into()],
            }
        );
    }

    #[test]
    fn empty_ledger_params_are_invalid() {
        let err = QuerySelector::from_ledger_params(LedgerParams::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[test]
    fn selector_must_fit_the_kind() {
        let err = plan(QueryKind::Block, "mychannel", QuerySelector::TransactionId("tx1".into()))
            .err()
            .unwrap();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(plan(QueryKind::ChannelInfo, "Bad Channel", QuerySelector::None).is_err());
        assert!(plan(QueryKind::ListChannels, "", QuerySelector::None).is_ok());
        let no_function = QuerySelector::Chaincode {
            chaincode_id: "basic".into(),
            args: vec![],
        };
        assert!(plan(QueryKind::Ledger, "mychannel", no_function).is_err());
    }

    #[test]
    fn block_hash_must_be_hex() {
        let selector = QuerySelector::BlockHash("xyz".into());
        assert!(plan(QueryKind::Block, "mychannel", selector).is_err());
        match plan(QueryKind::Block, "mychannel", QuerySelector::BlockHash("abc123".into())) {
            Ok(Planned::Ledger {
                query: LedgerQuery::BlockByHash(hash),
                ..
            }) => assert_eq!(hash, vec![0xab, 0xc1, 0x23]),
            _ => panic!("expected a block by hash lookup"),
        }
    }
}
