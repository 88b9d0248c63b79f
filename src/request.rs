use std::collections::HashMap;

use prost::Message;
use serde::Serialize;

use crate::{
    error::GatewayError,
    fabric::protos::{
        CHAINCODE_TYPE_GOLANG, ChaincodeDeploymentSpec, ChaincodeId, ChaincodeInput, ChaincodeSpec,
    },
    identity::Identity,
    orchestrator::FlowKind,
    transaction::{Proposal, ProposalBuilder},
};

const LIFECYCLE_CHAINCODE: &str = "lscc";
const CONFIGURATION_CHAINCODE: &str = "cscc";
const MAX_CHANNEL_NAME_LENGTH: usize = 249;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChaincodeDescriptor {
    pub name: String,
    pub version: String,
    pub path: String,
    /// Endorsement policy set at instantiate or upgrade time.
    pub policy: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelDescriptor {
    pub name: String,
    pub version: u64,
    pub policy: Option<String>,
}

/// Chaincode invocation to endorse and commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionRequest {
    /// `name` or `name@version`.
    pub chaincode_id: String,
    pub function: String,
    pub args: Vec<String>,
    pub transient: HashMap<String, Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChaincodeInstallRequest {
    pub chaincode: ChaincodeDescriptor,
    pub package: Vec<u8>,
}

/// Instantiate or upgrade of an installed chaincode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChaincodeDeployRequest {
    pub chaincode: ChaincodeDescriptor,
    /// Init function, `init` when empty.
    pub function: String,
    pub args: Vec<String>,
}

/// Channel creation or update.
///
/// The gateway endorses `config_update` as a `cscc` proposal and orders the
/// result like any other transaction. A stock Fabric 1.x network has no such
/// `cscc` function: there a channel is created or updated by broadcasting the
/// signed CONFIG_UPDATE envelope straight to the orderer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelRequest {
    pub channel: ChannelDescriptor,
    /// Serialized config update envelope.
    pub config_update: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinRequest {
    pub genesis_block: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowPayload {
    Transaction(TransactionRequest),
    Install(ChaincodeInstallRequest),
    Instantiate(ChaincodeDeployRequest),
    Upgrade(ChaincodeDeployRequest),
    CreateChannel(ChannelRequest),
    UpdateChannel(ChannelRequest),
    JoinPeer(JoinRequest),
}

impl FlowPayload {
    pub fn kind(&self) -> FlowKind {
        match self {
            FlowPayload::Transaction(_) => FlowKind::SubmitTransaction,
            FlowPayload::Install(_) => FlowKind::InstallChaincode,
            FlowPayload::Instantiate(_) => FlowKind::InstantiateChaincode,
            FlowPayload::Upgrade(_) => FlowKind::UpgradeChaincode,
            FlowPayload::CreateChannel(_) => FlowKind::CreateChannel,
            FlowPayload::UpdateChannel(_) => FlowKind::UpdateChannel,
            FlowPayload::JoinPeer(_) => FlowKind::JoinPeer,
        }
    }

    /// Checks the payload before any peer is contacted.
    pub(crate) fn validate(&self, channel: &str) -> Result<(), GatewayError> {
        match self {
            FlowPayload::Install(request) => validate_chaincode(&request.chaincode, true)?,
            _ => validate_channel_name(channel)?,
        }
        match self {
            FlowPayload::Transaction(request) => {
                let (name, _) = split_chaincode_id(&request.chaincode_id);
                if name.is_empty() {
                    return Err(GatewayError::validation("chaincode id cannot be empty"));
                }
                if request.function.trim().is_empty() {
                    return Err(GatewayError::validation("function cannot be empty"));
                }
            }
            FlowPayload::Install(request) => {
                if request.package.is_empty() {
                    return Err(GatewayError::validation("chaincode package cannot be empty"));
                }
            }
            FlowPayload::Instantiate(request) | FlowPayload::Upgrade(request) => {
                validate_chaincode(&request.chaincode, false)?;
            }
            FlowPayload::CreateChannel(request) | FlowPayload::UpdateChannel(request) => {
                if !request.channel.name.is_empty() && request.channel.name != channel {
                    return Err(GatewayError::validation(format!(
                        "channel request names {} but targets {}",
                        request.channel.name, channel
                    )));
                }
                if request.config_update.is_empty() {
                    return Err(GatewayError::validation("config update cannot be empty"));
                }
            }
            FlowPayload::JoinPeer(request) => {
                if request.genesis_block.is_empty() {
                    return Err(GatewayError::validation("genesis block cannot be empty"));
                }
            }
        }
        Ok(())
    }

    /// Proposal the flow sends to its peers.
    pub(crate) fn to_proposal(
        &self,
        channel: &str,
        creator: &Identity,
    ) -> Result<Proposal, GatewayError> {
        let builder = ProposalBuilder::new(creator.clone());
        let built = match self {
            FlowPayload::Transaction(request) => {
                let (name, version) = split_chaincode_id(&request.chaincode_id);
                builder
                    .with_channel_name(channel)?
                    .with_chaincode_id(name)?
                    .with_chaincode_version(version)?
                    .with_function_name(request.function.as_str())?
                    .with_function_args(request.args.iter().map(String::as_str))?
                    .with_transient(request.transient.clone())?
                    .build()
            }
            FlowPayload::Install(request) => builder
                .with_chaincode_id(LIFECYCLE_CHAINCODE)?
                .with_function_name("install")?
                .with_function_args([deployment_spec(
                    &request.chaincode,
                    "",
                    &[],
                    &request.package,
                )])?
                .build(),
            FlowPayload::Instantiate(request) | FlowPayload::Upgrade(request) => {
                let function = if matches!(self, FlowPayload::Upgrade(_)) {
                    "upgrade"
                } else {
                    "deploy"
                };
                let init = if request.function.trim().is_empty() {
                    "init"
                } else {
                    request.function.trim()
                };
                let mut args = vec![
                    channel.as_bytes().to_vec(),
                    deployment_spec(&request.chaincode, init, &request.args, &[]),
                ];
                if let Some(policy) = &request.chaincode.policy {
                    args.push(policy.as_bytes().to_vec());
                }
                builder
                    .with_channel_name(channel)?
                    .with_chaincode_id(LIFECYCLE_CHAINCODE)?
                    .with_function_name(function)?
                    .with_function_args(args)?
                    .build()
            }
            // Endorses the config update through cscc. A stock Fabric network
            // creates and updates channels from a CONFIG_UPDATE envelope
            // broadcast to the orderer; this proposal only covers gateways
            // whose peers expose a simulation entry point for it.
            FlowPayload::CreateChannel(request) | FlowPayload::UpdateChannel(request) => builder
                .with_channel_name(channel)?
                .with_chaincode_id(CONFIGURATION_CHAINCODE)?
                .with_function_name("SimulateConfigTreeUpdate")?
                .with_function_args([channel.as_bytes().to_vec(), request.config_update.clone()])?
                .build(),
            FlowPayload::JoinPeer(request) => builder
                .with_chaincode_id(CONFIGURATION_CHAINCODE)?
                .with_function_name("JoinChain")?
                .with_function_args([request.genesis_block.clone()])?
                .build(),
        };
        Ok(built?)
    }
}

/// Splits `name@version`; the version is empty when absent.
pub(crate) fn split_chaincode_id(id: &str) -> (&str, &str) {
    let id = id.trim();
    match id.split_once('@') {
        Some((name, version)) => (name, version),
        None => (id, ""),
    }
}

/// Fabric channel names: lower case letter first, then lower case
/// alphanumerics, `.` or `-`.
pub(crate) fn validate_channel_name(channel: &str) -> Result<(), GatewayError> {
    if channel.is_empty() {
        return Err(GatewayError::validation("channel name cannot be empty"));
    }
    if channel.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err(GatewayError::validation(format!(
            "channel name longer than {} characters",
            MAX_CHANNEL_NAME_LENGTH
        )));
    }
    let mut chars = channel.chars();
    let starts_with_letter = chars.next().is_some_and(|c| c.is_ascii_lowercase());
    let rest_valid =
        chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-');
    if !starts_with_letter || !rest_valid {
        return Err(GatewayError::validation(format!(
            "invalid channel name {}",
            channel
        )));
    }
    Ok(())
}

fn validate_chaincode(
    chaincode: &ChaincodeDescriptor,
    needs_path: bool,
) -> Result<(), GatewayError> {
    if chaincode.name.trim().is_empty() {
        return Err(GatewayError::validation("chaincode name cannot be empty"));
    }
    if chaincode.name.contains('@') {
        return Err(GatewayError::validation("chaincode name cannot contain '@'"));
    }
    if chaincode.version.trim().is_empty() {
        return Err(GatewayError::validation("chaincode version cannot be empty"));
    }
    if needs_path && chaincode.path.trim().is_empty() {
        return Err(GatewayError::validation("chaincode path cannot be empty"));
    }
    Ok(())
}

fn deployment_spec(
    chaincode: &ChaincodeDescriptor,
    function: &str,
    args: &[String],
    package: &[u8],
) -> Vec<u8> {
    let mut input = vec![];
    if !function.is_empty() {
        input.push(function.as_bytes().to_vec());
        input.extend(args.iter().map(|arg| arg.as_bytes().to_vec()));
    }
    ChaincodeDeploymentSpec {
        chaincode_spec: Some(ChaincodeSpec {
            r#type: CHAINCODE_TYPE_GOLANG,
            chaincode_id: Some(ChaincodeId {
                path: chaincode.path.clone(),
                name: chaincode.name.clone(),
                version: chaincode.version.clone(),
            }),
            input: Some(ChaincodeInput {
                args: input,
                decorations: HashMap::default(),
                is_init: false,
            }),
            timeout: 0,
        }),
        code_package: package.to_vec(),
    }
    .encode_to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ErrorKind, identity::IdentityBuilder};

    fn identity() -> Identity {
        IdentityBuilder::from_pem(b"cert")
            .with_msp("Org1MSP")
            .unwrap()
            .build()
            .unwrap()
    }

    fn chaincode() -> ChaincodeDescriptor {
        ChaincodeDescriptor {
            name: "cc1".into(),
            version: "1.0".into(),
            path: "github.com/example/cc1".into(),
            policy: None,
        }
    }

    #[test]
    fn channel_names_follow_fabric_rules() {
        assert!(validate_channel_name("mychannel").is_ok());
        assert!(validate_channel_name("my-channel.2").is_ok());
        assert!(validate_channel_name("MyChannel").is_err());
        assert!(validate_channel_name("1channel").is_err());
        assert!(validate_channel_name("").is_err());
    }

    #[test]
    fn transaction_proposal_splits_versioned_ids() {
        let payload = FlowPayload::Transaction(TransactionRequest {
            chaincode_id: "basic@2.1".into(),
            function: "CreateAsset".into(),
            args: vec!["asset1".into()],
            ..Default::default()
        });
        payload.validate("mychannel").unwrap();
        let proposal = payload.to_proposal("mychannel", &identity()).unwrap();
        assert_eq!(proposal.chaincode_name(), "basic");
        assert_eq!(proposal.chaincode_version(), "2.1");
        assert_eq!(proposal.channel_name(), "mychannel");
    }

    #[test]
    fn install_is_channel_less_lscc_call() {
        let payload = FlowPayload::Install(ChaincodeInstallRequest {
            chaincode: chaincode(),
            package: vec![0x1f, 0x8b],
        });
        payload.validate("").unwrap();
        let proposal = payload.to_proposal("", &identity()).unwrap();
        assert_eq!(proposal.chaincode_name(), "lscc");
        assert_eq!(proposal.function_name(), "install");
        assert_eq!(proposal.channel_name(), "");
        let spec = ChaincodeDeploymentSpec::decode(proposal.function_args()[0].as_slice()).unwrap();
        assert_eq!(spec.chaincode_spec.unwrap().chaincode_id.unwrap().version, "1.0");
    }

    #[test]
    fn upgrade_targets_lscc_upgrade_with_policy() {
        let mut descriptor = chaincode();
        descriptor.policy = Some("OR('Org1MSP.member')".into());
        let payload = FlowPayload::Upgrade(ChaincodeDeployRequest {
            chaincode: descriptor,
            function: String::new(),
            args: vec![],
        });
        let proposal = payload.to_proposal("mychannel", &identity()).unwrap();
        assert_eq!(proposal.function_name(), "upgrade");
        assert_eq!(proposal.function_args().len(), 3);
        assert_eq!(proposal.function_args()[0], b"mychannel".to_vec());
    }

    #[test]
    fn channel_request_must_match_target_channel() {
        let payload = FlowPayload::CreateChannel(ChannelRequest {
            channel: ChannelDescriptor {
                name: "other".into(),
                ..Default::default()
            },
            config_update: vec![1],
        });
        let err = payload.validate("mychannel").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[test]
    fn channel_update_is_a_cscc_proposal_carrying_the_config_update() {
        let payload = FlowPayload::UpdateChannel(ChannelRequest {
            channel: ChannelDescriptor {
                name: "mychannel".into(),
                ..Default::default()
            },
            config_update: vec![0x0a, 0x02],
        });
        payload.validate("mychannel").unwrap();
        let proposal = payload.to_proposal("mychannel", &identity()).unwrap();
        assert_eq!(proposal.chaincode_name(), "cscc");
        assert_eq!(proposal.function_name(), "SimulateConfigTreeUpdate");
        assert_eq!(
            proposal.function_args(),
            &[b"mychannel".to_vec(), vec![0x0a, 0x02]]
        );
    }

    #[test]
    fn empty_payload_fields_are_rejected() {
        let join = FlowPayload::JoinPeer(JoinRequest::default());
        assert!(join.validate("mychannel").is_err());
        let tx = FlowPayload::Transaction(TransactionRequest {
            chaincode_id: "@1.0".into(),
            function: "f".into(),
            ..Default::default()
        });
        assert!(tx.validate("mychannel").is_err());
    }
}
