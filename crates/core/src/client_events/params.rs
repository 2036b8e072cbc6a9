//! Call parameter decoding and validation.
//!
//! Everything a handler needs is checked here, before any ledger call is made.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::ledger::{ChaincodeRef, Identity, TargetNode, TransactionCall};

#[derive(Debug, Error)]
pub(crate) enum ParamsError {
    #[error("missing required parameter `{0}`")]
    Missing(&'static str),
    #[error("invalid parameter `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("malformed params: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawParams {
    identity: Option<RawIdentity>,
    target: Option<RawTarget>,
    channel: Option<String>,
    chaincode: Option<RawChaincode>,
    function: Option<String>,
    args: Option<Vec<String>>,
    event_type: Option<String>,
    start_block: Option<RawStartBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawIdentity {
    msp_id: Option<String>,
    certificate: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTarget {
    name: Option<String>,
    address: Option<String>,
    tls_root_cert: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawChaincode {
    Name(String),
    Scoped {
        name: Option<String>,
        contract: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawStartBlock {
    Number(u64),
    Text(String),
}

/// Parameters of evaluate and submit calls.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TransactionParams {
    pub identity: Identity,
    pub target: TargetNode,
    pub call: TransactionCall,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EventKind {
    Chaincode(String),
    Block,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SubscribeParams {
    pub identity: Identity,
    pub target: TargetNode,
    pub channel: String,
    pub events: EventKind,
    pub start_block: Option<u64>,
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ParamsError> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ParamsError::Missing(field)),
    }
}

fn parse_object(params: Value) -> Result<RawParams, ParamsError> {
    match params {
        Value::Object(_) => Ok(serde_json::from_value(params)?),
        Value::Null => Err(ParamsError::Missing("params")),
        _ => Err(ParamsError::Invalid {
            field: "params",
            reason: "expected an object".into(),
        }),
    }
}

impl RawParams {
    fn identity(&mut self) -> Result<Identity, ParamsError> {
        let raw = self
            .identity
            .take()
            .ok_or(ParamsError::Missing("identity"))?;
        Ok(Identity {
            msp_id: required(raw.msp_id, "identity.mspId")?,
            certificate: required(raw.certificate, "identity.certificate")?,
        })
    }

    fn target(&mut self) -> Result<TargetNode, ParamsError> {
        let raw = self.target.take().ok_or(ParamsError::Missing("target"))?;
        Ok(TargetNode {
            name: required(raw.name, "target.name")?,
            address: required(raw.address, "target.address")?,
            tls_root_cert: raw.tls_root_cert.filter(|pem| !pem.trim().is_empty()),
        })
    }

    fn chaincode(&mut self) -> Result<ChaincodeRef, ParamsError> {
        match self.chaincode.take() {
            Some(RawChaincode::Name(name)) => Ok(ChaincodeRef::Simple(required(
                Some(name),
                "chaincode",
            )?)),
            Some(RawChaincode::Scoped { name, contract }) => {
                let name = required(name, "chaincode.name")?;
                Ok(match contract.filter(|c| !c.trim().is_empty()) {
                    Some(contract) => ChaincodeRef::WithContract { name, contract },
                    None => ChaincodeRef::Simple(name),
                })
            }
            None => Err(ParamsError::Missing("chaincode")),
        }
    }

    fn start_block(&mut self) -> Result<Option<u64>, ParamsError> {
        match self.start_block.take() {
            None => Ok(None),
            Some(RawStartBlock::Number(number)) => Ok(Some(number)),
            Some(RawStartBlock::Text(text)) => {
                text.trim()
                    .parse()
                    .map(Some)
                    .map_err(|_| ParamsError::Invalid {
                        field: "startBlock",
                        reason: format!("`{text}` is not a block number"),
                    })
            }
        }
    }
}

pub(crate) fn transaction_params(params: Value) -> Result<TransactionParams, ParamsError> {
    let mut raw = parse_object(params)?;
    let identity = raw.identity()?;
    let target = raw.target()?;
    let channel = required(raw.channel.take(), "channel")?;
    let chaincode = raw.chaincode()?;
    let function = required(raw.function.take(), "function")?;
    Ok(TransactionParams {
        identity,
        target,
        call: TransactionCall {
            channel,
            chaincode,
            function,
            args: raw.args.take().unwrap_or_default(),
        },
    })
}

pub(crate) fn subscribe_params(params: Value) -> Result<SubscribeParams, ParamsError> {
    let mut raw = parse_object(params)?;
    let identity = raw.identity()?;
    let target = raw.target()?;
    let channel = required(raw.channel.take(), "channel")?;
    let events = match required(raw.event_type.take(), "eventType")?.as_str() {
        "chaincode" => EventKind::Chaincode(raw.chaincode()?.name().to_owned()),
        "block" => EventKind::Block,
        other => {
            return Err(ParamsError::Invalid {
                field: "eventType",
                reason: format!("expected \"chaincode\" or \"block\", got \"{other}\""),
            })
        }
    };
    Ok(SubscribeParams {
        identity,
        target,
        channel,
        events,
        start_block: raw.start_block()?,
    })
}

/// Accepts `{"subscriptionId": id}` or `[id]`.
pub(crate) fn unsubscribe_params(params: Value) -> Result<String, ParamsError> {
    let id = match params {
        Value::Object(mut fields) => fields.remove("subscriptionId"),
        Value::Array(items) => items.into_iter().next(),
        _ => None,
    };
    match id {
        Some(Value::String(id)) if !id.is_empty() => Ok(id),
        Some(Value::Null) | None => Err(ParamsError::Missing("subscriptionId")),
        Some(_) => Err(ParamsError::Invalid {
            field: "subscriptionId",
            reason: "expected a string".into(),
        }),
    }
}
