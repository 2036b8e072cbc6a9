//! Construction of signed proposals, seek envelopes and the transaction id.

use std::time::SystemTime;

use prost::Message;
use sha2::{Digest, Sha256};

use super::protos;
use crate::ledger::{Identity, LedgerError, TransactionCall};

const NONCE_LEN: usize = 24;

/// Serialized creator identity, as embedded in signature headers and requests.
pub(super) fn creator(identity: &Identity) -> Vec<u8> {
    protos::SerializedIdentity {
        mspid: identity.msp_id.clone(),
        id_bytes: identity.certificate.as_bytes().to_vec(),
    }
    .encode_to_vec()
}

pub(super) fn nonce() -> Vec<u8> {
    rand::random::<[u8; NONCE_LEN]>().to_vec()
}

/// `hex(sha256(nonce ‖ creator))`
pub(super) fn transaction_id(nonce: &[u8], creator: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(nonce);
    hasher.update(creator);
    hex::encode(hasher.finalize())
}

/// Digest handed to the signer for any signed message.
pub(super) fn digest(message: &[u8]) -> Vec<u8> {
    Sha256::digest(message).to_vec()
}

fn header(
    channel_header: protos::ChannelHeader,
    creator: Vec<u8>,
    nonce: Vec<u8>,
) -> protos::Header {
    protos::Header {
        channel_header: channel_header.encode_to_vec(),
        signature_header: protos::SignatureHeader { creator, nonce }.encode_to_vec(),
    }
}

/// Unsigned chaincode proposal and its transaction id.
#[derive(Debug, Clone)]
pub(super) struct PreparedProposal {
    pub tx_id: String,
    pub bytes: Vec<u8>,
}

pub(super) fn chaincode_proposal(identity: &Identity, call: &TransactionCall) -> PreparedProposal {
    let creator = creator(identity);
    let nonce = nonce();
    let tx_id = transaction_id(&nonce, &creator);
    let chaincode_id = protos::ChaincodeId {
        name: call.chaincode.name().to_owned(),
        ..Default::default()
    };

    let channel_header = protos::ChannelHeader {
        r#type: protos::HEADER_TYPE_ENDORSER_TRANSACTION,
        timestamp: Some(prost_types::Timestamp::from(SystemTime::now())),
        channel_id: call.channel.clone(),
        tx_id: tx_id.clone(),
        extension: protos::ChaincodeHeaderExtension {
            chaincode_id: Some(chaincode_id.clone()),
        }
        .encode_to_vec(),
        ..Default::default()
    };

    let mut args = Vec::with_capacity(call.args.len() + 1);
    args.push(call.chaincode.qualified_function(&call.function).into_bytes());
    args.extend(call.args.iter().map(|arg| arg.as_bytes().to_vec()));
    let invocation = protos::ChaincodeInvocationSpec {
        chaincode_spec: Some(protos::ChaincodeSpec {
            r#type: protos::CHAINCODE_TYPE_UNDEFINED,
            chaincode_id: Some(chaincode_id),
            input: Some(protos::ChaincodeInput { args }),
        }),
    };

    let proposal = protos::Proposal {
        header: header(channel_header, creator, nonce).encode_to_vec(),
        payload: protos::ChaincodeProposalPayload {
            input: invocation.encode_to_vec(),
        }
        .encode_to_vec(),
    };
    PreparedProposal {
        tx_id,
        bytes: proposal.encode_to_vec(),
    }
}

/// Unsigned deliver payload requesting every block from `start` onwards.
pub(super) fn seek_payload(identity: &Identity, channel: &str, start: Option<u64>) -> Vec<u8> {
    let channel_header = protos::ChannelHeader {
        r#type: protos::HEADER_TYPE_DELIVER_SEEK_INFO,
        timestamp: Some(prost_types::Timestamp::from(SystemTime::now())),
        channel_id: channel.to_owned(),
        ..Default::default()
    };
    let seek = protos::SeekInfo {
        start: Some(start.map_or_else(
            protos::SeekPosition::newest,
            protos::SeekPosition::specified,
        )),
        stop: Some(protos::SeekPosition::specified(u64::MAX)),
        behavior: protos::SEEK_BEHAVIOR_BLOCK_UNTIL_READY,
    };
    protos::Payload {
        header: Some(header(channel_header, creator(identity), nonce())),
        data: seek.encode_to_vec(),
    }
    .encode_to_vec()
}

/// Extracts the chaincode response payload from an endorsed transaction envelope.
pub(super) fn endorsed_result(envelope: &protos::Envelope) -> Result<Vec<u8>, LedgerError> {
    fn decode<M: Message + Default>(bytes: &[u8], what: &str) -> Result<M, LedgerError> {
        M::decode(bytes).map_err(|err| LedgerError::InvalidResponse(format!("{what}: {err}")))
    }

    let payload: protos::Payload = decode(&envelope.payload, "payload")?;
    let transaction: protos::Transaction = decode(&payload.data, "transaction")?;
    let action = transaction
        .actions
        .first()
        .ok_or_else(|| LedgerError::InvalidResponse("transaction has no actions".into()))?;
    let action_payload: protos::ChaincodeActionPayload =
        decode(&action.payload, "chaincode action payload")?;
    let endorsed = action_payload
        .action
        .ok_or_else(|| LedgerError::InvalidResponse("missing endorsed action".into()))?;
    let response_payload: protos::ProposalResponsePayload =
        decode(&endorsed.proposal_response_payload, "proposal response payload")?;
    let chaincode_action: protos::ChaincodeAction =
        decode(&response_payload.extension, "chaincode action")?;
    Ok(chaincode_action
        .response
        .map(|response| response.payload)
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ledger::ChaincodeRef, test_utils};

    fn decode_proposal(
        bytes: &[u8],
    ) -> (
        protos::ChannelHeader,
        protos::SignatureHeader,
        protos::ChaincodeSpec,
    ) {
        let proposal = protos::Proposal::decode(bytes).unwrap();
        let header = protos::Header::decode(proposal.header.as_slice()).unwrap();
        let channel_header =
            protos::ChannelHeader::decode(header.channel_header.as_slice()).unwrap();
        let signature_header =
            protos::SignatureHeader::decode(header.signature_header.as_slice()).unwrap();
        let payload =
            protos::ChaincodeProposalPayload::decode(proposal.payload.as_slice()).unwrap();
        let spec = protos::ChaincodeInvocationSpec::decode(payload.input.as_slice())
            .unwrap()
            .chaincode_spec
            .unwrap();
        (channel_header, signature_header, spec)
    }

    #[test]
    fn transaction_id_hashes_nonce_and_creator() {
        let tx_id = transaction_id(b"nonce", b"creator");
        assert_eq!(tx_id, hex::encode(Sha256::digest(b"noncecreator")));
        assert_eq!(tx_id.len(), 64);
    }

    #[test]
    fn proposal_carries_ordered_arguments() {
        let mut call = test_utils::call();
        call.args = vec!["a".into(), "b".into(), "c".into()];
        let prepared = chaincode_proposal(&test_utils::identity(), &call);

        let (channel_header, signature_header, spec) = decode_proposal(&prepared.bytes);
        assert_eq!(channel_header.r#type, protos::HEADER_TYPE_ENDORSER_TRANSACTION);
        assert_eq!(channel_header.channel_id, "mychannel");
        assert_eq!(channel_header.tx_id, prepared.tx_id);
        assert_eq!(
            prepared.tx_id,
            transaction_id(&signature_header.nonce, &signature_header.creator)
        );
        assert_eq!(spec.chaincode_id.unwrap().name, "basic");
        let input = spec.input.unwrap();
        let args: Vec<&[u8]> = input.args.iter().map(Vec::as_slice).collect();
        let expected: Vec<&[u8]> = vec![b"ReadAsset", b"a", b"b", b"c"];
        assert_eq!(args, expected);
    }

    #[test]
    fn contract_prefixes_function_argument() {
        let mut call = test_utils::call();
        call.chaincode = ChaincodeRef::WithContract {
            name: "basic".into(),
            contract: "AssetContract".into(),
        };
        let prepared = chaincode_proposal(&test_utils::identity(), &call);

        let (_, _, spec) = decode_proposal(&prepared.bytes);
        assert_eq!(spec.input.unwrap().args[0], b"AssetContract:ReadAsset".to_vec());
    }

    #[test]
    fn seek_payload_starts_at_requested_block() {
        let payload = seek_payload(&test_utils::identity(), "mychannel", Some(7));
        let payload = protos::Payload::decode(payload.as_slice()).unwrap();
        let seek = protos::SeekInfo::decode(payload.data.as_slice()).unwrap();
        assert_eq!(seek.start, Some(protos::SeekPosition::specified(7)));
        assert_eq!(seek.stop, Some(protos::SeekPosition::specified(u64::MAX)));

        let payload = seek_payload(&test_utils::identity(), "mychannel", None);
        let payload = protos::Payload::decode(payload.as_slice()).unwrap();
        let seek = protos::SeekInfo::decode(payload.data.as_slice()).unwrap();
        assert_eq!(seek.start, Some(protos::SeekPosition::newest()));
    }

    #[test]
    fn extracts_result_from_endorsed_envelope() {
        let chaincode_action = protos::ChaincodeAction {
            response: Some(protos::Response {
                status: 200,
                payload: br#"{"ok":true}"#.to_vec(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let response_payload = protos::ProposalResponsePayload {
            extension: chaincode_action.encode_to_vec(),
            ..Default::default()
        };
        let action_payload = protos::ChaincodeActionPayload {
            action: Some(protos::ChaincodeEndorsedAction {
                proposal_response_payload: response_payload.encode_to_vec(),
            }),
            ..Default::default()
        };
        let transaction = protos::Transaction {
            actions: vec![protos::TransactionAction {
                payload: action_payload.encode_to_vec(),
                ..Default::default()
            }],
        };
        let envelope = protos::Envelope {
            payload: protos::Payload {
                header: None,
                data: transaction.encode_to_vec(),
            }
            .encode_to_vec(),
            signature: vec![],
        };

        assert_eq!(endorsed_result(&envelope).unwrap(), br#"{"ok":true}"#.to_vec());
    }

    #[test]
    fn empty_transaction_is_invalid() {
        let envelope = protos::Envelope {
            payload: protos::Payload::default().encode_to_vec(),
            signature: vec![],
        };
        assert!(matches!(
            endorsed_result(&envelope),
            Err(LedgerError::InvalidResponse(_))
        ));
    }
}
