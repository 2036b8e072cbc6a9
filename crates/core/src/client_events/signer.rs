//! Remote signing over the client connection.
//!
//! The gateway never holds private keys. When a ledger operation needs a signature the
//! [`RemoteSigner`] sends a `signDigest` request to the client and the
//! [`SignatureCorrelator`] matches the client's reply to it by correlation id.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::DashMap;
use futures::{future::BoxFuture, FutureExt};
use serde_json::{json, Value};
use tokio::sync::oneshot;

use super::{jsonrpc, OutboundSender};
use crate::{
    ledger::{Signer, SigningError},
    util::{decode_base64, encode_base64},
};

pub(crate) const SIGN_DIGEST_METHOD: &str = "signDigest";

type Resolver = oneshot::Sender<Result<Vec<u8>, SigningError>>;

/// Pending signature requests of one connection.
pub(crate) struct SignatureCorrelator {
    outbound: OutboundSender,
    pending: DashMap<String, Resolver>,
    next_id: AtomicU64,
    closed: AtomicBool,
    timeout: Duration,
}

/// Removes the pending entry when the waiting call goes away, whatever the reason.
struct PendingGuard<'a> {
    pending: &'a DashMap<String, Resolver>,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.id);
    }
}

impl SignatureCorrelator {
    pub fn new(outbound: OutboundSender, timeout: Duration) -> Self {
        Self {
            outbound,
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            timeout,
        }
    }

    /// Signer bound to `certificate` whose requests go through this correlator.
    pub fn signer_for(self: &Arc<Self>, certificate: String) -> RemoteSigner {
        RemoteSigner {
            correlator: self.clone(),
            certificate,
        }
    }

    pub async fn request_signature(
        &self,
        digest: &[u8],
        certificate: &str,
    ) -> Result<Vec<u8>, SigningError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SigningError::ConnectionClosed);
        }
        let id = format!("sig-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let (resolver, signature) = oneshot::channel();
        self.pending.insert(id.clone(), resolver);
        let _guard = PendingGuard {
            pending: &self.pending,
            id: &id,
        };
        // closing may have drained the table right before the insert
        if self.closed.load(Ordering::SeqCst) {
            return Err(SigningError::ConnectionClosed);
        }

        let frame = jsonrpc::request(
            &id,
            SIGN_DIGEST_METHOD,
            json!({ "digest": encode_base64(digest), "certificate": certificate }),
        );
        if self.outbound.send(frame).is_err() {
            return Err(SigningError::ConnectionClosed);
        }
        tracing::debug!(correlation = %id, "signature requested from client");

        match tokio::time::timeout(self.timeout, signature).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SigningError::ConnectionClosed),
            Err(_) => {
                tracing::debug!(correlation = %id, "signature request timed out");
                Err(SigningError::Timeout(self.timeout))
            }
        }
    }

    /// Routes a client reply to the request it answers. Returns whether a pending
    /// request matched.
    pub fn resolve(&self, id: &Value, outcome: Result<Value, Value>) -> bool {
        let Some(id) = id.as_str() else {
            return false;
        };
        let Some((_, resolver)) = self.pending.remove(id) else {
            tracing::debug!(correlation = %id, "dropping reply without pending request");
            return false;
        };
        let result = match outcome {
            Ok(result) => parse_signature(&result),
            Err(error) => Err(SigningError::Rejected(error_message(&error))),
        };
        // the waiting call may have been cancelled in the meantime
        let _ = resolver.send(result);
        true
    }

    /// Fails every pending request and refuses new ones.
    pub fn fail_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let ids: Vec<String> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            if let Some((_, resolver)) = self.pending.remove(&id) {
                let _ = resolver.send(Err(SigningError::ConnectionClosed));
            }
        }
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

fn parse_signature(result: &Value) -> Result<Vec<u8>, SigningError> {
    let encoded = match result {
        Value::String(encoded) => encoded,
        Value::Object(fields) => match fields.get("signature") {
            Some(Value::String(encoded)) => encoded,
            _ => {
                return Err(SigningError::Malformed(
                    "expected a `signature` string".into(),
                ))
            }
        },
        _ => {
            return Err(SigningError::Malformed(
                "expected a signature object or string".into(),
            ))
        }
    };
    let signature =
        decode_base64(encoded).map_err(|err| SigningError::Malformed(err.to_string()))?;
    if signature.is_empty() {
        return Err(SigningError::Malformed("empty signature".into()));
    }
    Ok(signature)
}

fn error_message(error: &Value) -> String {
    error
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .unwrap_or_else(|| error.to_string())
}

/// [`Signer`] that delegates to the connected client.
pub(crate) struct RemoteSigner {
    correlator: Arc<SignatureCorrelator>,
    certificate: String,
}

impl Signer for RemoteSigner {
    fn sign<'a>(&'a self, digest: &'a [u8]) -> BoxFuture<'a, Result<Vec<u8>, SigningError>> {
        self.correlator
            .request_signature(digest, &self.certificate)
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn correlator(
        timeout: Duration,
    ) -> (Arc<SignatureCorrelator>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(SignatureCorrelator::new(tx, timeout)), rx)
    }

    async fn next_request(rx: &mut mpsc::UnboundedReceiver<String>) -> Value {
        let frame = rx.recv().await.unwrap();
        serde_json::from_str(&frame).unwrap()
    }

    #[tokio::test]
    async fn emits_sign_digest_request() {
        let (correlator, mut rx) = correlator(Duration::from_secs(5));
        let signer = correlator.signer_for("CERT".into());

        let pending = tokio::spawn(async move { signer.sign(b"digest").await });
        let request = next_request(&mut rx).await;

        assert_eq!(request["jsonrpc"], "2.0");
        assert_eq!(request["method"], "signDigest");
        assert_eq!(request["id"], "sig-1");
        assert_eq!(request["params"]["digest"], encode_base64(b"digest"));
        assert_eq!(request["params"]["certificate"], "CERT");

        assert!(correlator.resolve(&json!("sig-1"), Ok(json!({"signature": encode_base64(b"sig")}))));
        assert_eq!(pending.await.unwrap().unwrap(), b"sig".to_vec());
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn concurrent_requests_match_by_id() {
        let (correlator, mut rx) = correlator(Duration::from_secs(5));
        let first = {
            let signer = correlator.signer_for("A".into());
            tokio::spawn(async move { signer.sign(b"one").await })
        };
        let id_first = next_request(&mut rx).await["id"].clone();
        let second = {
            let signer = correlator.signer_for("B".into());
            tokio::spawn(async move { signer.sign(b"two").await })
        };
        let id_second = next_request(&mut rx).await["id"].clone();
        assert_ne!(id_first, id_second);

        // answer out of order, bare string form for one of them
        assert!(correlator.resolve(&id_second, Ok(json!(encode_base64(b"second")))));
        assert!(correlator.resolve(&id_first, Ok(json!({"signature": encode_base64(b"first")}))));

        assert_eq!(first.await.unwrap().unwrap(), b"first".to_vec());
        assert_eq!(second.await.unwrap().unwrap(), b"second".to_vec());
    }

    #[tokio::test]
    async fn replies_are_single_fire() {
        let (correlator, mut rx) = correlator(Duration::from_secs(5));
        let signer = correlator.signer_for("CERT".into());
        let pending = tokio::spawn(async move { signer.sign(b"d").await });
        let id = next_request(&mut rx).await["id"].clone();

        assert!(correlator.resolve(&id, Ok(json!(encode_base64(b"s")))));
        assert!(!correlator.resolve(&id, Ok(json!(encode_base64(b"s")))));
        assert!(!correlator.resolve(&json!("sig-999"), Ok(json!("AA=="))));
        assert!(pending.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn error_and_malformed_replies_fail_the_request() {
        let (correlator, mut rx) = correlator(Duration::from_secs(5));
        let signer = Arc::new(correlator.signer_for("CERT".into()));

        let rejected = {
            let signer = signer.clone();
            tokio::spawn(async move { signer.sign(b"d").await })
        };
        let id = next_request(&mut rx).await["id"].clone();
        correlator.resolve(&id, Err(json!({"code": 1, "message": "user declined"})));
        assert!(matches!(
            rejected.await.unwrap(),
            Err(SigningError::Rejected(msg)) if msg == "user declined"
        ));

        for reply in [json!({"sig": "AA=="}), json!("%%%"), json!(""), json!(12)] {
            let signer = signer.clone();
            let malformed = tokio::spawn(async move { signer.sign(b"d").await });
            let id = next_request(&mut rx).await["id"].clone();
            correlator.resolve(&id, Ok(reply.clone()));
            assert!(
                matches!(malformed.await.unwrap(), Err(SigningError::Malformed(_))),
                "{reply}"
            );
        }
    }

    #[tokio::test]
    async fn times_out_without_reply() {
        let (correlator, mut rx) = correlator(Duration::from_millis(50));
        let signer = correlator.signer_for("CERT".into());

        let result = signer.sign(b"d").await;

        assert!(matches!(result, Err(SigningError::Timeout(_))));
        assert!(rx.recv().await.is_some());
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn closing_fails_pending_and_future_requests() {
        let (correlator, mut rx) = correlator(Duration::from_secs(30));
        let signer = Arc::new(correlator.signer_for("CERT".into()));
        let pending = {
            let signer = signer.clone();
            tokio::spawn(async move { signer.sign(b"d").await })
        };
        next_request(&mut rx).await;

        correlator.fail_all();

        assert!(matches!(
            pending.await.unwrap(),
            Err(SigningError::ConnectionClosed)
        ));
        assert!(matches!(
            signer.sign(b"again").await,
            Err(SigningError::ConnectionClosed)
        ));
        assert_eq!(correlator.pending(), 0);
    }
}
