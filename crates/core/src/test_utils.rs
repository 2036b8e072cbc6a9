//! Test doubles shared by unit and integration tests.
//!
//! [`MockConnector`] hands out in-memory ledger clients whose results, failures and
//! event feeds are driven by the test through the connector handle.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{channel::mpsc, future::BoxFuture, FutureExt, StreamExt};
use parking_lot::Mutex;

use crate::ledger::{
    BlockEvent, ChaincodeEvent, ChaincodeRef, EventStream, Identity, LedgerClient,
    LedgerConnector, LedgerError, Signer, SigningError, TargetNode, TransactionCall,
};

pub type ChaincodeFeed = mpsc::UnboundedSender<Result<ChaincodeEvent, LedgerError>>;
pub type BlockFeed = mpsc::UnboundedSender<Result<BlockEvent, LedgerError>>;

const FEED_WAIT: Duration = Duration::from_secs(5);

pub fn identity() -> Identity {
    Identity {
        msp_id: "Org1MSP".to_owned(),
        certificate: "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n".to_owned(),
    }
}

pub fn target() -> TargetNode {
    TargetNode {
        name: "peer0.org1.example.com".to_owned(),
        address: "localhost:7051".to_owned(),
        tls_root_cert: None,
    }
}

pub fn call() -> TransactionCall {
    TransactionCall {
        channel: "mychannel".to_owned(),
        chaincode: ChaincodeRef::Simple("basic".to_owned()),
        function: "ReadAsset".to_owned(),
        args: vec!["asset1".to_owned()],
    }
}

/// Signer answering every digest with a fixed signature.
pub struct StaticSigner;

impl Signer for StaticSigner {
    fn sign<'a>(&'a self, _digest: &'a [u8]) -> BoxFuture<'a, Result<Vec<u8>, SigningError>> {
        async { Ok(b"signature".to_vec()) }.boxed()
    }
}

#[derive(Default)]
struct MockState {
    connects: AtomicUsize,
    closed: AtomicUsize,
    submitted: AtomicUsize,
    evaluate_payload: Mutex<Vec<u8>>,
    submit_payload: Mutex<Vec<u8>>,
    failure: Mutex<Option<String>>,
    last_call: Mutex<Option<TransactionCall>>,
    chaincode_feeds: Mutex<Vec<ChaincodeFeed>>,
    block_feeds: Mutex<Vec<BlockFeed>>,
}

/// In-memory [`LedgerConnector`]; clones share state.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    pub fn set_evaluate_payload(&self, payload: Vec<u8>) {
        *self.state.evaluate_payload.lock() = payload;
    }

    pub fn set_submit_payload(&self, payload: Vec<u8>) {
        *self.state.submit_payload.lock() = payload;
    }

    /// Makes every following evaluate/submit/stream call fail with `cause`.
    pub fn fail_with(&self, cause: &str) {
        *self.state.failure.lock() = Some(cause.to_owned());
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Number of clients released so far.
    pub fn closed_clients(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn last_call(&self) -> Option<TransactionCall> {
        self.state.last_call.lock().clone()
    }

    /// Waits for the `index`-th chaincode event stream to be opened and returns its feed.
    pub async fn chaincode_feed(&self, index: usize) -> ChaincodeFeed {
        wait_for_feed(&self.state.chaincode_feeds, index).await
    }

    /// Waits for the `index`-th block event stream to be opened and returns its feed.
    pub async fn block_feed(&self, index: usize) -> BlockFeed {
        wait_for_feed(&self.state.block_feeds, index).await
    }
}

async fn wait_for_feed<T: Clone>(feeds: &Mutex<Vec<T>>, index: usize) -> T {
    let lookup = async {
        loop {
            if let Some(feed) = feeds.lock().get(index) {
                return feed.clone();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(FEED_WAIT, lookup)
        .await
        .expect("event stream was never opened")
}

impl LedgerConnector for MockConnector {
    fn connect<'a>(
        &'a self,
        _identity: Identity,
        signer: Arc<dyn Signer>,
        _target: &'a TargetNode,
    ) -> BoxFuture<'a, Result<Box<dyn LedgerClient>, LedgerError>> {
        async move {
            self.state.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockClient {
                state: self.state.clone(),
                signer,
            }) as Box<dyn LedgerClient>)
        }
        .boxed()
    }
}

struct MockClient {
    state: Arc<MockState>,
    signer: Arc<dyn Signer>,
}

impl MockClient {
    fn check_failure(&self) -> Result<(), LedgerError> {
        match &*self.state.failure.lock() {
            Some(cause) => Err(LedgerError::Rpc(tonic::Status::unavailable(cause.clone()))),
            None => Ok(()),
        }
    }

    async fn sign_and_record(&self, call: &TransactionCall) -> Result<(), LedgerError> {
        self.check_failure()?;
        *self.state.last_call.lock() = Some(call.clone());
        self.signer.sign(call.function.as_bytes()).await?;
        Ok(())
    }
}

impl Drop for MockClient {
    fn drop(&mut self) {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
    }
}

impl LedgerClient for MockClient {
    fn evaluate<'a>(
        &'a self,
        call: &'a TransactionCall,
    ) -> BoxFuture<'a, Result<Vec<u8>, LedgerError>> {
        async move {
            self.check_failure()?;
            *self.state.last_call.lock() = Some(call.clone());
            Ok(self.state.evaluate_payload.lock().clone())
        }
        .boxed()
    }

    fn submit<'a>(
        &'a self,
        call: &'a TransactionCall,
    ) -> BoxFuture<'a, Result<Vec<u8>, LedgerError>> {
        async move {
            self.sign_and_record(call).await?;
            Ok(self.state.submit_payload.lock().clone())
        }
        .boxed()
    }

    fn submit_async<'a>(
        &'a self,
        call: &'a TransactionCall,
    ) -> BoxFuture<'a, Result<String, LedgerError>> {
        async move {
            self.sign_and_record(call).await?;
            let n = self.state.submitted.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("tx-{n}"))
        }
        .boxed()
    }

    fn chaincode_events<'a>(
        &'a self,
        _channel: &'a str,
        _chaincode: &'a str,
        _start_block: Option<u64>,
    ) -> BoxFuture<'a, Result<EventStream<ChaincodeEvent>, LedgerError>> {
        async move {
            self.check_failure()?;
            let (tx, rx) = mpsc::unbounded();
            self.state.chaincode_feeds.lock().push(tx);
            Ok(rx.boxed())
        }
        .boxed()
    }

    fn block_events<'a>(
        &'a self,
        _channel: &'a str,
        _start_block: Option<u64>,
    ) -> BoxFuture<'a, Result<EventStream<BlockEvent>, LedgerError>> {
        async move {
            self.check_failure()?;
            let (tx, rx) = mpsc::unbounded();
            self.state.block_feeds.lock().push(tx);
            Ok(rx.boxed())
        }
        .boxed()
    }
}
