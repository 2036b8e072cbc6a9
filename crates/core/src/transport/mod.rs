//! Outbound connections to endorsing nodes.
//!
//! Channels are built by a [`ChannelFactory`] and pooled in a [`ConnectionCache`]
//! shared by every client connection of the process.

mod connection_cache;
mod grpc;

use std::fmt::Display;

use futures::future::BoxFuture;
use thiserror::Error;

pub use connection_cache::{CacheLimits, ConnectionCache};
pub use grpc::GrpcChannelFactory;

/// Identity of a pooled channel. Two targets sharing endpoint, name and trust anchor
/// share one channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub endpoint: String,
    pub name: String,
    pub trust_anchor: Option<String>,
}

impl Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.endpoint)?;
        if self.trust_anchor.is_some() {
            write!(f, " (tls)")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid endpoint {endpoint}: {cause}")]
    InvalidEndpoint { endpoint: String, cause: String },
    #[error("could not configure TLS for {endpoint}: {source}")]
    Tls {
        endpoint: String,
        #[source]
        source: tonic::transport::Error,
    },
    #[error("could not reach {endpoint}: {source}")]
    Unreachable {
        endpoint: String,
        #[source]
        source: tonic::transport::Error,
    },
}

/// Builds and releases outbound channels.
pub trait ChannelFactory: Send + Sync + 'static {
    type Channel: Clone + Send + Sync + 'static;

    fn connect<'a>(
        &'a self,
        key: &'a ChannelKey,
    ) -> BoxFuture<'a, Result<Self::Channel, ConnectError>>;

    /// Invoked once for every channel leaving the cache.
    fn release(&self, key: &ChannelKey, channel: Self::Channel);
}
