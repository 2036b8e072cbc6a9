use std::time::Duration;

use futures::{future::BoxFuture, FutureExt};
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};

use super::{ChannelFactory, ChannelKey, ConnectError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Opens HTTP/2 channels to endorsing nodes, with TLS when the key carries a trust
/// anchor.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrpcChannelFactory;

impl GrpcChannelFactory {
    fn endpoint(key: &ChannelKey) -> Result<Endpoint, ConnectError> {
        let scheme = if key.trust_anchor.is_some() {
            "https"
        } else {
            "http"
        };
        let endpoint = Endpoint::from_shared(format!("{scheme}://{}", key.endpoint))
            .map_err(|err| ConnectError::InvalidEndpoint {
                endpoint: key.endpoint.clone(),
                cause: err.to_string(),
            })?
            .connect_timeout(CONNECT_TIMEOUT)
            .http2_keep_alive_interval(KEEP_ALIVE_INTERVAL)
            .keep_alive_while_idle(true);

        let Some(pem) = &key.trust_anchor else {
            return Ok(endpoint);
        };
        let tls = ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(pem))
            .domain_name(key.name.clone());
        endpoint.tls_config(tls).map_err(|source| ConnectError::Tls {
            endpoint: key.endpoint.clone(),
            source,
        })
    }
}

impl ChannelFactory for GrpcChannelFactory {
    type Channel = Channel;

    fn connect<'a>(
        &'a self,
        key: &'a ChannelKey,
    ) -> BoxFuture<'a, Result<Channel, ConnectError>> {
        async move {
            let endpoint = Self::endpoint(key)?;
            let channel = endpoint
                .connect()
                .await
                .map_err(|source| ConnectError::Unreachable {
                    endpoint: key.endpoint.clone(),
                    source,
                })?;
            tracing::info!(%key, "channel to endorsing node established");
            Ok(channel)
        }
        .boxed()
    }

    fn release(&self, key: &ChannelKey, channel: Channel) {
        // the underlying connection shuts down once the last clone is dropped
        drop(channel);
        tracing::debug!(%key, "channel to endorsing node released");
    }
}
