/// JSON-RPC sessions of WebSocket clients: dispatch, remote signing and subscriptions.
pub(crate) mod client_events;

/// Gateway configuration.
pub mod config;

/// Ledger sessions and the Fabric Gateway client.
pub mod ledger;

/// Local server accepting client WebSocket connections.
pub mod server;

/// Tracing and logging setup.
pub mod tracing;

/// Pooled outbound gRPC channels to endorsing nodes.
pub mod transport;

pub mod util;

/// In-memory ledger doubles for tests.
pub mod test_utils;

pub use client_events::session::SessionSettings;
pub use config::{Config, ConfigArgs, OperationMode};
pub use server::{serve_gateway, serve_gateway_with, GatewayHandle, GatewayServer};
