//! Relay transport.
//!
//! Submodules:
//! - `channel`: the raw duplex channel contract and its event stream
//! - `wrapper`: persistent subscriptions, fire-and-forget emits, correlated requests
//! - `ws`: tokio-tungstenite channel with reconnect backoff

pub mod channel;
pub mod wrapper;
pub mod ws;

pub use channel::{Channel, ChannelEvent};
pub use wrapper::{Handler, LinkStatus, SubscriptionId, Transport};
pub use ws::{ReconnectPolicy, WsChannel};
