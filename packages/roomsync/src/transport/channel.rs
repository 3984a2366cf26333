//! The raw duplex channel to the relay.

use crate::error::Result;
use crate::protocol::Frame;

/// Lifecycle and traffic reported by a [`Channel`], in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A (re)connect attempt has started.
    Connecting,
    /// A new underlying connection is up. `connection_id` differs per connection.
    Connected { connection_id: String },
    /// The underlying connection dropped; the channel keeps retrying.
    Disconnected { reason: String },
    /// An inbound frame. Event frames only arrive for names passed to
    /// [`Channel::listen`] on the current connection; acks always arrive.
    Frame(Frame),
}

/// A persistent, auto-reconnecting duplex event stream.
///
/// Implementations push [`ChannelEvent`]s into the receiver handed to the
/// sync client at construction. The per-connection listener filter is reset
/// every time a new connection comes up.
pub trait Channel: Send + Sync + 'static {
    fn is_connected(&self) -> bool;

    fn connection_id(&self) -> Option<String>;

    /// Queue a frame on the current connection.
    fn send(&self, frame: Frame) -> Result<()>;

    /// Ask the current connection to deliver these inbound event names.
    fn listen(&self, events: &[String]);

    /// Stop reconnecting and drop the current connection.
    fn close(&self);
}
