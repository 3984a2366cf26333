//! Session and room synchronization core.
//!
//! One presenter and any number of participants share a session identified by
//! a five-character code. Each networked widget instance owns at most one
//! room on the relay. [`SyncClient`] keeps the local view of the session and
//! its rooms consistent across disconnects: it recovers the session after a
//! reconnect, rebuilds the room registry from the relay's answer, and closes
//! rooms whose widgets did not come back.
//!
//! - `transport`: duplex channel, listener bookkeeping, WebSocket channel
//! - `session`: session codes, handles and the 2h expiry rule
//! - `registry`: live room registry and the immutable recovery snapshot
//! - `recovery`: reconnect state machine and the room-creation gate
//! - `orphans`: post-recovery cleanup of rooms with no rendered widget
//! - `widget`: per-widget facade used by activity UIs
//! - `client`: the manager object tying it all together
//! - `config`: figment-layered settings and the data directory
//! - `store`: session handle persistence across restarts
//! - `existence`: REST check for whether a session is still live

pub mod client;
pub mod config;
pub mod error;
pub mod existence;
pub mod orphans;
pub mod protocol;
pub mod recovery;
pub mod registry;
pub mod session;
pub mod store;
pub mod transport;
pub mod widget;

#[cfg(test)]
mod test_helpers;

pub use client::{SessionSignal, SyncClient, SyncClientBuilder};
pub use config::SyncConfig;
pub use error::SyncError;
pub use existence::{ExistenceCheck, HttpExistenceCheck};
pub use orphans::RenderedWidgets;
pub use protocol::RoomType;
pub use recovery::RecoveryState;
pub use registry::{RecoverySnapshot, RoomRecord};
pub use session::{SessionCode, SessionHandle};
pub use store::{HandleStore, JsonFileStore, MemoryStore, StoredSession};
pub use transport::{Channel, ChannelEvent, WsChannel};
pub use widget::{WidgetState, WidgetSync};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the data if a previous holder panicked.
/// Critical sections in this crate never span an `.await`.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
