//! Session codes, handles, and the session handle manager.
//!
//! A client holds at most one live [`SessionHandle`]. Handles expire a fixed
//! time after creation (2 hours by default); activity does not renew them.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, SyncError};
use crate::lock;
use crate::protocol::{ClientEvent, CreateSessionReply, JoinedReply, decode_reply, events};
use crate::store::{HandleStore, StoredSession};
use crate::transport::Transport;

/// Default lifetime of a session handle.
pub const SESSION_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Crockford base32 alphabet: `0123456789ABCDEFGHJKMNPQRSTVWXYZ`.
const CODE_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// A five-character session code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionCode(String);

impl SessionCode {
    pub const LEN: usize = 5;

    /// Parse user or wire input. Case-insensitive; `I`/`L` read as `1` and
    /// `O` as `0`.
    pub fn parse(input: &str) -> Result<Self> {
        let normalized: String = input
            .trim()
            .chars()
            .map(|c| match c.to_ascii_uppercase() {
                'I' | 'L' => '1',
                'O' => '0',
                other => other,
            })
            .collect();

        if normalized.chars().count() != Self::LEN {
            return Err(SyncError::InvalidCode(input.to_string()));
        }
        if !normalized
            .bytes()
            .all(|b| b.is_ascii() && CODE_ALPHABET.contains(&b))
        {
            return Err(SyncError::InvalidCode(input.to_string()));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for SessionCode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SessionCode {
    type Error = SyncError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<SessionCode> for String {
    fn from(code: SessionCode) -> Self {
        code.0
    }
}

impl fmt::Display for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The client's claim on a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHandle {
    pub code: SessionCode,
    pub created_at: DateTime<Utc>,
    pub is_host: bool,
}

impl SessionHandle {
    pub fn host(code: SessionCode) -> Self {
        Self {
            code,
            created_at: Utc::now(),
            is_host: true,
        }
    }

    pub fn participant(code: SessionCode) -> Self {
        Self {
            code,
            created_at: Utc::now(),
            is_host: false,
        }
    }

    /// Strictly older than `ttl` at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
        now.signed_duration_since(self.created_at) > ttl
    }
}

/// Who this client is when it (re)joins as a participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub client_id: String,
    pub display_name: String,
}

type PendingCreate = Shared<BoxFuture<'static, Result<SessionHandle>>>;

/// Owns the session handle and the requests that create or re-establish it.
pub(crate) struct SessionManager {
    transport: Arc<Transport>,
    slot: Arc<Mutex<Option<SessionHandle>>>,
    inflight: Arc<Mutex<Option<PendingCreate>>>,
    store: Arc<dyn HandleStore>,
    client_id: String,
    display_name: Mutex<String>,
    ttl: Duration,
    request_timeout: Duration,
}

impl SessionManager {
    pub fn new(
        transport: Arc<Transport>,
        store: Arc<dyn HandleStore>,
        identity: Identity,
        ttl: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            slot: Arc::new(Mutex::new(None)),
            inflight: Arc::new(Mutex::new(None)),
            store,
            client_id: identity.client_id,
            display_name: Mutex::new(identity.display_name),
            ttl,
            request_timeout,
        }
    }

    pub fn identity(&self) -> Identity {
        Identity {
            client_id: self.client_id.clone(),
            display_name: lock(&self.display_name).clone(),
        }
    }

    /// Name announced on the next join or participant rejoin.
    pub fn set_display_name(&self, name: &str) {
        *lock(&self.display_name) = name.to_string();
    }

    /// The held handle, expired or not.
    pub fn current(&self) -> Option<SessionHandle> {
        lock(&self.slot).clone()
    }

    /// The held handle if it has not expired.
    pub fn live(&self) -> Option<SessionHandle> {
        let now = Utc::now();
        lock(&self.slot)
            .as_ref()
            .filter(|h| !h.is_expired_at(now, self.ttl))
            .cloned()
    }

    /// Drop the handle if it has expired. Returns the discarded handle.
    pub fn discard_expired(&self) -> Option<SessionHandle> {
        let now = Utc::now();
        let expired = {
            let mut slot = lock(&self.slot);
            match slot.as_ref() {
                Some(h) if h.is_expired_at(now, self.ttl) => slot.take(),
                _ => None,
            }
        };
        if let Some(handle) = &expired {
            info!(code = %handle.code, "session handle expired, discarded");
            self.forget_persisted();
        }
        expired
    }

    /// Install a handle restored from the store without persisting again.
    pub fn restore(&self, handle: SessionHandle) {
        *lock(&self.slot) = Some(handle);
    }

    pub fn set(&self, handle: SessionHandle) {
        *lock(&self.slot) = Some(handle.clone());
        persist(&*self.store, &handle, &self.client_id);
    }

    pub fn clear(&self) -> Option<SessionHandle> {
        let previous = lock(&self.slot).take();
        self.forget_persisted();
        previous
    }

    fn forget_persisted(&self) {
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "failed to clear persisted session");
        }
    }

    /// Return the live session code, creating a session if there is none.
    ///
    /// Concurrent callers share one outstanding `session:create` request.
    pub async fn create_session(&self) -> Result<SessionHandle> {
        if let Some(handle) = self.live() {
            return Ok(handle);
        }
        self.discard_expired();

        let pending = {
            let mut inflight = lock(&self.inflight);
            match inflight.as_ref() {
                Some(pending) => pending.clone(),
                None => {
                    let pending = create_request(
                        self.transport.clone(),
                        self.slot.clone(),
                        self.inflight.clone(),
                        self.store.clone(),
                        self.client_id.clone(),
                        self.request_timeout,
                    )
                    .boxed()
                    .shared();
                    *inflight = Some(pending.clone());
                    pending
                }
            }
        };
        pending.await
    }

    /// Re-announce a restored host handle on a fresh connection.
    ///
    /// The relay may hand back a different code (e.g. after it restarted);
    /// the returned handle is whatever the client holds afterwards.
    pub async fn reclaim(&self, handle: &SessionHandle) -> Result<SessionHandle> {
        let data = self
            .transport
            .request(
                &ClientEvent::CreateSession {
                    existing_code: Some(handle.code.to_string()),
                },
                self.request_timeout,
            )
            .await?;
        let reply: CreateSessionReply = decode_reply(events::CREATE, data)?;
        let code = accepted_code(reply)?;
        if code == handle.code {
            return Ok(handle.clone());
        }
        info!(old = %handle.code, new = %code, "relay issued a new session code");
        let replacement = SessionHandle::host(code);
        self.set(replacement.clone());
        Ok(replacement)
    }

    /// `session:join` as a participant. The caller validates existence first.
    pub async fn join(&self, code: &SessionCode, timeout: Duration) -> Result<JoinedReply> {
        let event = ClientEvent::Join {
            code: code.to_string(),
            name: lock(&self.display_name).clone(),
            client_id: self.client_id.clone(),
        };
        let data = self.transport.request(&event, timeout).await?;
        accepted_join(code, decode_reply(events::JOINED, data)?)
    }

    /// Re-establish a held session on a new connection.
    pub async fn rejoin(&self, handle: &SessionHandle, timeout: Duration) -> Result<JoinedReply> {
        if !handle.is_host {
            return self.join(&handle.code, timeout).await;
        }
        let event = ClientEvent::Recover {
            code: handle.code.to_string(),
        };
        let data = self.transport.request(&event, timeout).await?;
        accepted_join(&handle.code, decode_reply(events::JOINED, data)?)
    }
}

async fn create_request(
    transport: Arc<Transport>,
    slot: Arc<Mutex<Option<SessionHandle>>>,
    inflight: Arc<Mutex<Option<PendingCreate>>>,
    store: Arc<dyn HandleStore>,
    client_id: String,
    timeout: Duration,
) -> Result<SessionHandle> {
    let result = async {
        let data = transport
            .request(
                &ClientEvent::CreateSession {
                    existing_code: None,
                },
                timeout,
            )
            .await?;
        let reply: CreateSessionReply = decode_reply(events::CREATE, data)?;
        Ok(SessionHandle::host(accepted_code(reply)?))
    }
    .await;

    match &result {
        Ok(handle) => {
            *lock(&slot) = Some(handle.clone());
            persist(&*store, handle, &client_id);
            info!(code = %handle.code, "session created");
        }
        Err(e) => warn!(error = %e, "session creation failed"),
    }
    lock(&inflight).take();
    result
}

fn accepted_code(reply: CreateSessionReply) -> Result<SessionCode> {
    if !reply.success {
        return Err(SyncError::ServerRejected {
            event: events::CREATE,
            message: reply
                .error
                .unwrap_or_else(|| "session creation failed".to_string()),
        });
    }
    let code = reply
        .code
        .ok_or_else(|| SyncError::Protocol("session:create reply without code".into()))?;
    SessionCode::parse(&code)
}

fn accepted_join(code: &SessionCode, reply: JoinedReply) -> Result<JoinedReply> {
    if reply.success {
        Ok(reply)
    } else {
        if let Some(reason) = &reply.error {
            info!(code = %code, reason = %reason, "relay refused session");
        }
        Err(SyncError::SessionNotFound {
            code: code.to_string(),
        })
    }
}

fn persist(store: &dyn HandleStore, handle: &SessionHandle, client_id: &str) {
    let record = StoredSession {
        handle: handle.clone(),
        client_id: client_id.to_string(),
    };
    if let Err(e) = store.save(&record) {
        warn!(error = %e, "failed to persist session handle");
    }
}
