//! Side-effect-free "does this session still exist?" check against the relay's
//! REST surface. Used before joining and before recovering.

use futures::future::BoxFuture;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::protocol::ExistsReply;
use crate::session::SessionCode;

pub trait ExistenceCheck: Send + Sync + 'static {
    fn exists<'a>(&'a self, code: &'a SessionCode) -> BoxFuture<'a, Result<bool>>;
}

/// `GET {base_url}/sessions/{code}/exists`
#[derive(Debug, Clone)]
pub struct HttpExistenceCheck {
    base_url: String,
    client: reqwest::Client,
}

impl HttpExistenceCheck {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn url_for(&self, code: &SessionCode) -> String {
        format!("{}/sessions/{}/exists", self.base_url, code)
    }
}

impl ExistenceCheck for HttpExistenceCheck {
    fn exists<'a>(&'a self, code: &'a SessionCode) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let url = self.url_for(code);
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| SyncError::ExistenceCheck(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(SyncError::ExistenceCheck(format!(
                    "{url} returned {}",
                    resp.status()
                )));
            }
            let body: ExistsReply = resp
                .json()
                .await
                .map_err(|e| SyncError::ExistenceCheck(e.to_string()))?;
            debug!(code = %code, exists = body.exists, "existence check");
            Ok(body.exists)
        })
    }
}
