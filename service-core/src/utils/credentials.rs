//! Injectable cache for short-lived third-party access tokens.

use chrono::{DateTime, Duration, Utc};
use secrecy::Secret;
use std::future::Future;
use tokio::sync::Mutex;

use crate::error::AppError;

/// An access token and the instant it stops being accepted.
#[derive(Clone, Debug)]
pub struct Credential {
    pub token: Secret<String>,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: Secret::new(token.into()),
            expires_at,
        }
    }

    fn is_fresh(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        now + skew < self.expires_at
    }
}

/// Holds at most one credential. Refreshes are serialized: concurrent callers
/// that find the token stale wait for a single refresh instead of each
/// issuing their own.
#[derive(Debug)]
pub struct CredentialCache {
    current: Mutex<Option<Credential>>,
    skew: Duration,
}

impl CredentialCache {
    /// `skew` is subtracted from the expiry so a token is not handed out
    /// moments before it lapses.
    pub fn new(skew: Duration) -> Self {
        Self {
            current: Mutex::new(None),
            skew,
        }
    }

    /// Return the cached token, calling `refresh` first when it is missing or
    /// about to expire.
    pub async fn get_or_refresh<F, Fut>(
        &self,
        now: DateTime<Utc>,
        refresh: F,
    ) -> Result<Secret<String>, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Credential, AppError>>,
    {
        let mut current = self.current.lock().await;

        if let Some(credential) = current.as_ref().filter(|c| c.is_fresh(now, self.skew)) {
            return Ok(credential.token.clone());
        }

        tracing::debug!("Refreshing cached credential");
        let credential = refresh().await?;
        let token = credential.token.clone();
        *current = Some(credential);

        Ok(token)
    }

    /// Drop the cached token, e.g. after the remote side rejected it.
    pub async fn invalidate(&self) {
        *self.current.lock().await = None;
    }
}

impl Default for CredentialCache {
    fn default() -> Self {
        Self::new(Duration::seconds(60))
    }
}
