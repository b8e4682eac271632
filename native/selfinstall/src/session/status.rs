use std::time::Duration;

use tokio::{sync::RwLock, time::Instant};

use crate::models::ConnectionStatus;

#[derive(Debug, Default, Clone, Copy)]
struct Cached {
    checked_at: Option<Instant>,
    status: ConnectionStatus,
}

/// Last probed connection status together with the time it was taken
#[derive(Debug, Default)]
pub(crate) struct StatusCache {
    inner: RwLock<Cached>,
}

impl StatusCache {
    /// The cached status if it is younger than `max_age`
    pub async fn fresh(&self, max_age: Duration) -> Option<ConnectionStatus> {
        let cached = *self.inner.read().await;
        cached
            .checked_at
            .filter(|checked_at| checked_at.elapsed() < max_age)
            .map(|_| cached.status)
    }

    /// The cached status regardless of its age
    pub async fn last(&self) -> ConnectionStatus {
        self.inner.read().await.status
    }

    pub async fn store(&self, checked_at: Instant, status: ConnectionStatus) {
        *self.inner.write().await = Cached { checked_at: Some(checked_at), status };
    }

    /// Forces the next status request to probe
    pub async fn invalidate(&self) {
        self.inner.write().await.checked_at = None;
    }
}
