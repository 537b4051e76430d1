//! Per-source read limits.
//!
//! Every destination has its own worker pool, so without a limit a source
//! targeted by many destinations would see `destinations * workers`
//! concurrent reads. [`SourceThrottle`] caps that number per source.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

use crate::error::SyncError;

/// Bounds concurrent reads against each source.
pub struct SourceThrottle {
    capacity: usize,
    sources: HashMap<String, Arc<Semaphore>>,
}

impl SourceThrottle {
    /// Tokens per source for a run with `workers` workers per destination.
    ///
    /// Reading is cheaper than writing, so a source may serve half again as
    /// many requests as one destination issues.
    pub fn capacity_for(workers: usize) -> usize {
        (workers + workers / 2).max(1)
    }

    /// One semaphore of `capacity` tokens for each of `sources`.
    pub fn new(capacity: usize, sources: impl IntoIterator<Item = String>) -> Self {
        let capacity = capacity.max(1);
        let sources = sources
            .into_iter()
            .map(|s| (s, Arc::new(Semaphore::new(capacity))))
            .collect();
        Self { capacity, sources }
    }

    /// Tokens per source.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wait for a read token for `src`. The token is returned when the
    /// permit is dropped.
    pub async fn acquire(&self, src: &str) -> Result<OwnedSemaphorePermit, SyncError> {
        let semaphore = self
            .sources
            .get(src)
            .ok_or_else(|| SyncError::UnknownSource(src.to_string()))?;
        if semaphore.available_permits() == 0 {
            trace!(%src, "waiting for source read token");
        }
        semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SyncError::ThrottleClosed(src.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_for_workers() {
        assert_eq!(SourceThrottle::capacity_for(0), 1);
        assert_eq!(SourceThrottle::capacity_for(1), 1);
        assert_eq!(SourceThrottle::capacity_for(2), 3);
        assert_eq!(SourceThrottle::capacity_for(5), 7);
        assert_eq!(SourceThrottle::capacity_for(10), 15);
    }

    #[tokio::test]
    async fn test_tokens_are_per_source() {
        let throttle = SourceThrottle::new(2, ["a".to_string(), "b".to_string()]);
        let a1 = throttle.acquire("a").await.unwrap();
        let _a2 = throttle.acquire("a").await.unwrap();

        // "a" is exhausted, "b" is not.
        let blocked =
            tokio::time::timeout(std::time::Duration::from_millis(50), throttle.acquire("a")).await;
        assert!(blocked.is_err());
        let _b = throttle.acquire("b").await.unwrap();

        drop(a1);
        let _a3 = throttle.acquire("a").await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_source() {
        let throttle = SourceThrottle::new(1, ["a".to_string()]);
        assert!(matches!(
            throttle.acquire("z").await,
            Err(SyncError::UnknownSource(s)) if s == "z"
        ));
    }
}
