//! Process-local token buckets.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;

use super::{Admission, BucketParams, BucketStore};
use crate::clock::SharedClock;
use crate::errors::StoreError;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct MemoryBucketStore {
    buckets: DashMap<String, Bucket>,
    clock: SharedClock,
}

impl MemoryBucketStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            buckets: DashMap::new(),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn take(&self, key: &str, params: BucketParams) -> Result<Admission, StoreError> {
        let now = self.clock.now();
        let capacity = f64::from(params.capacity);

        // The entry guard holds the shard lock for the whole refill-check-deduct step
        let mut bucket = self.buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: capacity,
            last_refill_at: now,
        });

        let elapsed = (now - bucket.last_refill_at).to_std().unwrap_or(Duration::ZERO);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * params.refill_per_second).min(capacity);
        bucket.last_refill_at = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(Admission {
                allowed: true,
                retry_after: Duration::ZERO,
            })
        } else {
            Ok(Admission {
                allowed: false,
                retry_after: params.retry_after(bucket.tokens),
            })
        }
    }

    async fn purge_idle(&self, idle_for: Duration) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            let idle = (now - bucket.last_refill_at).to_std().unwrap_or(Duration::ZERO);
            idle < idle_for
        });
        Ok(before.saturating_sub(self.buckets.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fractional_refill_accumulates() {
        let clock = ManualClock::starting_now();
        let store = MemoryBucketStore::new(Arc::new(clock.clone()));
        let params = BucketParams {
            capacity: 1,
            refill_per_second: 2.0,
        };

        assert!(store.take("k", params).await.unwrap().allowed);
        assert!(!store.take("k", params).await.unwrap().allowed);

        clock.advance(Duration::from_millis(250));
        let denied = store.take("k", params).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Duration::from_millis(250));

        clock.advance(Duration::from_millis(250));
        assert!(store.take("k", params).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_refill_never_exceeds_capacity() {
        let clock = ManualClock::starting_now();
        let store = MemoryBucketStore::new(Arc::new(clock.clone()));
        let params = BucketParams {
            capacity: 3,
            refill_per_second: 1.0,
        };

        store.take("k", params).await.unwrap();
        clock.advance(Duration::from_secs(3600));

        let mut admitted = 0;
        while store.take("k", params).await.unwrap().allowed {
            admitted += 1;
        }
        assert_eq!(admitted, 3);
    }
}
