//! Process-local refresh token records, for single-instance deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;

use super::RefreshTokenBackend;
use crate::clock::SharedClock;
use crate::errors::StoreError;
use crate::types::SubjectId;

#[derive(Debug, Clone)]
struct Record {
    subject: SubjectId,
    expires_at: DateTime<Utc>,
}

/// Records live in a sharded map; revoked and consumed records are removed outright.
#[derive(Debug)]
pub struct MemoryRefreshBackend {
    records: DashMap<String, Record>,
    clock: SharedClock,
}

impl MemoryRefreshBackend {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            records: DashMap::new(),
            clock,
        }
    }

    fn expiry(&self, ttl: Duration) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        self.clock.now() + ttl
    }
}

#[async_trait]
impl RefreshTokenBackend for MemoryRefreshBackend {
    async fn insert(&self, token_hash: &str, subject: SubjectId, ttl: Duration) -> Result<(), StoreError> {
        let expires_at = self.expiry(ttl);
        self.records.insert(token_hash.to_string(), Record { subject, expires_at });
        Ok(())
    }

    async fn lookup(&self, token_hash: &str) -> Result<Option<SubjectId>, StoreError> {
        let now = self.clock.now();
        Ok(self
            .records
            .get(token_hash)
            .filter(|record| now < record.expires_at)
            .map(|record| record.subject))
    }

    async fn rotate(&self, old_hash: &str, new_hash: &str, ttl: Duration) -> Result<Option<SubjectId>, StoreError> {
        let now = self.clock.now();

        // remove_if holds the shard lock across the check, so only one caller can take the record
        let Some((_, record)) = self.records.remove_if(old_hash, |_, record| now < record.expires_at) else {
            return Ok(None);
        };

        let expires_at = self.expiry(ttl);
        self.records.insert(
            new_hash.to_string(),
            Record {
                subject: record.subject,
                expires_at,
            },
        );
        Ok(Some(record.subject))
    }

    async fn revoke(&self, token_hash: &str) -> Result<(), StoreError> {
        self.records.remove(token_hash);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let before = self.records.len();
        self.records.retain(|_, record| now < record.expires_at);
        Ok(before.saturating_sub(self.records.len()) as u64)
    }
}
