//! Process-local handshake state, for single-instance deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;

use super::{StateBackend, StateData};
use crate::clock::SharedClock;
use crate::errors::StoreError;

#[derive(Debug)]
struct Entry {
    data: StateData,
    expires_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct MemoryStateBackend {
    entries: DashMap<String, Entry>,
    clock: SharedClock,
}

impl MemoryStateBackend {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }
}

#[async_trait]
impl StateBackend for MemoryStateBackend {
    async fn save(&self, state: &str, data: &StateData, ttl: Duration) -> Result<(), StoreError> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        self.entries.insert(
            state.to_string(),
            Entry {
                data: data.clone(),
                expires_at: self.clock.now() + ttl,
            },
        );
        Ok(())
    }

    async fn take(&self, state: &str) -> Result<Option<StateData>, StoreError> {
        let now = self.clock.now();
        Ok(self
            .entries
            .remove(state)
            .filter(|(_, entry)| now < entry.expires_at)
            .map(|(_, entry)| entry.data))
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| now < entry.expires_at);
        Ok(before.saturating_sub(self.entries.len()) as u64)
    }
}
