// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Persistence Collaborators
//!
//! The worker shares state with the surrounding persistence layer: the bus
//! profile (broker URL and connection status) and the dead-letter table. It
//! reaches them through the traits below and owns the commit or rollback
//! around each unit of work it runs.
//!
//! [`MemoryStore`] is a complete transactional implementation kept in
//! memory. Writes land in a working copy; `commit` publishes the working
//! copy and `rollback` restores the last committed state.

use crate::{
    deadletter::{DeadLetter, DeadLetterRecord},
    errors::{AmqpError, ConfigError, StoreError},
    status::ProfileStatus,
};
use async_trait::async_trait;
use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};
use uuid::Uuid;

/// Unit-of-work boundaries of the persistence layer.
#[async_trait]
pub trait Transactional: Send + Sync {
    /// Makes every write since the last boundary durable.
    async fn commit(&self) -> Result<(), StoreError>;

    /// Discards every write since the last boundary.
    async fn rollback(&self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ProfileStore: Transactional {
    /// Resolves a named profile to the broker URL.
    async fn profile_url(&self, profile: &str) -> Result<String, StoreError>;

    /// Records the connection status of a profile. The write is part of the
    /// current unit of work.
    ///
    /// # Parameters
    /// * `profile` - Name of the profile
    /// * `status` - New connection status
    async fn set_status(&self, profile: &str, status: ProfileStatus) -> Result<(), StoreError>;
}

#[async_trait]
pub trait DeadLetterStore: Transactional {
    /// Append-only insert. A letter without a sequence gets the next one.
    async fn insert(&self, letter: DeadLetter) -> Result<DeadLetterRecord, StoreError>;

    /// Pending records ordered by ascending sequence.
    async fn pending(&self) -> Result<Vec<DeadLetterRecord>, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterRecord>, StoreError>;

    /// Removes a record, failing with [`StoreError::NotFound`] when absent.
    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;

    /// Replaces the recorded error text of a record.
    async fn set_error(&self, id: Uuid, error: &str) -> Result<(), StoreError>;
}

/// Resolves `profile`, reporting an unknown name as a configuration fault.
pub(crate) async fn resolve_profile<S>(store: &S, profile: &str) -> Result<String, AmqpError>
where
    S: ProfileStore + ?Sized,
{
    store.profile_url(profile).await.map_err(|err| match err {
        StoreError::NotFound(name) => AmqpError::from(ConfigError::UnknownProfile(name)),
        other => AmqpError::from(other),
    })
}

/// Everything a worker needs from persistence.
pub trait Store: ProfileStore + DeadLetterStore {}

impl<T> Store for T where T: ProfileStore + DeadLetterStore {}

/// A named broker profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub url: String,
    pub status: ProfileStatus,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    profiles: BTreeMap<String, Profile>,
    letters: Vec<DeadLetterRecord>,
}

#[derive(Debug, Default)]
struct State {
    working: Tables,
    committed: Tables,
}

/// In-memory [`Store`] with a working copy and a committed snapshot.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// Creates a store with no profile and no dead letter.
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Adds a committed profile.
    ///
    /// # Parameters
    /// * `name` - Profile name workers and publishers resolve
    /// * `url` - Broker URL of the profile
    ///
    /// # Returns
    /// The store, with the profile in the `disconnected` status
    pub fn with_profile(self, name: &str, url: &str) -> Self {
        if let Ok(mut state) = self.state.lock() {
            let profile = Profile {
                url: url.to_owned(),
                status: ProfileStatus::Disconnected,
            };
            state.working.profiles.insert(name.to_owned(), profile.clone());
            state.committed.profiles.insert(name.to_owned(), profile);
        }
        self
    }

    /// The profile as seen by the current unit of work.
    pub fn profile(&self, name: &str) -> Option<Profile> {
        self.lock().ok()?.working.profiles.get(name).cloned()
    }

    /// Dead letters visible in the current unit of work.
    pub fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.lock()
            .map(|s| s.working.letters.clone())
            .unwrap_or_default()
    }

    /// Dead letters as of the last commit.
    pub fn committed_dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.lock()
            .map(|s| s.committed.letters.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_owned()))
    }
}

#[async_trait]
impl Transactional for MemoryStore {
    async fn commit(&self) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.committed = state.working.clone();
        Ok(())
    }

    async fn rollback(&self) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.working = state.committed.clone();
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for MemoryStore {
    async fn profile_url(&self, profile: &str) -> Result<String, StoreError> {
        self.lock()?
            .working
            .profiles
            .get(profile)
            .map(|p| p.url.clone())
            .ok_or_else(|| StoreError::NotFound(profile.to_owned()))
    }

    async fn set_status(&self, profile: &str, status: ProfileStatus) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let entry = state
            .working
            .profiles
            .get_mut(profile)
            .ok_or_else(|| StoreError::NotFound(profile.to_owned()))?;
        entry.status = status;
        Ok(())
    }
}

#[async_trait]
impl DeadLetterStore for MemoryStore {
    async fn insert(&self, letter: DeadLetter) -> Result<DeadLetterRecord, StoreError> {
        let mut state = self.lock()?;
        let sequence = letter.sequence.unwrap_or_else(|| {
            state
                .working
                .letters
                .iter()
                .map(|r| r.sequence)
                .max()
                .map_or(1, |max| max + 1)
        });

        let record = DeadLetterRecord {
            id: Uuid::new_v4(),
            sequence,
            queue: letter.queue,
            target: letter.target,
            handler: letter.handler,
            content_type: letter.content_type,
            message: letter.message,
            error: letter.error,
        };
        state.working.letters.push(record.clone());

        Ok(record)
    }

    async fn pending(&self) -> Result<Vec<DeadLetterRecord>, StoreError> {
        let mut letters = self.lock()?.working.letters.clone();
        letters.sort_by_key(|r| r.sequence);
        Ok(letters)
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterRecord>, StoreError> {
        Ok(self
            .lock()?
            .working
            .letters
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let before = state.working.letters.len();
        state.working.letters.retain(|r| r.id != id);
        if state.working.letters.len() == before {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn set_error(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let record = state
            .working
            .letters
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.error = error.to_owned();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn letter(sequence: Option<u64>) -> DeadLetter {
        let letter = DeadLetter::new("q", "Model.Test", "insert", b"{}".to_vec());
        match sequence {
            Some(s) => letter.sequence(s),
            None => letter,
        }
    }

    #[tokio::test]
    async fn test_resolve_unknown_profile_is_a_config_fault() {
        let store = MemoryStore::new().with_profile("default", "amqp://localhost");

        assert_eq!(resolve_profile(&store, "default").await.unwrap(), "amqp://localhost");
        assert_eq!(
            resolve_profile(&store, "other").await.unwrap_err(),
            AmqpError::Config(ConfigError::UnknownProfile("other".to_owned()))
        );
    }

    #[tokio::test]
    async fn test_rollback_discards_uncommitted_writes() {
        let store = MemoryStore::new();
        store.insert(letter(Some(1))).await.unwrap();
        store.commit().await.unwrap();

        store.insert(letter(Some(2))).await.unwrap();
        assert_eq!(store.dead_letters().len(), 2);

        store.rollback().await.unwrap();
        let kept = store.dead_letters();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].sequence, 1);
    }

    #[tokio::test]
    async fn test_pending_is_ordered_by_sequence() {
        let store = MemoryStore::new();
        store.insert(letter(Some(7))).await.unwrap();
        store.insert(letter(Some(3))).await.unwrap();
        store.insert(letter(Some(5))).await.unwrap();

        let seqs: Vec<u64> = store.pending().await.unwrap().iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![3, 5, 7]);
    }

    #[tokio::test]
    async fn test_missing_sequence_follows_the_highest() {
        let store = MemoryStore::new();
        assert_eq!(store.insert(letter(None)).await.unwrap().sequence, 1);
        store.insert(letter(Some(41))).await.unwrap();
        assert_eq!(store.insert(letter(None)).await.unwrap().sequence, 42);
    }

    #[tokio::test]
    async fn test_profile_status_and_url() {
        let store = MemoryStore::new().with_profile("default", "amqp://localhost");
        assert_eq!(store.profile_url("default").await.unwrap(), "amqp://localhost");
        assert_eq!(
            store.profile_url("other").await,
            Err(StoreError::NotFound("other".to_owned()))
        );

        store.set_status("default", ProfileStatus::Connected).await.unwrap();
        assert_eq!(
            store.profile("default").map(|p| p.status),
            Some(ProfileStatus::Connected)
        );
    }

    #[tokio::test]
    async fn test_delete_and_set_error() {
        let store = MemoryStore::new();
        let record = store.insert(letter(Some(1))).await.unwrap();

        store.set_error(record.id, "boom").await.unwrap();
        assert_eq!(store.get(record.id).await.unwrap().map(|r| r.error), Some("boom".to_owned()));

        store.delete(record.id).await.unwrap();
        assert!(store.get(record.id).await.unwrap().is_none());
        assert!(matches!(store.delete(record.id).await, Err(StoreError::NotFound(_))));
    }
}
