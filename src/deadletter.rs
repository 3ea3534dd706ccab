// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dead-Letter Store
//!
//! Messages whose handler failed, or gave no definitive answer, are kept in
//! a durable side table instead of being redelivered forever. Each record is
//! keyed by a sequence number (the delivery tag on the live path) and the
//! replay procedure walks the backlog in ascending sequence order, so that
//! related messages are applied again in their original relative order.
//!
//! Replay is one sequential pass per call. Callers that want continuous
//! draining call [`DeadLetters::replay_all`] again, on a schedule for
//! instance.

use crate::{
    consumer::invoke,
    errors::StoreError,
    handler::ConsumerMessage,
    registry::HandlerRegistry,
    status::MessageOutcome,
    store::DeadLetterStore,
};
use opentelemetry::Context;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// A message to capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub message: Vec<u8>,
    pub content_type: String,
    pub queue: String,
    pub target: String,
    pub handler: String,
    pub error: String,
    pub sequence: Option<u64>,
}

impl DeadLetter {
    pub fn new(queue: &str, target: &str, handler: &str, message: Vec<u8>) -> Self {
        DeadLetter {
            message,
            content_type: String::new(),
            queue: queue.to_owned(),
            target: target.to_owned(),
            handler: handler.to_owned(),
            error: String::new(),
            sequence: None,
        }
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_owned();
        self
    }

    pub fn error(mut self, error: &str) -> Self {
        self.error = error.to_owned();
        self
    }

    pub fn sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

/// A captured message pending replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterRecord {
    pub id: Uuid,
    pub sequence: u64,
    pub queue: String,
    pub target: String,
    pub handler: String,
    pub content_type: String,
    pub message: Vec<u8>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// The handler acknowledged, the record is gone.
    Replayed,
    /// The record stays pending with this error.
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub replayed: usize,
    pub failed: usize,
}

/// Enqueue and replay over a [`DeadLetterStore`].
pub struct DeadLetters<R: ?Sized, S: ?Sized> {
    registry: Arc<R>,
    store: Arc<S>,
    autocommit: bool,
}

impl<R, S> DeadLetters<R, S>
where
    R: HandlerRegistry + ?Sized,
    S: DeadLetterStore + ?Sized,
{
    /// Creates the dead-letter access with autocommit on.
    ///
    /// # Parameters
    /// * `registry` - Resolves the routine each record is replayed to
    /// * `store` - Holds the dead-letter table
    pub fn new(registry: Arc<R>, store: Arc<S>) -> Self {
        DeadLetters {
            registry,
            store,
            autocommit: true,
        }
    }

    /// When off, enqueue and replay never commit or roll back.
    pub fn autocommit(mut self, autocommit: bool) -> Self {
        self.autocommit = autocommit;
        self
    }

    /// Captures a message for later replay.
    ///
    /// # Returns
    /// The stored record, with an assigned sequence when `letter` had none
    pub async fn enqueue(&self, letter: DeadLetter) -> Result<DeadLetterRecord, StoreError> {
        let record = self.store.insert(letter).await?;
        if self.autocommit {
            self.store.commit().await?;
        }
        Ok(record)
    }

    /// Replays every pending record once, in ascending sequence order.
    pub async fn replay_all(&self) -> Result<ReplayReport, StoreError> {
        let pending = self.store.pending().await?;
        let mut report = ReplayReport::default();

        for record in &pending {
            match self.replay_one(record).await? {
                ReplayOutcome::Replayed => report.replayed += 1,
                ReplayOutcome::Failed(_) => report.failed += 1,
            }
        }

        info!(
            replayed = report.replayed,
            failed = report.failed,
            "dead letter replay finished"
        );
        Ok(report)
    }

    /// Replays a single record without touching the rest of the backlog.
    ///
    /// With autocommit each record is its own unit of work, rolled back
    /// before and committed after. Without it the caller owns the commit
    /// boundaries and nothing uncommitted is discarded.
    pub async fn replay_one(&self, record: &DeadLetterRecord) -> Result<ReplayOutcome, StoreError> {
        if self.autocommit {
            self.store.rollback().await?;
        }

        let msg = ConsumerMessage::new(&record.queue, &record.target, &record.handler, &record.message);
        let invocation = invoke(
            &*self.registry,
            &*self.store,
            &Context::current(),
            &msg,
            self.autocommit,
        )
        .await;

        let outcome = match invocation.outcome {
            MessageOutcome::Acknowledge => {
                self.store.delete(record.id).await?;
                info!(
                    queue = record.queue,
                    sequence = record.sequence,
                    "dead letter replayed"
                );
                ReplayOutcome::Replayed
            }
            other => {
                let error = if invocation.error.is_empty() {
                    format!("handler answered `{other}` on replay")
                } else {
                    invocation.error
                };
                self.store.set_error(record.id, &error).await?;
                warn!(
                    queue = record.queue,
                    sequence = record.sequence,
                    error,
                    "dead letter still failing"
                );
                ReplayOutcome::Failed(error)
            }
        };

        if self.autocommit {
            self.store.commit().await?;
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::HandlerError,
        handler::{JsonDecoder, PayloadHandler},
        registry::{ConsumerDescription, Registry},
        store::{MemoryStore, Transactional},
    };
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::sync::Mutex;

    #[derive(Deserialize)]
    struct Row {
        #[allow(dead_code)]
        label: String,
        number: i64,
    }

    #[derive(Default)]
    struct Rows(Mutex<Vec<i64>>);

    struct Insert(Arc<Rows>);

    #[async_trait]
    impl PayloadHandler<Row> for Insert {
        async fn handle(&self, _: &Context, row: Row) -> Result<MessageOutcome, HandlerError> {
            self.0 .0.lock().unwrap().push(row.number);
            Ok(MessageOutcome::Acknowledge)
        }
    }

    struct Nack;

    #[async_trait]
    impl PayloadHandler<Row> for Nack {
        async fn handle(&self, _: &Context, _: Row) -> Result<MessageOutcome, HandlerError> {
            Ok(MessageOutcome::NegativeAcknowledge)
        }
    }

    fn setup() -> (Arc<Rows>, DeadLetters<Registry, MemoryStore>, Arc<MemoryStore>) {
        let rows = Arc::new(Rows::default());
        let registry = Registry::new()
            .register(
                ConsumerDescription::new("Model.Test", "insert")
                    .queue("test")
                    .schema(JsonDecoder::<Row>::new(), Insert(rows.clone())),
            )
            .unwrap()
            .register(
                ConsumerDescription::new("Model.Test", "nack")
                    .queue("test_nack")
                    .schema(JsonDecoder::<Row>::new(), Nack),
            )
            .unwrap();
        let store = Arc::new(MemoryStore::new());
        (rows, DeadLetters::new(Arc::new(registry), store.clone()), store)
    }

    fn letter(body: &str) -> DeadLetter {
        DeadLetter::new("test", "Model.Test", "insert", body.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_replay_one_ok_deletes_record() {
        let (rows, dead_letters, store) = setup();
        let record = dead_letters
            .enqueue(letter(r#"{"label": "label", "number": 1}"#))
            .await
            .unwrap();

        let outcome = dead_letters.replay_one(&record).await.unwrap();

        assert_eq!(outcome, ReplayOutcome::Replayed);
        assert_eq!(*rows.0.lock().unwrap(), vec![1]);
        assert!(store.committed_dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_replay_one_ko_keeps_record_with_error() {
        let (rows, dead_letters, store) = setup();
        let record = dead_letters
            .enqueue(letter(r#"{"label": "label"}"#))
            .await
            .unwrap();

        let outcome = dead_letters.replay_one(&record).await.unwrap();

        assert!(matches!(outcome, ReplayOutcome::Failed(ref e) if e.contains("number")));
        assert!(rows.0.lock().unwrap().is_empty());
        let kept = store.committed_dead_letters();
        assert_eq!(kept.len(), 1);
        assert!(!kept[0].error.is_empty());
    }

    #[tokio::test]
    async fn test_replay_all_follows_sequence_not_insertion() {
        let (rows, dead_letters, store) = setup();
        dead_letters
            .enqueue(letter(r#"{"label": "label", "number": 2}"#).sequence(2))
            .await
            .unwrap();
        dead_letters
            .enqueue(letter(r#"{"label": "label", "number": 1}"#).sequence(1))
            .await
            .unwrap();

        let report = dead_letters.replay_all().await.unwrap();

        assert_eq!(report, ReplayReport { replayed: 2, failed: 0 });
        assert_eq!(*rows.0.lock().unwrap(), vec![1, 2]);
        assert!(store.committed_dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_replay_is_idempotent_on_success() {
        let (rows, dead_letters, store) = setup();
        dead_letters
            .enqueue(letter(r#"{"label": "label", "number": 1}"#).sequence(1))
            .await
            .unwrap();

        assert_eq!(dead_letters.replay_all().await.unwrap().replayed, 1);
        assert_eq!(dead_letters.replay_all().await.unwrap(), ReplayReport::default());
        assert_eq!(rows.0.lock().unwrap().len(), 1);
        assert!(store.committed_dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_replay_all_without_autocommit_keeps_earlier_deletions() {
        let (rows, dead_letters, store) = setup();
        dead_letters
            .enqueue(letter(r#"{"label": "label", "number": 1}"#).sequence(1))
            .await
            .unwrap();
        dead_letters
            .enqueue(letter(r#"{"label": "label", "number": 2}"#).sequence(2))
            .await
            .unwrap();
        let dead_letters = dead_letters.autocommit(false);

        let report = dead_letters.replay_all().await.unwrap();

        assert_eq!(report, ReplayReport { replayed: 2, failed: 0 });
        assert_eq!(*rows.0.lock().unwrap(), vec![1, 2]);
        assert!(store.dead_letters().is_empty());
        assert_eq!(store.committed_dead_letters().len(), 2);

        store.commit().await.unwrap();
        assert!(store.committed_dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_replay_one_of_uncommitted_record_without_autocommit() {
        let (_, dead_letters, store) = setup();
        let dead_letters = dead_letters.autocommit(false);
        let ok = dead_letters
            .enqueue(letter(r#"{"label": "label", "number": 1}"#))
            .await
            .unwrap();
        let ko = dead_letters
            .enqueue(letter(r#"{"label": "label"}"#))
            .await
            .unwrap();

        assert_eq!(dead_letters.replay_one(&ok).await.unwrap(), ReplayOutcome::Replayed);
        assert!(matches!(dead_letters.replay_one(&ko).await.unwrap(), ReplayOutcome::Failed(_)));

        let working = store.dead_letters();
        assert_eq!(working.len(), 1);
        assert_eq!(working[0].id, ko.id);
        assert!(!working[0].error.is_empty());
        assert!(store.committed_dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_replay_nack_is_not_success() {
        let (_, dead_letters, store) = setup();
        let record = dead_letters
            .enqueue(
                DeadLetter::new(
                    "test_nack",
                    "Model.Test",
                    "nack",
                    br#"{"label": "l", "number": 1}"#.to_vec(),
                )
                .sequence(1),
            )
            .await
            .unwrap();

        let outcome = dead_letters.replay_one(&record).await.unwrap();

        assert_eq!(outcome, ReplayOutcome::Failed("handler answered `nack` on replay".to_owned()));
        assert_eq!(store.committed_dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn test_replay_unknown_target_stays_pending() {
        let (_, dead_letters, store) = setup();
        dead_letters
            .enqueue(DeadLetter::new("gone", "Model.Gone", "insert", b"{}".to_vec()))
            .await
            .unwrap();

        let report = dead_letters.replay_all().await.unwrap();

        assert_eq!(report.failed, 1);
        let kept = store.committed_dead_letters();
        assert!(kept[0].error.contains("Model.Gone.insert"));
    }
}
