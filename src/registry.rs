// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Registry
//!
//! Consumers are declared once, before any worker starts. Registration is
//! where misconfiguration is caught: a consumer without a queue name, without
//! a schema, or bound to a queue some other consumer already owns is refused
//! with a [`ConfigError`], so it can never reach live traffic.

use crate::{
    errors::ConfigError,
    handler::{ConsumerHandler, Decoder, PayloadHandler, SchemaConsumer},
};
use std::{collections::BTreeMap, fmt, sync::Arc};
use tracing::debug;

/// Which handler processes messages from which queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerBinding {
    queue: String,
    target: String,
    handler: String,
}

impl ConsumerBinding {
    /// Creates a binding of `queue` to the `target`.`handler` routine.
    pub fn new(queue: &str, target: &str, handler: &str) -> Self {
        ConsumerBinding {
            queue: queue.to_owned(),
            target: target.to_owned(),
            handler: handler.to_owned(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn handler(&self) -> &str {
        &self.handler
    }
}

impl fmt::Display for ConsumerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}.{}", self.queue, self.target, self.handler)
    }
}

/// Resolves the routine recorded for a target/handler pair.
pub trait HandlerRegistry: Send + Sync {
    fn resolve(&self, target: &str, handler: &str) -> Option<Arc<dyn ConsumerHandler>>;
}

/// Declaration of one consumer, checked by [`Registry::register`].
pub struct ConsumerDescription {
    target: String,
    handler: String,
    queue: Option<String>,
    processes: usize,
    consumer: Option<Arc<dyn ConsumerHandler>>,
}

impl ConsumerDescription {
    /// Starts the declaration of the `handler` routine of `target`.
    ///
    /// # Parameters
    /// * `target` - Name of the model or component owning the routine
    /// * `handler` - Name of the routine on that target
    ///
    /// # Returns
    /// A description with no queue and no schema, to be completed with
    /// [`queue`](Self::queue) and [`schema`](Self::schema)
    pub fn new(target: &str, handler: &str) -> Self {
        ConsumerDescription {
            target: target.to_owned(),
            handler: handler.to_owned(),
            queue: None,
            processes: 0,
            consumer: None,
        }
    }

    /// Queue the consumer reads from.
    pub fn queue(mut self, name: &str) -> Self {
        self.queue = Some(name.to_owned());
        self
    }

    /// Groups the consumer with the others declaring the same value, so that
    /// separate worker processes can each consume a distinct subset.
    pub fn processes(mut self, processes: usize) -> Self {
        self.processes = processes;
        self
    }

    /// Attaches the decoder validating payloads and the handler receiving
    /// the decoded value.
    ///
    /// # Parameters
    /// * `decoder` - Turns the raw message text into `D::Output`
    /// * `handler` - Called with each successfully decoded payload
    pub fn schema<D, H>(mut self, decoder: D, handler: H) -> Self
    where
        D: Decoder + 'static,
        H: PayloadHandler<D::Output> + 'static,
    {
        self.consumer = Some(Arc::new(SchemaConsumer::new(decoder, handler)));
        self
    }
}

struct RegisteredConsumer {
    binding: ConsumerBinding,
    processes: usize,
    consumer: Arc<dyn ConsumerHandler>,
}

/// Declared consumers, shared by workers and dead-letter replay.
#[derive(Default)]
pub struct Registry {
    consumers: Vec<RegisteredConsumer>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Registry::default()
    }

    /// Registers a consumer, refusing misconfigured declarations.
    ///
    /// # Parameters
    /// * `desc` - The consumer declaration
    ///
    /// # Returns
    /// The registry including the new consumer, or a [`ConfigError`] naming
    /// the missing queue name, the missing schema or the duplicate queue
    pub fn register(mut self, desc: ConsumerDescription) -> Result<Self, ConfigError> {
        let queue = match desc.queue {
            Some(q) if !q.trim().is_empty() => q,
            _ => {
                return Err(ConfigError::NoQueueName {
                    target: desc.target,
                    handler: desc.handler,
                })
            }
        };

        let Some(consumer) = desc.consumer else {
            return Err(ConfigError::NoSchema {
                target: desc.target,
                handler: desc.handler,
            });
        };

        if let Some(existing) = self.consumers.iter().find(|c| c.binding.queue == queue) {
            return Err(ConfigError::DuplicateQueue {
                queue,
                first: format!("{}.{}", existing.binding.target, existing.binding.handler),
                second: format!("{}.{}", desc.target, desc.handler),
            });
        }

        let binding = ConsumerBinding::new(&queue, &desc.target, &desc.handler);
        debug!(binding = %binding, processes = desc.processes, "consumer registered");

        self.consumers.push(RegisteredConsumer {
            binding,
            processes: desc.processes,
            consumer,
        });

        Ok(self)
    }

    /// All bindings, in registration order.
    pub fn bindings(&self) -> Vec<ConsumerBinding> {
        self.consumers.iter().map(|c| c.binding.clone()).collect()
    }

    /// Bindings partitioned by their declared `processes` value.
    pub fn consumer_groups(&self) -> BTreeMap<usize, Vec<ConsumerBinding>> {
        let mut groups: BTreeMap<usize, Vec<ConsumerBinding>> = BTreeMap::new();
        for c in &self.consumers {
            groups.entry(c.processes).or_default().push(c.binding.clone());
        }
        groups
    }
}

impl HandlerRegistry for Registry {
    fn resolve(&self, target: &str, handler: &str) -> Option<Arc<dyn ConsumerHandler>> {
        self.consumers
            .iter()
            .find(|c| c.binding.target == target && c.binding.handler == handler)
            .map(|c| c.consumer.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::HandlerError,
        handler::JsonDecoder,
        status::MessageOutcome,
    };
    use async_trait::async_trait;
    use opentelemetry::Context;
    use serde_json::Value;

    struct Ack;

    #[async_trait]
    impl PayloadHandler<Value> for Ack {
        async fn handle(&self, _: &Context, _: Value) -> Result<MessageOutcome, HandlerError> {
            Ok(MessageOutcome::Acknowledge)
        }
    }

    fn consumer(target: &str, handler: &str, queue: &str) -> ConsumerDescription {
        ConsumerDescription::new(target, handler)
            .queue(queue)
            .schema(JsonDecoder::<Value>::new(), Ack)
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = Registry::new()
            .register(consumer("Model.Test", "insert", "unittest_queue"))
            .unwrap();

        assert_eq!(
            registry.bindings(),
            vec![ConsumerBinding::new("unittest_queue", "Model.Test", "insert")]
        );
        assert!(registry.resolve("Model.Test", "insert").is_some());
        assert!(registry.resolve("Model.Test", "delete").is_none());
    }

    #[test]
    fn test_duplicate_queue_is_config_error() {
        let err = Registry::new()
            .register(consumer("Model.A", "one", "shared"))
            .unwrap()
            .register(consumer("Model.B", "two", "shared"))
            .err()
            .unwrap();

        assert_eq!(
            err,
            ConfigError::DuplicateQueue {
                queue: "shared".to_owned(),
                first: "Model.A.one".to_owned(),
                second: "Model.B.two".to_owned(),
            }
        );
    }

    #[test]
    fn test_missing_queue_name() {
        let desc = ConsumerDescription::new("Model.A", "one").schema(JsonDecoder::<Value>::new(), Ack);
        assert!(matches!(
            Registry::new().register(desc),
            Err(ConfigError::NoQueueName { .. })
        ));

        let blank = consumer("Model.A", "one", "  ");
        assert!(matches!(
            Registry::new().register(blank),
            Err(ConfigError::NoQueueName { .. })
        ));
    }

    #[test]
    fn test_missing_schema() {
        let desc = ConsumerDescription::new("Model.A", "one").queue("q");
        assert!(matches!(
            Registry::new().register(desc),
            Err(ConfigError::NoSchema { ref target, .. }) if target == "Model.A"
        ));
    }

    #[test]
    fn test_consumer_groups_partition_by_processes() {
        let registry = Registry::new()
            .register(consumer("Model.A", "one", "q1"))
            .unwrap()
            .register(consumer("Model.B", "two", "q2").processes(2))
            .unwrap()
            .register(consumer("Model.C", "three", "q3").processes(2))
            .unwrap();

        let groups = registry.consumer_groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[&0].len(), 1);
        assert_eq!(
            groups[&2].iter().map(|b| b.queue()).collect::<Vec<_>>(),
            vec!["q2", "q3"]
        );
    }
}
