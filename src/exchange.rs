// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Exchanges a worker can declare at startup as part of its
//! [`Topology`](crate::topology::Topology).

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) auto_delete: bool,
    pub(crate) durable: bool,
}

impl ExchangeDefinition {
    /// A non-durable direct exchange named `name`.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            auto_delete: false,
            durable: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// The broker deletes the exchange once its last binding goes away.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_transient_direct_exchange() {
        let def = ExchangeDefinition::new("orders");

        assert_eq!(def.name(), "orders");
        assert_eq!(def.kind, ExchangeKind::Direct);
        assert!(!def.durable);
        assert!(!def.auto_delete);
    }

    #[test]
    fn test_kind_maps_to_broker_kind() {
        assert!(matches!(
            lapin::ExchangeKind::from(&ExchangeKind::Topic),
            lapin::ExchangeKind::Topic
        ));
        assert!(matches!(
            lapin::ExchangeKind::from(&ExchangeKind::Headers),
            lapin::ExchangeKind::Headers
        ));
    }
}
