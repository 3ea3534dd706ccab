// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Worker Lifecycle State Machine
//!
//! The connection lifecycle as an explicit state machine. [`Lifecycle`]
//! consumes [`LifecycleEvent`]s and answers with the [`Command`]s the driver
//! in [`worker`](crate::worker) must execute. It performs no I/O.
//!
//! ```text
//! Disconnected --start--> Connecting --opened--> Connected --channel--> ChannelOpening
//!      ^                      |                                              |
//!      |backoff          open failed                                  consumers declared
//!      +----------------------+                                              v
//!      +----------------- connection lost (not closing) ------------- Consuming
//!                                                                            |
//!                                  Closed <--connection closed-- Closing <--stop
//! ```
//!
//! The `closing` flag is only set by a stop request. Once set, any loss of
//! the connection is terminal instead of triggering a reconnect.

use crate::status::ProfileStatus;
use std::{fmt, time::Duration};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    ChannelOpening,
    Consuming,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Start,
    ConnectionOpened,
    ConnectionOpenFailed(String),
    ConnectionClosed(String),
    ChannelOpened,
    ChannelClosed(String),
    ConsumersDeclared(Vec<String>),
    CancelOk(String),
    ReconnectDue,
    StopRequested,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect,
    AbortConnect,
    OpenChannel,
    DeclareConsumers,
    CancelConsumer(String),
    CloseChannel,
    CloseConnection,
    ScheduleReconnect(Duration),
    PersistStatus(ProfileStatus),
    StopLoop,
}

/// Exponential reconnect delay, reset once consuming again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Backoff {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[derive(Debug)]
pub struct Lifecycle {
    state: ConnectionState,
    closing: bool,
    consumer_tags: Vec<String>,
    backoff: Backoff,
}

impl Lifecycle {
    pub fn new(backoff: Backoff) -> Self {
        Lifecycle {
            state: ConnectionState::Disconnected,
            closing: false,
            consumer_tags: vec![],
            backoff,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Consuming
    }

    pub fn consumer_tags(&self) -> &[String] {
        &self.consumer_tags
    }

    pub fn on_event(&mut self, event: LifecycleEvent) -> Vec<Command> {
        use ConnectionState as S;
        use LifecycleEvent as E;

        let before = self.state;
        let commands = match (self.state, event) {
            (_, E::StopRequested) => self.stop(),

            (S::Disconnected, E::Start) | (S::Disconnected, E::ReconnectDue) => {
                self.state = S::Connecting;
                vec![Command::Connect]
            }
            (S::Closed, E::Start) => vec![Command::StopLoop],

            (S::Connecting, E::ConnectionOpened) => {
                self.state = S::Connected;
                vec![
                    Command::PersistStatus(ProfileStatus::Connected),
                    Command::OpenChannel,
                ]
            }
            (S::Connecting, E::ConnectionOpenFailed(reason)) => {
                warn!(reason, "connection open failed");
                self.lost()
            }

            (S::Connected, E::ChannelOpened) => {
                self.state = S::ChannelOpening;
                vec![Command::DeclareConsumers]
            }
            (S::ChannelOpening, E::ConsumersDeclared(tags)) => {
                self.state = S::Consuming;
                self.consumer_tags = tags;
                self.backoff.reset();
                vec![]
            }

            (S::Connected | S::ChannelOpening | S::Consuming, E::ChannelClosed(reason)) => {
                warn!(reason, "channel was closed");
                self.consumer_tags.clear();
                self.state = S::Connected;
                vec![Command::CloseConnection]
            }

            (S::Closing, E::ChannelOpened) => vec![Command::CloseChannel, Command::CloseConnection],
            (S::Closing, E::ConsumersDeclared(tags)) => {
                self.consumer_tags = tags;
                self.cancel_consumers()
            }
            (S::Closing, E::CancelOk(tag)) => {
                info!(consumer_tag = tag, "broker acknowledged the cancellation of the consumer");
                self.consumer_tags.retain(|t| *t != tag);
                if self.consumer_tags.is_empty() {
                    vec![Command::CloseChannel, Command::CloseConnection]
                } else {
                    vec![]
                }
            }
            (S::Closing, E::ChannelClosed(_)) => {
                self.consumer_tags.clear();
                vec![Command::CloseConnection]
            }

            (S::Disconnected | S::Closed, E::ConnectionClosed(_)) => vec![],
            (_, E::ConnectionClosed(reason)) => {
                if !self.closing {
                    warn!(reason, "connection closed, reconnect necessary");
                }
                self.lost()
            }

            (state, event) => {
                debug!(state = %state, event = ?event, "event ignored");
                vec![]
            }
        };

        if before != self.state {
            info!(from = %before, to = %self.state, "worker state changed");
        }

        commands
    }

    fn stop(&mut self) -> Vec<Command> {
        use ConnectionState as S;

        if self.closing {
            info!("worker is already stopping");
            return vec![];
        }
        self.closing = true;

        match self.state {
            S::Disconnected => {
                self.state = S::Closed;
                vec![Command::StopLoop]
            }
            S::Connecting => {
                self.state = S::Closed;
                vec![Command::AbortConnect, Command::StopLoop]
            }
            S::Connected => {
                self.state = S::Closing;
                vec![
                    Command::PersistStatus(ProfileStatus::Disconnected),
                    Command::CloseConnection,
                ]
            }
            S::ChannelOpening => {
                self.state = S::Closing;
                vec![Command::PersistStatus(ProfileStatus::Disconnected)]
            }
            S::Consuming => {
                self.state = S::Closing;
                let mut commands = vec![Command::PersistStatus(ProfileStatus::Disconnected)];
                commands.extend(self.cancel_consumers());
                commands
            }
            S::Closing | S::Closed => vec![],
        }
    }

    fn cancel_consumers(&self) -> Vec<Command> {
        if self.consumer_tags.is_empty() {
            return vec![Command::CloseChannel, Command::CloseConnection];
        }
        self.consumer_tags
            .iter()
            .cloned()
            .map(Command::CancelConsumer)
            .collect()
    }

    /// The connection is gone: terminal while closing, reconnect otherwise.
    fn lost(&mut self) -> Vec<Command> {
        self.consumer_tags.clear();

        if self.closing {
            self.state = ConnectionState::Closed;
            return vec![Command::StopLoop];
        }

        let reconnect = Command::ScheduleReconnect(self.backoff.next_delay());
        let was_connected = self.state != ConnectionState::Connecting;
        self.state = ConnectionState::Disconnected;

        if was_connected {
            vec![Command::PersistStatus(ProfileStatus::Disconnected), reconnect]
        } else {
            vec![reconnect]
        }
    }
}
