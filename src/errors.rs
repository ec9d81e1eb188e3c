// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Supervisor
//!
//! `AmqpError` covers every failure the supervisor, its broker collaborators and
//! the publisher can report. Shutdown paths never return errors; they collect
//! them into a [`ShutdownReport`] instead.

use thiserror::Error;
use tracing::{debug, warn};

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Connection, channel and consume-loop errors are recovered by the supervisor's
/// run loop. `ConsumerRegistrationError` is fatal and ends the run loop.
/// `DuplicateQueueNameError` is returned synchronously to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// A consumer's channel hook or registration failed
    #[error("failure to register consumer for queue `{0}`: {1}")]
    ConsumerRegistrationError(String, String),

    /// The blocking consume loop ended with an error
    #[error("consume loop failure: {0}")]
    ConsumeLoopError(String),

    /// Error closing a channel or a connection
    #[error("failure to shutdown: {0}")]
    ShutdownError(String),

    /// A consumer for the queue is already registered
    #[error("the queue `{0}` already has a consumer")]
    DuplicateQueueNameError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error cancelling a consumer registration
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error serializing a message payload
    #[error("failure to serialize payload")]
    SerializePayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// The supervisor behind a handle was dropped
    #[error("supervisor is gone")]
    SupervisorGone,

    /// A previous run is still shutting down
    #[error("supervisor is shutting down")]
    ShuttingDown,
}

/// A step of a best-effort shutdown sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStep {
    StopConsuming,
    CloseChannel,
    CloseConnection,
}

/// Failures collected while shutting down. Every step runs regardless of the
/// outcome of the previous ones.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    failures: Vec<(ShutdownStep, AmqpError)>,
}

impl ShutdownReport {
    /// Records the outcome of a step, logging failures.
    pub(crate) fn record(&mut self, step: ShutdownStep, result: Result<(), AmqpError>) {
        match result {
            Ok(()) => debug!(step = ?step, "shutdown step succeeded"),
            Err(err) => {
                warn!(step = ?step, error = err.to_string(), "shutdown step failed");
                self.failures.push((step, err));
            }
        }
    }

    /// Returns true when every step succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// The failed steps with their errors, in the order they ran.
    pub fn failures(&self) -> &[(ShutdownStep, AmqpError)] {
        &self.failures
    }

    /// Checks whether a given step failed.
    ///
    /// # Parameters
    /// * `step` - The shutdown step to look up
    ///
    /// # Returns
    /// `true` if `step` ran and returned an error
    pub fn failed(&self, step: ShutdownStep) -> bool {
        self.failures.iter().any(|(s, _)| *s == step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_keeps_every_failed_step() {
        let mut report = ShutdownReport::default();
        report.record(ShutdownStep::StopConsuming, Ok(()));
        report.record(
            ShutdownStep::CloseChannel,
            Err(AmqpError::ShutdownError("channel already closed".to_owned())),
        );
        report.record(
            ShutdownStep::CloseConnection,
            Err(AmqpError::ShutdownError("socket reset".to_owned())),
        );

        assert!(!report.is_clean());
        assert_eq!(report.failures().len(), 2);
        assert!(!report.failed(ShutdownStep::StopConsuming));
        assert!(report.failed(ShutdownStep::CloseChannel));
        assert!(report.failed(ShutdownStep::CloseConnection));
    }

    #[test]
    fn registration_error_names_the_queue() {
        let err = AmqpError::ConsumerRegistrationError("jobs".to_owned(), "boom".to_owned());
        assert_eq!(
            err.to_string(),
            "failure to register consumer for queue `jobs`: boom"
        );
    }
}
