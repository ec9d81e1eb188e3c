// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Supervises a long-lived RabbitMQ connection: named consumers share one
//! channel under a global prefetch limit, and connection, channel and consume
//! failures are recovered automatically.

mod dispatcher;
mod otel;
#[cfg(test)]
mod testing;

pub mod broker;
pub mod channel;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod supervisor;
