// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Registry
//!
//! Queue name to consumer mapping, iterated in insertion order so consumers are
//! registered on every new channel in the order they were added.

use crate::{consumer::Consumer, errors::AmqpError};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

/// Consumers keyed by queue name. At most one consumer per queue.
#[derive(Default)]
pub struct ConsumerRegistry {
    positions: HashMap<String, u64>,
    entries: BTreeMap<u64, Arc<dyn Consumer>>,
    next: u64,
}

impl ConsumerRegistry {
    /// Adds `consumer` under its queue name. Fails without touching the registry
    /// when the name is taken.
    pub fn insert(&mut self, consumer: Arc<dyn Consumer>) -> Result<(), AmqpError> {
        let queue = consumer.queue_name().to_owned();
        if self.positions.contains_key(&queue) {
            return Err(AmqpError::DuplicateQueueNameError(queue));
        }

        self.positions.insert(queue, self.next);
        self.entries.insert(self.next, consumer);
        self.next += 1;
        Ok(())
    }

    pub fn get(&self, queue: &str) -> Option<Arc<dyn Consumer>> {
        self.positions
            .get(queue)
            .and_then(|pos| self.entries.get(pos))
            .cloned()
    }

    /// Forgets the consumer of `queue`, returning it if there was one.
    pub fn remove(&mut self, queue: &str) -> Option<Arc<dyn Consumer>> {
        let pos = self.positions.remove(queue)?;
        self.entries.remove(&pos)
    }

    pub fn contains(&self, queue: &str) -> bool {
        self.positions.contains_key(queue)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates consumers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Consumer>> {
        self.entries.values()
    }

    /// Queue names in insertion order.
    pub fn queue_names(&self) -> Vec<String> {
        self.iter().map(|c| c.queue_name().to_owned()).collect()
    }
}
