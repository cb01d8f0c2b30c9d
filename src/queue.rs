// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Metadata
//!
//! Metadata returned by queue declarations: the server-confirmed queue name
//! and its current message/consumer counts.

/// Snapshot of a declared queue, as reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    name: String,
    messages: u32,
    consumers: u32,
}

impl QueueInfo {
    pub(crate) fn new(name: String, messages: u32, consumers: u32) -> QueueInfo {
        QueueInfo {
            name,
            messages,
            consumers,
        }
    }

    /// The queue name confirmed by the broker.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of messages ready in the queue at declaration time.
    pub fn messages(&self) -> u32 {
        self.messages
    }

    /// Number of consumers attached to the queue at declaration time.
    pub fn consumers(&self) -> u32 {
        self.consumers
    }
}

impl From<lapin::Queue> for QueueInfo {
    fn from(queue: lapin::Queue) -> QueueInfo {
        QueueInfo::new(
            queue.name().to_string(),
            queue.message_count(),
            queue.consumer_count(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposes_the_declared_counts() {
        let info = QueueInfo::new("orders".to_owned(), 3, 1);

        assert_eq!(info.name(), "orders");
        assert_eq!(info.messages(), 3);
        assert_eq!(info.consumers(), 1);
    }
}
