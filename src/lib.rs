//! msgflow - idempotent event pipeline
//!
//! A producer emits `message.created` events, a processor idempotently
//! advances each message through its status lifecycle and republishes
//! `message.status.updated`, and a notifier reacts to status changes.
//! Kafka and RabbitMQ are interchangeable behind the `MessageBroker` trait.

pub mod bus;
pub mod config;
pub mod contract;
pub mod dlq;
pub mod handlers;
pub mod producer;
pub mod storage;
pub mod utils;

#[cfg(test)]
mod test_utils;
