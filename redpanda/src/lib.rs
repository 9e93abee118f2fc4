//! Redpanda collaborators for Conveyor.
//!
//! This crate connects Conveyor to Redpanda, or any Kafka-compatible broker,
//! through rdkafka:
//!
//! - **[`RedpandaProducer`]**: an [`EventProducer`](conveyor_core::producer::EventProducer)
//!   for gateways, with per-call [`RedpandaProduceOptions`] (partition key, headers)
//! - **[`RedpandaEventLog`]**: an [`EventLog`](conveyor_core::event_log::EventLog)
//!   that reads a stream from partition 0 of the topic of the same name
//!
//! # Wire Format
//!
//! Every record payload is a bincode-encoded
//! [`SerializedEvent`](conveyor_core::event::SerializedEvent), metadata
//! included. What one gateway produces another subscription can read back.
//!
//! ```text
//! ┌──────────────┐  produce   ┌──────────────────┐  assign @ from+1  ┌──────────────┐
//! │   Gateway    │ ─────────▶ │ topic, partition │ ────────────────▶ │ Subscription │
//! └──────────────┘            └──────────────────┘                   └──────────────┘
//! ```
//!
//! # Delivery Semantics
//!
//! At-least-once in both directions. A produce returns once the broker
//! acknowledged every message of the call. The event log never commits
//! offsets; progress lives in the subscription's checkpoint store.
//!
//! # Example
//!
//! ```no_run
//! use conveyor_redpanda::{RedpandaEventLog, RedpandaProduceOptions, RedpandaProducer};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let producer = RedpandaProducer::new("localhost:9092")?;
//! let log = RedpandaEventLog::new("localhost:9092").with_consumer_group("order-gateway");
//! let options = RedpandaProduceOptions::keyed("order-1").with_header("tenant", "t1");
//! # Ok(())
//! # }
//! ```

pub mod event_log;
pub mod producer;

pub use event_log::RedpandaEventLog;
pub use producer::{RedpandaProduceOptions, RedpandaProducer, RedpandaProducerBuilder};
