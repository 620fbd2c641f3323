//! # partition-consumer
//!
//! The core of a client-side consumer for a single partition of a topic in a
//! publish/subscribe message broker: a credit-based flow controller, a batched-message
//! decoder, acknowledgment batching, timeout-driven redelivery, and automatic
//! reconnection, all coordinated inside a single-threaded actor.
//!
//! The binary wire codec, transport I/O, and broker lookup are external collaborators;
//! this crate consumes them through the [`connection_handler::Connector`] and
//! [`connection::BrokerConnection`] traits.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use partition_consumer::config::ConsumerConfiguration;
//! use partition_consumer::consumer::Consumer;
//! # use partition_consumer::connection_handler::Connector;
//! # use partition_consumer::connection::{BrokerConnection, BrokerError};
//! # async fn example(connector: Arc<dyn Connector>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConsumerConfiguration::builder("persistent://public/default/my-topic", "my-subscription")
//!     .receiver_queue_size(1000)
//!     .build()?;
//!
//! let consumer = Consumer::connect(0, config, connector).await?;
//! let message = consumer.receive().await?;
//! consumer.acknowledge(message.message_id).await?;
//! consumer.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod ack_tracker;
mod actor;
pub mod backoff;
pub mod batch;
pub mod compression;
pub mod config;
pub mod connection;
pub mod connection_handler;
pub mod consumer;
pub mod error;
pub mod message;
pub mod unacked_tracker;
pub mod util;
