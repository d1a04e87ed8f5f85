//! # herald-messaging
//!
//! Notification dispatch and monitor accounting core for the herald
//! multi-tenant messaging service.
//!
//! Producers post messages to topics; topics fan messages out to
//! subscriptions that deliver over webhooks or by re-injecting into queues;
//! consumers claim and acknowledge queued messages. Every delivery attempt
//! and consume feeds byte/count statistics into per-queue and per-topic
//! monitor records.
//!
//! ## Quick start
//!
//! ```
//! use herald_messaging::config::Config;
//! use herald_messaging::message::Message;
//! use herald_messaging::service::Service;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Service backed by the in-memory reference driver.
//!     let mut service = Service::in_memory(Config::default());
//!
//!     // Create a topic and a webhook subscription.
//!     service.topics().create("alerts", "acme", Default::default()).await?;
//!     service
//!         .subscriptions()
//!         .create("acme", "alerts", "https://hooks.example.com/alerts", 3600, Default::default())
//!         .await?;
//!
//!     // Publish: the dispatcher fans out to every live subscription.
//!     let receipt = service
//!         .publish("acme", "alerts", vec![Message::new(json!({"severity": "page"}))], None)
//!         .await?;
//!     println!("dispatched to {} subscriptions", receipt.subscriptions);
//!
//!     // Consume from a queue, auto-deleting the claimed messages.
//!     let consumed = service.consume("jobs", "acme", Some(5), true).await?;
//!     println!("claimed {} messages under {}", consumed.messages.len(), consumed.cid);
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```
pub mod config;
pub mod consume;
pub mod message;
pub mod monitor;
pub mod notify;
pub mod service;
pub mod storage;
pub mod subscription;
pub mod topic;

pub(crate) mod validation;
