//! Client for an NSQ-style distributed message broker.
//!
//! Publish messages with tunable write-consistency via [`Client::publish_to`]
//! and [`Client::publish`]; subscribe to a topic/channel pair across a
//! dynamically discovered set of broker nodes via [`Client::subscribe`] and
//! [`Client::run`]. Broker discovery, deduplication, and requeue policy are
//! external collaborators plugged in through [`LookupService`],
//! [`DedupeService`], and [`RequeueStrategy`].

mod client;
mod connection;
mod error;
mod frame;
mod global;
mod message;
mod pool;
mod publisher;
mod subscriber;
mod traits;

pub use client::{Client, ClientConfig, ClientConfigBuilder, ClientNotifier};
pub use error::{CallbackOutcome, NsqError};
pub use message::Message;
pub use pool::ConnectionManager;
pub use publisher::{ConsistencyLevel, IntoHosts};
pub use traits::{DedupeService, LookupService, Logger, RequeueStrategy};
