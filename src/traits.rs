use crate::error::NsqError;
use crate::message::Message;

/// Broker discovery: given a topic, returns the set of `host:port`
/// endpoints currently serving it. Called once per `subscribe`.
pub trait LookupService {
    fn lookup_hosts(&self, topic: &str) -> Result<Vec<String>, NsqError>;
}

/// An opaque deduplication backend keyed by (topic, channel, message).
///
/// `contains_and_add` must test membership and add the message as one
/// atomic step from the client's point of view — that's the reason the
/// method is named the way it is rather than split into `contains` plus
/// `add`.
pub trait DedupeService {
    fn contains_and_add(&self, topic: &str, channel: &str, message: &Message) -> bool;
    fn erase(&self, topic: &str, channel: &str, message: &Message);
}

/// Maps a message to either "drop" (`None`) or "requeue with this delay,
/// in milliseconds" (`Some(delay)`). Consulted only when a callback fails
/// without explicitly requesting a requeue itself.
pub trait RequeueStrategy {
    fn should_requeue(&self, message: &Message) -> Option<u64>;
}

/// An optional logging sink. The crate also emits diagnostics through the
/// `log` facade regardless of whether a `Logger` is configured; this trait
/// exists for hosts that want library events funneled into their own
/// in-process sink rather than (or in addition to) `log`.
pub trait Logger {
    fn debug(&self, message: &str);
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
}
