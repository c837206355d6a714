use std::io;

use thiserror::Error;

use crate::frame::Frame;

/// The five test-distinguishable error kinds produced by this crate.
///
/// `Requeue`/`Expired` are not here: they are decision carriers returned
/// from the user callback (see [`crate::CallbackOutcome`]), not failures.
#[derive(Debug, Error)]
pub enum NsqError {
    #[error("socket error on {address}: {reason}")]
    Socket { address: String, reason: String },

    #[error("protocol error: {reason}")]
    Protocol { reason: String, frame: Option<FrameSnapshot> },

    #[error("publish failed: required {required}, achieved {achieved} ({} errors)", errors.len())]
    Publish {
        required: usize,
        achieved: usize,
        errors: Vec<String>,
    },

    #[error("lookup failed for topic {topic}: {reason}")]
    Lookup { topic: String, reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },
}

/// A cheap, owned copy of the frame that triggered a [`NsqError::Protocol`],
/// kept for tests and diagnostics without forcing `Frame` itself to be
/// cloneable everywhere it is used.
#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    pub description: String,
}

impl From<&Frame> for FrameSnapshot {
    fn from(frame: &Frame) -> Self {
        FrameSnapshot {
            description: format!("{:?}", frame),
        }
    }
}

impl NsqError {
    pub fn socket(address: impl Into<String>, reason: impl Into<String>) -> NsqError {
        NsqError::Socket {
            address: address.into(),
            reason: reason.into(),
        }
    }

    pub fn protocol(reason: impl Into<String>) -> NsqError {
        NsqError::Protocol {
            reason: reason.into(),
            frame: None,
        }
    }

    pub fn protocol_frame(reason: impl Into<String>, frame: &Frame) -> NsqError {
        NsqError::Protocol {
            reason: reason.into(),
            frame: Some(FrameSnapshot::from(frame)),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> NsqError {
        NsqError::Configuration {
            reason: reason.into(),
        }
    }

    pub fn lookup(topic: impl Into<String>, reason: impl Into<String>) -> NsqError {
        NsqError::Lookup {
            topic: topic.into(),
            reason: reason.into(),
        }
    }
}

impl From<io::Error> for NsqError {
    fn from(err: io::Error) -> Self {
        NsqError::Socket {
            address: String::new(),
            reason: err.to_string(),
        }
    }
}

/// Outcome of a user callback invocation, threaded through the message
/// pipeline in place of exceptions: normal return, explicit expiry,
/// explicit requeue with a delay, or any other failure.
#[derive(Debug)]
pub enum CallbackOutcome {
    Ack,
    Expired,
    Requeue(u64),
    Fail(NsqError),
}
