//! # Message Envelopes
//!
//! The request/response messages exchanged between the broker and its
//! execution contexts. Buffers listed in an envelope's transfer list move
//! with the envelope: [`TransferBuffer`] is deliberately not `Clone`, so once
//! an envelope is handed to a channel the sender has no way back to the bytes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{error_types, status, PROTOCOL_VERSION};

/// Correlation id linking a request to its response, unique per broker
pub type CorrelationId = u64;

/// Owned byte buffer whose ownership moves with the message it travels in
#[derive(Debug, PartialEq, Eq, Default)]
pub struct TransferBuffer(Vec<u8>);

impl TransferBuffer {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Take the bytes back out, ending the buffer's life as a transferable
    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for TransferBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for TransferBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

pub type TransferList = Vec<TransferBuffer>;

/// Request message sent from the broker to an execution context
#[derive(Debug)]
pub struct RequestEnvelope {
    pub protocol_version: &'static str,
    pub correlation_id: CorrelationId,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub transfer: TransferList,
    pub sent_at: DateTime<Utc>,
}

impl RequestEnvelope {
    pub fn new(
        correlation_id: CorrelationId,
        task_type: impl Into<String>,
        payload: serde_json::Value,
        transfer: TransferList,
    ) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            correlation_id,
            task_type: task_type.into(),
            payload,
            transfer,
            sent_at: Utc::now(),
        }
    }
}

/// Error information for a failed task
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub message: String,
    pub error_type: Option<String>,
}

impl ErrorInfo {
    pub fn handler(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: Some(error_types::HANDLER.to_string()),
        }
    }

    pub fn initialization(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: Some(error_types::INITIALIZATION.to_string()),
        }
    }

    pub fn is_initialization(&self) -> bool {
        self.error_type.as_deref() == Some(error_types::INITIALIZATION)
    }
}

/// Response message sent from an execution context back to the broker
///
/// The status travels as a plain string so that a response produced by any
/// [`ExecutionUnit`](crate::execution::context::ExecutionUnit) implementation
/// is validated by [`ResponseEnvelope::decode`] before it reaches a caller.
#[derive(Debug)]
pub struct ResponseEnvelope {
    pub protocol_version: String,
    pub correlation_id: CorrelationId,
    pub status: String,
    pub payload: Option<serde_json::Value>,
    pub error: Option<ErrorInfo>,
    pub transfer: TransferList,
    pub completed_at: DateTime<Utc>,
}

impl ResponseEnvelope {
    pub fn success(
        correlation_id: CorrelationId,
        payload: serde_json::Value,
        transfer: TransferList,
    ) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            correlation_id,
            status: status::SUCCESS.to_string(),
            payload: Some(payload),
            error: None,
            transfer,
            completed_at: Utc::now(),
        }
    }

    pub fn failure(correlation_id: CorrelationId, error: ErrorInfo) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            correlation_id,
            status: status::FAILURE.to_string(),
            payload: None,
            error: Some(error),
            transfer: Vec::new(),
            completed_at: Utc::now(),
        }
    }

    /// Validate the envelope and turn it into a caller-facing outcome
    pub fn decode(self) -> TaskOutcome {
        if self.protocol_version != PROTOCOL_VERSION {
            return TaskOutcome::Malformed {
                reason: format!(
                    "protocol version {} does not match {}",
                    self.protocol_version, PROTOCOL_VERSION
                ),
            };
        }

        match self.status.as_str() {
            status::SUCCESS => match self.payload {
                Some(payload) => TaskOutcome::Success(TaskOutput {
                    payload,
                    transfer: self.transfer,
                }),
                None => TaskOutcome::Malformed {
                    reason: "success response carries no payload".to_string(),
                },
            },
            status::FAILURE => match self.error {
                Some(error) => TaskOutcome::Failure(error),
                None => TaskOutcome::Malformed {
                    reason: "failure response carries no error".to_string(),
                },
            },
            other => TaskOutcome::Malformed {
                reason: format!("unknown response status '{other}'"),
            },
        }
    }
}

/// Result delivered to a caller when a task succeeds
#[derive(Debug, PartialEq)]
pub struct TaskOutput {
    pub payload: serde_json::Value,
    pub transfer: TransferList,
}

/// Decoded form of a [`ResponseEnvelope`]
#[derive(Debug, PartialEq)]
pub enum TaskOutcome {
    Success(TaskOutput),
    Failure(ErrorInfo),
    Malformed { reason: String },
}
