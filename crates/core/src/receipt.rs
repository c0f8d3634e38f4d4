//! Apply receipts.
//!
//! The receipt is the consensus-level response to a submitted transaction.
//! Rejections travel inside the receipt rather than as apply errors so that
//! an invalid (but committed) transaction is a deterministic no-op on every
//! replica instead of a consensus fault.

use crate::CoreError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReceiptStatus {
    Applied,
    AlreadyApplied,
    Rejected,
}

/// Wire form of a state machine rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    pub tx_id: String,
    pub status: ReceiptStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ReceiptError>,
}

impl TxReceipt {
    pub fn applied(tx_id: impl Into<String>) -> Self {
        Self {
            tx_id: tx_id.into(),
            status: ReceiptStatus::Applied,
            error: None,
        }
    }

    pub fn already_applied(tx_id: impl Into<String>) -> Self {
        Self {
            tx_id: tx_id.into(),
            status: ReceiptStatus::AlreadyApplied,
            error: None,
        }
    }

    pub fn rejected(tx_id: impl Into<String>, err: &CoreError) -> Self {
        Self {
            tx_id: tx_id.into(),
            status: ReceiptStatus::Rejected,
            error: Some(ReceiptError {
                code: err.code().to_string(),
                message: err.to_string(),
            }),
        }
    }

    /// The rejection carried by this receipt, if any, as a typed error.
    pub fn rejection(&self) -> Option<CoreError> {
        let err = self.error.as_ref()?;
        let message = err.message.clone();
        Some(match err.code.as_str() {
            "INVALID_PARAM" => CoreError::InvalidParam(message),
            "BAD_SIGNATURE" => CoreError::BadSignature(message),
            "PRECONDITION_FAILED" => CoreError::PreconditionFailed(message),
            "NOT_FOUND" => CoreError::NotFound(message),
            "CONFLICT" => CoreError::Conflict(message),
            "DEADLINE_EXCEEDED" => CoreError::DeadlineExceeded(message),
            _ => CoreError::Internal(message),
        })
    }
}
