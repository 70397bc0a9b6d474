use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracy_storage::StorageError;

#[derive(Debug, Error)]
pub enum TracerError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("tracer string already stored: {0}")]
    Conflict(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("store error: {0}")]
    Store(#[from] StorageError),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl TracerError {
    pub fn code(&self) -> &'static str {
        match self {
            TracerError::Validation(_) => "validation_error",
            TracerError::Conflict(_) => "conflict_error",
            TracerError::NotFound { .. } => "not_found_error",
            TracerError::Store(_) => "store_error",
            TracerError::Decode(_) => "decode_error",
            TracerError::Serialization(_) => "serialization_error",
        }
    }
}

/// JSON body sent to clients for any failed operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
}

impl From<&TracerError> for ErrorEnvelope {
    fn from(err: &TracerError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl ErrorEnvelope {
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_else(|_| {
            br#"{"code":"serialization_error","message":"error envelope encoding failed"}"#
                .to_vec()
        })
    }
}
