//! Error type shared by the readout core.
//!
//! Device failures keep the raw [`FELibReturn`] code so an operator can look it
//! up against the vendor documentation.

use crate::FELibReturn;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReadoutError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReadoutError {
    #[error("no configuration found for module '{0}'")]
    ConfigNotFound(String),

    #[error("module {module}: unable to connect to {url}: {code}")]
    Connection {
        module: String,
        url: String,
        code: FELibReturn,
    },

    #[error("module {module}: {operation} failed: {code}")]
    Device {
        module: String,
        operation: String,
        code: FELibReturn,
    },

    #[error("module {module}: query of {path} failed: {reason}")]
    DeviceQuery {
        module: String,
        path: String,
        reason: String,
    },

    #[error("module {module}: invalid value for {parameter}: {reason}")]
    Validation {
        module: String,
        parameter: String,
        reason: String,
    },

    #[error("fragment needs {required} bytes but only {available} are available")]
    BufferTooSmall { required: usize, available: usize },

    #[error("malformed record at byte {offset}: {reason}")]
    MalformedRecord { offset: usize, reason: String },
}

impl ReadoutError {
    pub(crate) fn device(module: &str, operation: &str, code: FELibReturn) -> Self {
        ReadoutError::Device {
            module: module.to_string(),
            operation: operation.to_string(),
            code,
        }
    }

    pub(crate) fn validation(module: &str, parameter: &str, reason: impl Into<String>) -> Self {
        ReadoutError::Validation {
            module: module.to_string(),
            parameter: parameter.to_string(),
            reason: reason.into(),
        }
    }
}
