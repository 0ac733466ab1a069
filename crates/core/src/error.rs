//! Errors raised by the core model

use crate::callbacks::HookPoint;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("callback '{name}' already registered for hook '{hook}'")]
    DuplicateName { hook: HookPoint, name: String },

    #[error("session '{session_id}' not found")]
    SessionNotFound { session_id: String },
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
