//! Error taxonomy shared across the server.

use std::collections::HashMap;
use thiserror::Error;

/// Mapping of old key paths to new key paths produced by a rename/move.
pub type PathMap = HashMap<String, String>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("storage error: {0}")]
    StorageIo(String),

    #[error("container provisioning failed: {0}")]
    ContainerProvisioning(String),

    #[error("terminal capacity exceeded (max {0} per workspace)")]
    TerminalCapacity(usize),

    /// A multi-step rename/delete aborted partway. The store is left in the
    /// intermediate state described by `completed`; no undo log exists.
    #[error("mutation aborted after {} completed steps: {reason}", completed.len())]
    PartialMutation { completed: PathMap, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;
