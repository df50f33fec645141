//! Error taxonomy for the VPS lifecycle core

use std::time::Duration;

use thiserror::Error;

/// Failure reported by the container runtime client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("runtime exited with code {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },
    #[error("command timed out after {} seconds", after.as_secs())]
    Timeout { after: Duration },
    #[error("failed to launch runtime: {0}")]
    Spawn(String),
}

/// Errors surfaced by the lifecycle manager and the store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VpsError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("insufficient credits: need {needed} but have {available}")]
    InsufficientCredits { needed: u64, available: u64 },
    #[error("unknown plan '{0}' (available: Starter, Basic, Standard, Pro)")]
    UnknownPlan(String),
    #[error("unknown processor '{0}' (choose Intel or AMD)")]
    UnknownProcessor(String),
    #[error("invalid resource request: {0}")]
    InvalidSpec(String),
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("user {grantee} already has access")]
    AlreadyShared { grantee: String },
    #[error("user {grantee} does not have access")]
    NotShared { grantee: String },
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("user {0} is already an admin")]
    AlreadyAdmin(String),
    #[error("user {0} is not an admin")]
    NotAdmin(String),
    #[error("confirmation failed: {0}")]
    Confirmation(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl VpsError {
    /// Short title used when rendering the error to a user
    pub fn title(&self) -> &'static str {
        match self {
            Self::Runtime(RuntimeError::Timeout { .. }) => "Runtime Timeout",
            Self::Runtime(_) => "Runtime Error",
            Self::InsufficientCredits { .. } => "Insufficient Credits",
            Self::UnknownPlan(_) => "Invalid Plan",
            Self::UnknownProcessor(_) => "Invalid Processor",
            Self::InvalidSpec(_) => "Invalid Specs",
            Self::InvalidAmount(_) => "Invalid Amount",
            Self::NotFound(_) => "Not Found",
            Self::AlreadyShared { .. } => "Already Shared",
            Self::NotShared { .. } => "Not Shared",
            Self::AccessDenied(_) => "Access Denied",
            Self::AlreadyAdmin(_) => "Already Admin",
            Self::NotAdmin(_) => "Not Admin",
            Self::Confirmation(_) => "Confirmation Failed",
            Self::Storage(_) => "Storage Error",
        }
    }
}

impl From<std::io::Error> for VpsError {
    fn from(err: std::io::Error) -> Self {
        VpsError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for VpsError {
    fn from(err: serde_json::Error) -> Self {
        VpsError::Storage(format!("JSON serialization error: {err}"))
    }
}

pub type VpsResult<T> = std::result::Result<T, VpsError>;
