//! Error types for kyrograph.
//!
//! All failures are strongly typed using thiserror. Every [`GraphError`]
//! flattens into exactly one [`ResultCode`], so callers that only care about
//! the outcome class can branch on [`GraphError::code`] without matching the
//! variant payloads.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::addr::Addr;
use crate::context::ContextId;

/// Flat outcome taxonomy shared by every public operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    /// Success.
    Ok,
    /// Generic failure.
    Error,
    /// The operation completed without producing a result.
    NoResult,
    /// Invalid parameters.
    InvalidParams,
    /// Element type does not fit the operation.
    InvalidType,
    /// Object is in a state that forbids the operation.
    InvalidState,
    /// Element or object does not exist.
    NotFound,
    /// Segment ceiling reached.
    FullMemory,
    /// I/O failure.
    FileMemoryIo,
    /// Address is outside the store bounds.
    AddrIsNotValid,
    /// Element is not a node.
    ElementIsNotNode,
    /// Element is not a link.
    ElementIsNotLink,
    /// Element is not a connector.
    ElementIsNotConnector,
    /// Content stream failure.
    StreamIo,
    /// Malformed system identifier.
    InvalidSystemIdentifier,
    /// System identifier already in use.
    DuplicatedSystemIdentifier,
    /// Context has not been authenticated.
    ContextIsNotAuthenticated,
    /// Actor lacks permission to read data.
    NoReadPermission,
    /// Actor lacks permission to write data.
    NoWritePermission,
    /// Actor lacks permission to erase data.
    NoErasePermission,
    /// Actor lacks permission to read permission data.
    NoPermissionToReadPermissions,
    /// Actor lacks permission to write permission data.
    NoPermissionToWritePermissions,
    /// Actor lacks permission to erase permission data.
    NoPermissionToErasePermissions,
    /// Unclassified failure.
    Unknown,
}

impl ResultCode {
    /// Returns true for [`ResultCode::Ok`].
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Returns true for the six permission-denial codes and the authentication code.
    #[must_use]
    pub const fn is_permission_denied(self) -> bool {
        matches!(
            self,
            Self::ContextIsNotAuthenticated
                | Self::NoReadPermission
                | Self::NoWritePermission
                | Self::NoErasePermission
                | Self::NoPermissionToReadPermissions
                | Self::NoPermissionToWritePermissions
                | Self::NoPermissionToErasePermissions
        )
    }
}

/// Errors produced by the store, the event layer and the context manager.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Operation failed: {reason}")]
    Failed {
        reason: String,
    },

    #[error("Operation produced no result")]
    NoResult,

    #[error("Invalid parameters: {reason}")]
    InvalidParams {
        reason: String,
    },

    #[error("Invalid element type {actual:#06x}: {reason}")]
    InvalidType {
        actual: u16,
        reason: String,
    },

    #[error("Invalid state: {reason}")]
    InvalidState {
        reason: String,
    },

    #[error("Element not found: {addr}")]
    NotFound {
        addr: Addr,
    },

    #[error("Segment limit reached ({max_segments} segments)")]
    FullMemory {
        max_segments: u16,
    },

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("Address {addr} is not valid")]
    AddrIsNotValid {
        addr: Addr,
    },

    #[error("Element {addr} is not a node")]
    ElementIsNotNode {
        addr: Addr,
    },

    #[error("Element {addr} is not a link")]
    ElementIsNotLink {
        addr: Addr,
    },

    #[error("Element {addr} is not a connector")]
    ElementIsNotConnector {
        addr: Addr,
    },

    #[error("Content stream failure: {reason}")]
    StreamIo {
        reason: String,
    },

    #[error("Invalid system identifier '{idtf}'")]
    InvalidSystemIdentifier {
        idtf: String,
    },

    #[error("System identifier '{idtf}' is already in use")]
    DuplicatedSystemIdentifier {
        idtf: String,
    },

    #[error("Context {context} is not authenticated")]
    ContextIsNotAuthenticated {
        context: ContextId,
    },

    #[error("Context {context} has no permission to read {addr}")]
    NoReadPermission {
        context: ContextId,
        addr: Addr,
    },

    #[error("Context {context} has no permission to write {addr}")]
    NoWritePermission {
        context: ContextId,
        addr: Addr,
    },

    #[error("Context {context} has no permission to erase {addr}")]
    NoErasePermission {
        context: ContextId,
        addr: Addr,
    },

    #[error("Context {context} has no permission to read permissions of {addr}")]
    NoPermissionToReadPermissions {
        context: ContextId,
        addr: Addr,
    },

    #[error("Context {context} has no permission to write permissions of {addr}")]
    NoPermissionToWritePermissions {
        context: ContextId,
        addr: Addr,
    },

    #[error("Context {context} has no permission to erase permissions of {addr}")]
    NoPermissionToErasePermissions {
        context: ContextId,
        addr: Addr,
    },

    #[error("Unknown failure")]
    Unknown,
}

impl GraphError {
    /// Creates a generic failure.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    /// Creates an invalid-parameters error.
    pub fn invalid_params(reason: impl Into<String>) -> Self {
        Self::InvalidParams {
            reason: reason.into(),
        }
    }

    /// Creates an invalid-state error.
    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }

    /// Creates an invalid-type error.
    pub fn invalid_type(actual: u16, reason: impl Into<String>) -> Self {
        Self::InvalidType {
            actual,
            reason: reason.into(),
        }
    }

    /// Error reported when a shared registry lock was poisoned by a panicking holder.
    pub fn poisoned(context: &'static str) -> Self {
        Self::invalid_state(format!("poisoned lock: {context}"))
    }

    /// Flattens the error into its result code.
    #[must_use]
    pub const fn code(&self) -> ResultCode {
        match self {
            Self::Failed { .. } => ResultCode::Error,
            Self::NoResult => ResultCode::NoResult,
            Self::InvalidParams { .. } => ResultCode::InvalidParams,
            Self::InvalidType { .. } => ResultCode::InvalidType,
            Self::InvalidState { .. } => ResultCode::InvalidState,
            Self::NotFound { .. } => ResultCode::NotFound,
            Self::FullMemory { .. } => ResultCode::FullMemory,
            Self::Io(_) => ResultCode::FileMemoryIo,
            Self::AddrIsNotValid { .. } => ResultCode::AddrIsNotValid,
            Self::ElementIsNotNode { .. } => ResultCode::ElementIsNotNode,
            Self::ElementIsNotLink { .. } => ResultCode::ElementIsNotLink,
            Self::ElementIsNotConnector { .. } => ResultCode::ElementIsNotConnector,
            Self::StreamIo { .. } => ResultCode::StreamIo,
            Self::InvalidSystemIdentifier { .. } => ResultCode::InvalidSystemIdentifier,
            Self::DuplicatedSystemIdentifier { .. } => ResultCode::DuplicatedSystemIdentifier,
            Self::ContextIsNotAuthenticated { .. } => ResultCode::ContextIsNotAuthenticated,
            Self::NoReadPermission { .. } => ResultCode::NoReadPermission,
            Self::NoWritePermission { .. } => ResultCode::NoWritePermission,
            Self::NoErasePermission { .. } => ResultCode::NoErasePermission,
            Self::NoPermissionToReadPermissions { .. } => ResultCode::NoPermissionToReadPermissions,
            Self::NoPermissionToWritePermissions { .. } => {
                ResultCode::NoPermissionToWritePermissions
            }
            Self::NoPermissionToErasePermissions { .. } => {
                ResultCode::NoPermissionToErasePermissions
            }
            Self::Unknown => ResultCode::Unknown,
        }
    }

    /// Returns true if the failure is an access denial.
    #[must_use]
    pub const fn is_permission_denied(&self) -> bool {
        self.code().is_permission_denied()
    }

    /// Returns true if the failure must abort the current operation chain.
    ///
    /// Exhausted segments and corrupted registries are not retryable.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::FullMemory { .. } | Self::InvalidState { .. })
    }
}

/// Result type alias for graph operations.
pub type GraphResult<T> = Result<T, GraphError>;
