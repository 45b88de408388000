//! Error types shared across the session manager.

use std::fmt::{Display, Formatter};

/// Controller input that failed validation.
///
/// Raised before any registry is touched, so a rejected command never leaves a
/// partial mutation behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputError {
    pub field: &'static str,
    pub message: String,
}

impl InputError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl Display for InputError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid {}: {}", self.field, self.message)
    }
}

impl std::error::Error for InputError {}

/// Failures reported by a network binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// The transport could not be established.
    Connect { message: String },
    /// The transport is no longer open.
    TransportClosed,
    /// A request did not get an answer in time.
    Timeout { operation: &'static str },
    /// The remote side refused the request.
    Rejected { message: String },
    /// The remote side sent something we could not understand.
    Protocol { message: String },
}

impl Display for NetworkError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect { message } => write!(f, "connect failed: {}", message),
            Self::TransportClosed => write!(f, "transport closed"),
            Self::Timeout { operation } => write!(f, "{} timed out", operation),
            Self::Rejected { message } => write!(f, "rejected: {}", message),
            Self::Protocol { message } => write!(f, "protocol error: {}", message),
        }
    }
}

impl std::error::Error for NetworkError {}

/// Why a control command was not carried out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// The command's arguments failed validation.
    InvalidInput(InputError),
    /// The controller lacks the entitlement or ownership the command needs.
    Denied,
    /// The controller is not paired with the tenant it named.
    NotPaired,
    /// The controller's tenant has no live connection.
    NotConnected,
    /// The tenant's connection failed the operation.
    Operation(NetworkError),
}

impl Display for ControlError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidInput(e) => write!(f, "{}", e),
            Self::Denied => write!(f, "not authorized"),
            Self::NotPaired => write!(f, "not paired with that tenant"),
            Self::NotConnected => write!(f, "tenant is not connected"),
            Self::Operation(e) => write!(f, "operation failed: {}", e),
        }
    }
}

impl std::error::Error for ControlError {}

impl From<InputError> for ControlError {
    fn from(e: InputError) -> Self {
        Self::InvalidInput(e)
    }
}

impl From<NetworkError> for ControlError {
    fn from(e: NetworkError) -> Self {
        Self::Operation(e)
    }
}
