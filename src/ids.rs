//! Identity newtypes for tenants and controllers.

use crate::errors::InputError;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Shortest accepted tenant identity, in digits.
pub const MIN_TENANT_DIGITS: usize = 10;

/// Longest accepted tenant identity, in digits.
pub const MAX_TENANT_DIGITS: usize = 15;

/// One external network account (and its credential directory).
///
/// `From<&str>` trusts its input and is meant for values read back from
/// durable tables; controller input goes through [`TenantId::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Normalizes raw controller input to digits only and checks its length.
    pub fn parse(raw: &str) -> Result<Self, InputError> {
        let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            return Err(InputError::new("tenant", "no digits in identity"));
        }
        if digits.len() < MIN_TENANT_DIGITS || digits.len() > MAX_TENANT_DIGITS {
            return Err(InputError::new(
                "tenant",
                format!(
                    "expected {}-{} digits, got {}",
                    MIN_TENANT_DIGITS,
                    MAX_TENANT_DIGITS,
                    digits.len()
                ),
            ));
        }
        Ok(Self(digits))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TenantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl Display for TenantId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The control-channel user issuing commands.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControllerId(String);

impl ControllerId {
    /// Accepts a non-empty, digits-only identifier (surrounding whitespace is trimmed).
    pub fn parse(raw: &str) -> Result<Self, InputError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(InputError::new("controller", "identifier is empty"));
        }
        if !trimmed.chars().all(|c| c.is_ascii_digit()) {
            return Err(InputError::new("controller", "identifier must be numeric"));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ControllerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl Display for ControllerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
