//! Unsolicited messages pushed to controllers.

use crate::ids::{ControllerId, TenantId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Something a controller should hear about outside of a command reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum Notice {
    /// A pairing code is ready to be entered on the device.
    PairingCode { tenant: TenantId, code: String },
    PairingCodeFailed { tenant: TenantId },
    Connected { tenant: TenantId },
    Reconnecting {
        tenant: TenantId,
        status: u16,
        attempt: u32,
    },
    /// Reconnects were given up; stored credentials are kept.
    Dormant { tenant: TenantId, attempts: u32 },
    /// The tenant was evicted and must be paired again.
    PairingFailed { tenant: TenantId, reason: String },
    EntitlementDenied { command: String },
    EntitlementGranted { expires_at: DateTime<Utc> },
}

/// Delivers notices to controllers over whatever channel they use.
#[async_trait]
pub trait ControlNotifier: Send + Sync {
    async fn notify(&self, controller: &ControllerId, notice: Notice);
}

/// Formats a raw pairing code for display: `ABCD1234` becomes `ABCD-1234`.
pub fn format_pairing_code(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().filter(|c| !c.is_whitespace()).collect();
    chars
        .chunks(4)
        .map(|chunk| chunk.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_pairing_code() {
        assert_eq!(format_pairing_code("ABCD1234"), "ABCD-1234");
        assert_eq!(format_pairing_code("ABC"), "ABC");
        assert_eq!(format_pairing_code("ABCD 1234 XY"), "ABCD-1234-XY");
        assert_eq!(format_pairing_code(""), "");
    }

    #[test]
    fn test_notice_wire_shape() {
        let notice = Notice::PairingCode {
            tenant: TenantId::from("1111111111"),
            code: "ABCD-1234".to_string(),
        };
        let json = serde_json::to_value(&notice).unwrap();
        assert_eq!(json["notice"], "pairing_code");
        assert_eq!(json["tenant"], "1111111111");
    }
}
