// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fault types.
//!
//! Two layers of faults exist. [`CpeFault`] is what the CPE reports inside a
//! SOAP Fault envelope. [`SessionFault`] is the engine's own taxonomy: the
//! `code` strings are stable and the host classifies on them verbatim, so
//! they must never be reworded.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Per-parameter fault inside a failed `SetParameterValues`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpvFault {
    /// The parameter that was rejected.
    pub parameter_name: String,
    /// TR-069 fault code for this parameter.
    pub fault_code: String,
    /// Human-readable reason.
    pub fault_string: String,
}

/// The CWMP fault detail carried inside a SOAP fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultDetail {
    /// TR-069 fault code, e.g. `"9005"`.
    pub fault_code: String,
    /// Human-readable reason.
    pub fault_string: String,
    /// Per-parameter breakdown for `SetParameterValues` failures.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub set_parameter_values_fault: Vec<SpvFault>,
}

/// A fault the CPE returned for an ACS-initiated RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpeFault {
    /// SOAP-level fault code (typically `"Client"` or `"Server"`).
    pub fault_code: String,
    /// SOAP-level fault string (typically `"CWMP fault"`).
    pub fault_string: String,
    /// The CWMP detail. Absent only on malformed faults.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<FaultDetail>,
}

impl CpeFault {
    /// The TR-069 fault code, falling back to the SOAP-level code when the
    /// detail is missing.
    pub fn cwmp_code(&self) -> &str {
        match &self.detail {
            Some(d) => &d.fault_code,
            None => &self.fault_code,
        }
    }
}

/// A fault surfaced by the session engine to its host.
///
/// The `code` field is the classification key:
///
/// | code | meaning |
/// |------|---------|
/// | `cwmp.<nnnn>` | CPE-reported TR-069 fault (`9005` is recovered internally) |
/// | `script.<ErrorName>` | a provision or virtual-parameter script threw |
/// | `script` | invalid virtual-parameter return shape |
/// | `timeout` | an operation exceeded its deadline |
/// | `invalid_response` | RPC id or method mismatch |
/// | `too_many_rpcs` | session RPC quota exhausted |
/// | `deeply_nested_vparams` | virtual-parameter inception too deep |
/// | `too_many_cycles` | provision cycles exhausted |
/// | `too_many_commits` | commit iterations exhausted |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionFault {
    /// Stable classification code. See the table above.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Epoch ms at which the fault was raised.
    pub timestamp: i64,
    /// CWMP fault detail, for `cwmp.*` faults.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<FaultDetail>,
    /// Channels whose provisions contributed to the failure. The host records
    /// the fault against each of these.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<String>,
}

impl SessionFault {
    /// A fault with just a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>, timestamp: i64) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            timestamp,
            detail: None,
            channels: Vec::new(),
        }
    }

    /// Wrap a CPE fault as `cwmp.<code>`.
    pub fn from_cpe(fault: &CpeFault, timestamp: i64) -> Self {
        let detail = fault.detail.clone();
        let message = detail
            .as_ref()
            .map(|d| d.fault_string.clone())
            .unwrap_or_else(|| fault.fault_string.clone());
        Self {
            code: format!("cwmp.{}", fault.cwmp_code()),
            message,
            timestamp,
            detail,
            channels: Vec::new(),
        }
    }

    /// A script-thrown fault, `script.<ErrorName>`.
    pub fn script_error(
        error_name: &str,
        message: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self::new(format!("script.{}", error_name), message, timestamp)
    }

    /// An invalid virtual-parameter return shape.
    pub fn invalid_script_return(message: impl Into<String>, timestamp: i64) -> Self {
        Self::new("script", message, timestamp)
    }

    /// Attach the contributing channels.
    pub fn with_channels(mut self, channels: Vec<String>) -> Self {
        self.channels = channels;
        self
    }
}

impl fmt::Display for SessionFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for SessionFault {}

#[cfg(test)]
mod tests {
    use super::*;

    fn fault_9005() -> CpeFault {
        CpeFault {
            fault_code: "Client".to_string(),
            fault_string: "CWMP fault".to_string(),
            detail: Some(FaultDetail {
                fault_code: "9005".to_string(),
                fault_string: "Invalid parameter name".to_string(),
                set_parameter_values_fault: Vec::new(),
            }),
        }
    }

    #[test]
    fn test_cwmp_code_prefers_detail() {
        assert_eq!(fault_9005().cwmp_code(), "9005");

        let bare = CpeFault {
            fault_code: "Server".to_string(),
            fault_string: "oops".to_string(),
            detail: None,
        };
        assert_eq!(bare.cwmp_code(), "Server");
    }

    #[test]
    fn test_session_fault_from_cpe() {
        let f = SessionFault::from_cpe(&fault_9005(), 1_700_000_000_000);
        assert_eq!(f.code, "cwmp.9005");
        assert_eq!(f.message, "Invalid parameter name");
        assert!(f.detail.is_some());
    }

    #[test]
    fn test_script_fault_codes() {
        let f = SessionFault::script_error("TypeError", "x is undefined", 0);
        assert_eq!(f.code, "script.TypeError");

        let f = SessionFault::invalid_script_return("bad shape", 0);
        assert_eq!(f.code, "script");
    }

    #[test]
    fn test_fault_serde_round_trip() {
        let f = SessionFault::from_cpe(&fault_9005(), 5).with_channels(vec!["default".into()]);
        let s = serde_json::to_string(&f).unwrap();
        let back: SessionFault = serde_json::from_str(&s).unwrap();
        assert_eq!(back, f);
    }
}
