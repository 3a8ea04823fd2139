// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! RPC id codec.
//!
//! Every ACS-initiated RPC carries an id the CPE must echo back. The id is a
//! hex triple: the session timestamp, the cycle, and the per-session RPC
//! counter, the last two zero-padded to two digits:
//!
//! ```text
//! <timestamp hex> <cycle %02x> <rpcCount %02x>
//! ```
//!
//! A response bearing an id the engine did not issue is answered with an
//! `invalid_response` fault.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// A decoded RPC id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RpcId {
    /// Session start, epoch ms.
    pub timestamp: i64,
    /// Provision cycle the RPC belongs to.
    pub cycle: u8,
    /// Per-session RPC counter.
    pub rpc_count: u8,
}

/// Errors decoding an RPC id string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcIdError {
    /// The id is shorter than the two fixed-width suffix fields.
    #[error("rpc id too short: {0:?}")]
    TooShort(String),

    /// A field is not valid hex.
    #[error("rpc id is not hex: {0:?}")]
    NotHex(String),
}

impl RpcId {
    /// Build the id for the next RPC of a session.
    pub fn new(timestamp: i64, cycle: u8, rpc_count: u8) -> Self {
        Self {
            timestamp,
            cycle,
            rpc_count,
        }
    }
}

impl fmt::Display for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:x}{:02x}{:02x}",
            self.timestamp, self.cycle, self.rpc_count
        )
    }
}

impl FromStr for RpcId {
    type Err = RpcIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() < 5 {
            return Err(RpcIdError::TooShort(s.to_string()));
        }
        let (head, tail) = s.split_at(s.len() - 4);
        let (cycle_s, count_s) = tail.split_at(2);

        let timestamp =
            i64::from_str_radix(head, 16).map_err(|_| RpcIdError::NotHex(s.to_string()))?;
        let cycle =
            u8::from_str_radix(cycle_s, 16).map_err(|_| RpcIdError::NotHex(s.to_string()))?;
        let rpc_count =
            u8::from_str_radix(count_s, 16).map_err(|_| RpcIdError::NotHex(s.to_string()))?;

        Ok(Self {
            timestamp,
            cycle,
            rpc_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_pads_cycle_and_count() {
        let id = RpcId::new(0x18c2a9f0000, 0, 1);
        assert_eq!(id.to_string(), "18c2a9f00000001");
    }

    #[test]
    fn test_round_trip() {
        let id = RpcId::new(1_700_000_123_456, 3, 0x2a);
        let parsed: RpcId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_reject_short_and_nonhex() {
        assert!(matches!("abc".parse::<RpcId>(), Err(RpcIdError::TooShort(_))));
        assert!(matches!(
            "zzzzzz0001".parse::<RpcId>(),
            Err(RpcIdError::NotHex(_))
        ));
    }

    #[test]
    fn test_count_rolls_into_id() {
        let a = RpcId::new(1000, 0, 0).to_string();
        let b = RpcId::new(1000, 0, 1).to_string();
        assert_ne!(a, b);
        assert_eq!(&a[..a.len() - 2], &b[..b.len() - 2]);
    }
}
