// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trellis Protocol - CWMP (TR-069) message vocabulary
//!
//! This crate defines the payload shapes exchanged between the session engine
//! and a CPE. It deliberately stops short of the wire: SOAP/XML encoding,
//! HTTP transport, cookies and authentication all live in other crates. What
//! crosses this boundary is plain typed data.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ACS host (HTTP loop)                    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  XML codec / transport (out of scope)                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  trellis-protocol: AcsRequest / CpeResponse / faults        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  trellis-session: per-device session engine                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Message pairs
//!
//! | Direction | Request | Response |
//! |-----------|---------|----------|
//! | CPE → ACS | [`CpeRequest::Inform`] | [`AcsResponse::InformResponse`] |
//! | CPE → ACS | [`CpeRequest::TransferComplete`] | [`AcsResponse::TransferCompleteResponse`] |
//! | ACS → CPE | [`AcsRequest`] (ten RPCs) | [`CpeResponse`] |
//!
//! # Modules
//!
//! - [`rpc`]: request/response payload types
//! - [`value`]: XSD value types carried by parameters
//! - [`fault`]: CPE fault detail and the session fault taxonomy
//! - [`rpc_id`]: the hex-triple id correlating requests with responses

pub mod fault;
pub mod rpc;
pub mod rpc_id;
pub mod value;

pub use fault::{CpeFault, FaultDetail, SessionFault, SpvFault};
pub use rpc::{
    AcsRequest, AcsResponse, Continuation, CpeRequest, CpeResponse, DeviceIdStruct, GpnEntry,
    SpaEntry, SpvEntry,
};
pub use rpc_id::RpcId;
pub use value::{ParameterValue, XsdType};
