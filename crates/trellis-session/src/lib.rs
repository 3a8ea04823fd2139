// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trellis Session - the CWMP session engine
//!
//! This crate is the per-device state machine an ACS runs against a CPE. It
//! is a declarative-to-imperative compiler driven by a live oracle: user
//! provisions declare desired state ("this path exists, has this value, was
//! refreshed no earlier than T"), and the engine plans the minimum stream of
//! CWMP RPCs that discovers, reads and mutates the device data model until
//! the declarations hold, assimilating every response back into an in-memory
//! versioned model.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       ACS host (HTTP loop)                      │
//! └─────────────────────────────────────────────────────────────────┘
//!        │ inform / rpc_request / rpc_response / rpc_fault
//!        ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │ session: driver + lifecycle                                     │
//! │   ├── provisions: scripts via ScriptRunner, builtins inline     │
//! │   ├── sync: declarations → SyncState (the planner's worklist)   │
//! │   ├── rpc_plan: SyncState → next AcsRequest                     │
//! │   └── device: DeviceData (PathSet + VersionedMaps + trackers)   │
//! └─────────────────────────────────────────────────────────────────┘
//!        │ LocalCache (config, provisions, vparams)   ScriptRunner
//!        ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │ host-provided collaborators (persistence, sandbox)              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! One [`SessionContext`] is single-threaded: each entry point runs to
//! completion before the next is admitted. Different devices are independent.
//! The context serializes to a string between HTTP turns ([`serialize`],
//! [`deserialize`]); nothing in this crate touches disk or network.
//!
//! # Driver loop
//!
//! ```text
//! inform ──► add_provisions ──► rpc_request ──► (AcsRequest, RpcId)
//!                                    ▲              │ host sends to CPE
//!                                    │              ▼
//!                                    └──────── rpc_response / rpc_fault
//! ```
//!
//! The loop ends when [`rpc_request`] yields neither a request nor a fault.
//!
//! # Modules
//!
//! - [`path`]: interned hierarchical names with wildcards and aliases
//! - [`path_set`]: the interning trie with superset/subset matching
//! - [`instance_set`]: alias-key instance bookkeeping
//! - [`versioned_map`]: revision-stacked map with `collapse`
//! - [`device`]: the device data model and its mutation helpers
//! - [`declarations`]: the declaration IR emitted by scripts
//! - [`sync`]: declaration processing into a [`sync::SyncState`]
//! - [`rpc_plan`]: `SyncState` → next RPC
//! - [`provisions`]: built-in provisions and script layer execution
//! - [`session`]: the session context, lifecycle and driver
//! - [`serialize`]: snapshot/restore across HTTP turns
//! - [`config`]: per-device engine configuration
//! - [`cache`], [`sandbox`]: collaborator seams
//!
//! [`rpc_request`]: session::rpc_request
//! [`serialize`]: serialize::serialize
//! [`deserialize`]: serialize::deserialize
//! [`SessionContext`]: session::SessionContext

pub mod cache;
pub mod config;
pub mod declarations;
pub mod device;
pub mod instance_set;
pub mod path;
pub mod path_set;
pub mod provisions;
pub mod rpc_plan;
pub mod sandbox;
pub mod serialize;
pub mod session;
pub mod sync;
pub mod versioned_map;

pub use cache::LocalCache;
pub use config::SessionConfig;
pub use declarations::{AttrTimestamps, AttrValues, Clear, Declaration};
pub use device::{AttributeName, Attributes, DeviceData};
pub use path::{Path, Segment};
pub use sandbox::{ScriptContext, ScriptOutcome, ScriptRunner};
pub use session::{SessionContext, SessionEnv};
