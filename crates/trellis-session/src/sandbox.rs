// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The script-sandbox seam.
//!
//! Provisions and virtual parameters are user scripts executed outside the
//! engine. The engine hands each script a snapshot description
//! ([`ScriptContext`]) and receives a [`ScriptOutcome`]; scripts never touch
//! engine state directly. Scripts within one layer are dispatched
//! concurrently and joined - implementations must tolerate that.

use async_trait::async_trait;
use serde_json::Value as Json;
use trellis_protocol::SessionFault;

use crate::declarations::{AttrTimestamps, AttrValues, Clear, Declaration};

/// What a script gets to see.
#[derive(Debug, Clone)]
pub struct ScriptContext {
    /// The device the session belongs to.
    pub device_id: String,
    /// Session start, epoch ms. Scripts use this as "now".
    pub timestamp: i64,
    /// Revision the script's reads are pinned to.
    pub start_revision: u32,
    /// Revision at which this run's writes will land.
    pub end_revision: u32,
}

/// What a script produced.
#[derive(Debug, Clone, Default)]
pub struct ScriptOutcome {
    /// A fault the script raised; everything else is ignored when set.
    pub fault: Option<SessionFault>,
    /// State invalidations to apply before re-planning.
    pub clear: Vec<Clear>,
    /// Emitted declarations.
    pub declare: Vec<Declaration>,
    /// True when the script saw enough fresh state to finish. A layer whose
    /// scripts are all done stops re-running.
    pub done: bool,
    /// Virtual parameters only: the `{writable?, value?}` return object.
    pub return_value: Option<Json>,
}

/// The sandbox boundary.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    /// Run a user provision script.
    async fn run_provision(
        &self,
        ctx: &ScriptContext,
        name: &str,
        args: &[Json],
    ) -> anyhow::Result<ScriptOutcome>;

    /// Run a virtual-parameter script. `attr_get` carries the freshness the
    /// caller needs; `attr_set` the values the caller wants applied.
    async fn run_virtual_parameter(
        &self,
        ctx: &ScriptContext,
        name: &str,
        attr_get: &AttrTimestamps,
        attr_set: &AttrValues,
    ) -> anyhow::Result<ScriptOutcome>;
}
