// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Session snapshot/restore.
//!
//! A CWMP session spans several HTTP exchanges; between them the host
//! persists the session as an opaque string. [`serialize`] captures every
//! observable piece of engine state - paths, trackers, full versioned
//! histories, provisions, channels, revisions, operations, the in-flight
//! request - deterministically (sorted maps, fixed field order).
//! Ephemerals (the sync worklist, the resolved config) are dropped; both are
//! regenerated on the next driver call.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use trellis_protocol::AcsRequest;

use crate::declarations::Declaration;
use crate::device::Attributes;
use crate::path::Path;
use crate::session::{
    init_at, LayerResult, Operation, Provision, SessionContext, VirtualParameterCall,
};
use crate::versioned_map::Revisions;

/// One path's persisted state: trackers plus both versioned histories.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceNode {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    trackers: BTreeMap<String, u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    timestamps: Revisions<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    attributes: Revisions<Attributes>,
}

/// The persisted shape. Field order is the wire order.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    device_id: String,
    cwmp_version: String,
    timeout: u32,
    timestamp: i64,
    is_new: bool,
    state: u8,
    auth_state: u8,
    iteration: u32,
    cycle: u8,
    rpc_count: u8,
    revision: u32,
    revisions: Vec<u32>,
    provisions: Vec<Provision>,
    channels: BTreeMap<String, u64>,
    declarations: Vec<Vec<Declaration>>,
    virtual_parameters: Vec<Vec<VirtualParameterCall>>,
    provisions_ret: Vec<LayerResult>,
    device_data: BTreeMap<String, DeviceNode>,
    operations: BTreeMap<String, Operation>,
    operations_touched: BTreeSet<String>,
    retries: BTreeMap<String, u32>,
    #[serde(default)]
    cache_snapshot: String,
    extensions_cache: BTreeMap<String, Json>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rpc_request: Option<AcsRequest>,
}

/// Errors restoring a snapshot.
#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    /// The snapshot was not valid JSON of the expected shape.
    #[error("malformed session snapshot: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Serialize a session to its persisted string form.
pub fn serialize(ctx: &SessionContext) -> String {
    let mut device_data: BTreeMap<String, DeviceNode> = BTreeMap::new();
    let dd = &ctx.device_data;

    let mut all_paths: BTreeSet<String> = BTreeSet::new();
    all_paths.extend(dd.timestamps.keys().map(|p| p.to_string()));
    all_paths.extend(dd.attributes.keys().map(|p| p.to_string()));
    all_paths.extend(dd.trackers.keys().map(|p| p.to_string()));

    for path_str in all_paths {
        let path = Path::parse(&path_str).expect("stored paths re-parse");
        let interned = dd.paths.get(&path).expect("stored paths are interned");
        device_data.insert(
            path_str,
            DeviceNode {
                trackers: dd.trackers.get(&interned).cloned().unwrap_or_default(),
                timestamps: dd
                    .timestamps
                    .get_revisions(&interned)
                    .cloned()
                    .unwrap_or_default(),
                attributes: dd
                    .attributes
                    .get_revisions(&interned)
                    .cloned()
                    .unwrap_or_default(),
            },
        );
    }

    let snapshot = Snapshot {
        device_id: ctx.device_id.clone(),
        cwmp_version: ctx.cwmp_version.clone(),
        timeout: ctx.timeout,
        timestamp: ctx.timestamp,
        is_new: ctx.is_new,
        state: ctx.state,
        auth_state: ctx.auth_state,
        iteration: ctx.iteration,
        cycle: ctx.cycle,
        rpc_count: ctx.rpc_count,
        revision: ctx.device_data.timestamps.revision(),
        revisions: ctx.revisions.clone(),
        provisions: ctx.provisions.clone(),
        channels: ctx.channels.clone(),
        declarations: ctx.declarations.clone(),
        virtual_parameters: ctx.virtual_parameters.clone(),
        provisions_ret: ctx.provisions_ret.clone(),
        device_data,
        operations: ctx.operations.clone(),
        operations_touched: ctx.operations_touched.clone(),
        retries: ctx.retries.clone(),
        cache_snapshot: ctx.cache_snapshot.clone(),
        extensions_cache: ctx.extensions_cache.clone(),
        rpc_request: ctx.rpc_request.clone(),
    };

    serde_json::to_string(&snapshot).expect("snapshot serializes")
}

/// Restore a session from its persisted string form. The sync worklist and
/// configuration are left empty; the next driver call regenerates both
/// (blocking on cache bootstrap if the host needs to).
pub fn deserialize(data: &str) -> Result<SessionContext, RestoreError> {
    let snapshot: Snapshot = serde_json::from_str(data)?;

    let mut ctx = init_at(
        &snapshot.device_id,
        &snapshot.cwmp_version,
        snapshot.timeout,
        snapshot.timestamp,
    );
    ctx.is_new = snapshot.is_new;
    ctx.state = snapshot.state;
    ctx.auth_state = snapshot.auth_state;
    ctx.iteration = snapshot.iteration;
    ctx.cycle = snapshot.cycle;
    ctx.rpc_count = snapshot.rpc_count;
    ctx.revisions = snapshot.revisions;
    ctx.provisions = snapshot.provisions;
    ctx.channels = snapshot.channels;
    ctx.declarations = snapshot.declarations;
    ctx.virtual_parameters = snapshot.virtual_parameters;
    ctx.provisions_ret = snapshot.provisions_ret;
    ctx.operations = snapshot.operations;
    ctx.operations_touched = snapshot.operations_touched;
    ctx.retries = snapshot.retries;
    ctx.cache_snapshot = snapshot.cache_snapshot;
    ctx.extensions_cache = snapshot.extensions_cache;
    ctx.rpc_request = snapshot.rpc_request;

    for (path_str, node) in snapshot.device_data {
        let path = match Path::parse(&path_str) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(path = %path_str, error = %e, "dropping unparsable snapshot path");
                continue;
            }
        };
        let interned = ctx.device_data.paths.add(path);
        if !node.timestamps.is_empty() {
            ctx.device_data
                .timestamps
                .set_revisions(interned.clone(), node.timestamps);
        }
        if !node.attributes.is_empty() {
            ctx.device_data
                .attributes
                .set_revisions(interned.clone(), node.attributes);
        }
        if !node.trackers.is_empty() {
            ctx.device_data.trackers.insert(interned, node.trackers);
        }
    }
    ctx.device_data.set_revision(snapshot.revision);

    Ok(ctx)
}
