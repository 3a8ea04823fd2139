// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The session context, lifecycle and driver.
//!
//! A [`SessionContext`] lives for one CWMP session with one device. The host
//! feeds it the `Inform`, installs provisions, then pumps [`rpc_request`] /
//! [`rpc_response`] until the driver reports [`DriverResult::Done`].
//!
//! The driver is reentrant and idempotent: calling [`rpc_request`] again
//! without an intervening response returns the same request under a fresh
//! id. Internally it is a fixed-point loop over inception layers -
//! provisions at layer 0, cascading virtual parameters above - where each
//! layer is re-run against ever-fresher device data until its scripts are
//! done and its declarations are satisfied.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info, instrument, warn};
use trellis_protocol::{
    AcsRequest, AcsResponse, Continuation, CpeFault, CpeRequest, CpeResponse, ParameterValue,
    RpcId, SessionFault, SpvEntry, XsdType,
};

use crate::cache::LocalCache;
use crate::config::SessionConfig;
use crate::declarations::{AttrTimestamps, AttrValues, Declaration};
use crate::device::{self, AttributeName, Attributes, DeviceData};
use crate::path::{Path, Segment};
use crate::provisions::{self, VpReturn};
use crate::rpc_plan;
use crate::sandbox::{ScriptContext, ScriptRunner};
use crate::sync::{self, SyncState, VIRTUAL_ROOTS};

/// A named provision with its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provision {
    /// Provision name; resolves to a user script or an engine builtin.
    pub name: String,
    /// Script arguments, JSON-typed.
    pub args: Vec<Json>,
}

/// One queued virtual-parameter script invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualParameterCall {
    /// The virtual parameter's name (`VirtualParameters.<name>`).
    pub name: String,
    /// Freshness the caller needs.
    pub attr_get: AttrTimestamps,
    /// Values the caller wants applied.
    pub attr_set: AttrValues,
}

/// A pending long-running CPE operation awaiting `TransferComplete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum Operation {
    /// A dispatched `Download` the CPE acknowledged asynchronously.
    #[serde(rename_all = "camelCase")]
    Download {
        /// When the download was dispatched, epoch ms.
        timestamp: i64,
        /// The `Downloads.{i}` instance it belongs to.
        instance: String,
        /// TR-069 file type.
        file_type: String,
        /// Source URL.
        file_name: String,
        /// Target name on the device.
        target_file_name: String,
    },
}

/// The joined outcome of one completed layer run, kept until the layer goes
/// idle and is popped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerResult {
    /// Every script in the layer was done.
    pub done: bool,
    /// Virtual-parameter returns, aligned with the layer's calls.
    pub returns: Vec<Option<VpReturn>>,
}

/// Host collaborators injected into every driver call.
#[derive(Clone)]
pub struct SessionEnv {
    /// Config / provision / virtual-parameter lookups.
    pub cache: Arc<dyn LocalCache>,
    /// The script sandbox.
    pub scripts: Arc<dyn ScriptRunner>,
}

/// What a [`rpc_request`] call produced.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverResult {
    /// Send this to the CPE, then call [`rpc_response`] or [`rpc_fault`].
    Request {
        /// Id the CPE must echo.
        rpc_id: String,
        /// The RPC payload.
        request: AcsRequest,
    },
    /// A non-recoverable fault; the host closes the session.
    Fault(SessionFault),
    /// Nothing left to do; the session can end.
    Done,
}

/// Per-device session state. Created by [`init`], serialized between HTTP
/// turns, dropped when the CWMP session ends.
pub struct SessionContext {
    /// Device identity string.
    pub device_id: String,
    /// CWMP version the CPE negotiated, e.g. `"1.4"`.
    pub cwmp_version: String,
    /// Session inactivity timeout, ms. Enforced by the host.
    pub timeout: u32,
    /// Session start, epoch ms. All declared timestamps are capped here.
    pub timestamp: i64,
    /// True for a device this ACS has never seen before.
    pub is_new: bool,
    /// Opaque host state (HTTP auth progress).
    pub state: u8,
    /// Opaque host auth state.
    pub auth_state: u8,
    /// Commit iterations consumed. Always even.
    pub iteration: u32,
    /// Provision cycles opened (bumped by add/clear provisions mid-session).
    pub cycle: u8,
    /// RPCs answered so far.
    pub rpc_count: u8,
    /// Per-layer revision counters, aligned with `declarations`.
    pub revisions: Vec<u32>,
    /// Installed provisions, deduplicated.
    pub provisions: Vec<Provision>,
    /// Channel name → bitmap over provision indices.
    pub channels: BTreeMap<String, u64>,
    /// Declaration layers: level 0 from provisions, higher levels from
    /// cascading virtual parameters.
    pub declarations: Vec<Vec<Declaration>>,
    /// Virtual-parameter call layers; `declarations.len()` is always this
    /// length or one more.
    pub virtual_parameters: Vec<Vec<VirtualParameterCall>>,
    /// Completed layer results, indexed by inception.
    pub provisions_ret: Vec<LayerResult>,
    /// The device data model.
    pub device_data: DeviceData,
    /// The planner worklist. Ephemeral; regenerable.
    pub sync_state: Option<SyncState>,
    /// The in-flight ACS request, if any.
    pub rpc_request: Option<AcsRequest>,
    /// Pending operations by command key.
    pub operations: BTreeMap<String, Operation>,
    /// Command keys touched this session.
    pub operations_touched: BTreeSet<String>,
    /// Per-channel retry counters, maintained by the host.
    pub retries: BTreeMap<String, u32>,
    /// Identifies the local-cache snapshot this session planned against.
    /// Opaque to the engine; the host compares it on resume.
    pub cache_snapshot: String,
    /// Sandbox extension results, keyed `"<revision>:<rest>"`.
    pub extensions_cache: BTreeMap<String, Json>,
    /// Resolved configuration; lazily populated from the cache.
    pub config: Option<SessionConfig>,
}

/// Create a fresh session context. The session timestamp is now.
pub fn init(device_id: &str, cwmp_version: &str, timeout: u32) -> SessionContext {
    init_at(device_id, cwmp_version, timeout, Utc::now().timestamp_millis())
}

/// Create a fresh session context with an explicit start time.
pub fn init_at(
    device_id: &str,
    cwmp_version: &str,
    timeout: u32,
    timestamp: i64,
) -> SessionContext {
    SessionContext {
        device_id: device_id.to_string(),
        cwmp_version: cwmp_version.to_string(),
        timeout,
        timestamp,
        is_new: false,
        state: 0,
        auth_state: 0,
        iteration: 0,
        cycle: 0,
        rpc_count: 0,
        revisions: Vec::new(),
        provisions: Vec::new(),
        channels: BTreeMap::new(),
        declarations: Vec::new(),
        virtual_parameters: Vec::new(),
        provisions_ret: Vec::new(),
        device_data: DeviceData::new(),
        sync_state: None,
        rpc_request: None,
        operations: BTreeMap::new(),
        operations_touched: BTreeSet::new(),
        retries: BTreeMap::new(),
        cache_snapshot: String::new(),
        extensions_cache: BTreeMap::new(),
        config: None,
    }
}

/// Resolve the session configuration once per session.
pub async fn ensure_config(ctx: &mut SessionContext, env: &SessionEnv) -> anyhow::Result<()> {
    if ctx.config.is_none() {
        let map = env.cache.get_config(&ctx.device_id).await?;
        ctx.config = Some(SessionConfig::from_map(&map));
    }
    Ok(())
}

fn write_timestamp(ctx: &SessionContext) -> i64 {
    ctx.timestamp + ctx.iteration as i64 + 1
}

fn current_rpc_id(ctx: &SessionContext) -> String {
    RpcId::new(ctx.timestamp, ctx.cycle, ctx.rpc_count).to_string()
}

fn all_channels(ctx: &SessionContext) -> Vec<String> {
    ctx.channels.keys().cloned().collect()
}

fn write_attrs(device_data: &mut DeviceData, path: Path, ts: i64, attrs: Attributes) {
    let mut to_clear = Vec::new();
    device::set(device_data, path, ts, Some(attrs), &mut to_clear);
    for c in to_clear {
        device::clear(device_data, &c.path, c.timestamp, c.attr_timestamps.as_ref());
    }
}

fn invalidate_path(device_data: &mut DeviceData, path: Path, ts: i64) {
    let mut to_clear = Vec::new();
    device::set(device_data, path, ts, None, &mut to_clear);
    for c in to_clear {
        device::clear(device_data, &c.path, c.timestamp, c.attr_timestamps.as_ref());
    }
}

fn leaf_value(ts: i64, value: ParameterValue) -> Attributes {
    Attributes {
        object: Some((ts, false)),
        value: Some((ts, value)),
        ..Default::default()
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Event codes become path segments: spaces turn into underscores, anything
/// a path cannot carry is folded to an underscore too.
fn encode_event(code: &str) -> String {
    code.trim()
        .replace(' ', "_")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Seed the data model from the session-opening `Inform`.
#[instrument(skip(ctx, request), fields(device_id = %ctx.device_id))]
pub fn inform(ctx: &mut SessionContext, request: &CpeRequest) -> AcsResponse {
    let CpeRequest::Inform {
        device_id,
        event,
        parameter_list,
        retry_count,
    } = request
    else {
        warn!("inform called with a non-Inform request");
        return AcsResponse::InformResponse { max_envelopes: 1 };
    };

    let ts = ctx.timestamp;
    let rev = ctx.revisions.last().copied().unwrap_or(0) + 1;
    ctx.device_data.set_revision(rev);

    let dd = &mut ctx.device_data;
    write_attrs(
        dd,
        Path::parse("DeviceID").expect("static path"),
        ts,
        Attributes {
            object: Some((ts, true)),
            writable: Some((ts, false)),
            ..Default::default()
        },
    );
    for (leaf, value) in [
        ("Manufacturer", &device_id.manufacturer),
        ("OUI", &device_id.oui),
        ("ProductClass", &device_id.product_class),
        ("SerialNumber", &device_id.serial_number),
    ] {
        write_attrs(
            dd,
            Path::parse("DeviceID")
                .expect("static path")
                .child(Segment::Name(leaf.to_string())),
            ts,
            leaf_value(ts, ParameterValue::string(value.clone())),
        );
    }
    if ctx.is_new {
        write_attrs(
            dd,
            Path::parse("DeviceID.ID").expect("static path"),
            ts,
            leaf_value(ts, ParameterValue::string(ctx.device_id.clone())),
        );
        write_attrs(
            dd,
            Path::parse("Events.Registered").expect("static path"),
            ts,
            leaf_value(ts, ParameterValue::new(ts, XsdType::DateTime)),
        );
    }

    write_attrs(
        dd,
        Path::parse("Events").expect("static path"),
        ts,
        Attributes {
            object: Some((ts, true)),
            writable: Some((ts, false)),
            ..Default::default()
        },
    );
    write_attrs(
        dd,
        Path::parse("Events.Inform").expect("static path"),
        ts,
        leaf_value(ts, ParameterValue::new(ts, XsdType::DateTime)),
    );
    for code in event {
        let encoded = encode_event(code);
        if encoded.is_empty() {
            continue;
        }
        write_attrs(
            dd,
            Path::parse("Events")
                .expect("static path")
                .child(Segment::Name(encoded)),
            ts,
            leaf_value(ts, ParameterValue::new(ts, XsdType::DateTime)),
        );
    }

    for (name, value) in parameter_list {
        match Path::parse(name) {
            Ok(path) => write_attrs(dd, path, ts, leaf_value(ts, value.clone())),
            Err(e) => warn!(name, error = %e, "ignoring unparsable inform parameter"),
        }
    }

    info!(
        events = event.len(),
        parameters = parameter_list.len(),
        retry_count,
        "inform assimilated"
    );
    AcsResponse::InformResponse { max_envelopes: 1 }
}

/// Handle a `TransferComplete` for a pending download operation.
#[instrument(skip(ctx, request), fields(device_id = %ctx.device_id))]
pub fn transfer_complete(
    ctx: &mut SessionContext,
    request: &CpeRequest,
) -> (AcsResponse, Option<SessionFault>) {
    let CpeRequest::TransferComplete {
        command_key,
        fault_code,
        fault_string,
        start_time,
        complete_time,
    } = request
    else {
        warn!("transfer_complete called with a non-TransferComplete request");
        return (AcsResponse::TransferCompleteResponse, None);
    };

    let Some(Operation::Download {
        timestamp: op_ts,
        instance,
        file_type,
        file_name,
        target_file_name,
    }) = ctx.operations.get(command_key).cloned()
    else {
        debug!(command_key, "transfer complete for unknown operation");
        return (AcsResponse::TransferCompleteResponse, None);
    };

    ctx.operations.remove(command_key);
    ctx.operations_touched.insert(command_key.clone());
    let ts = write_timestamp(ctx);
    let instance_path = match Path::parse(&instance) {
        Ok(p) => p,
        Err(e) => {
            warn!(instance, error = %e, "operation with unparsable instance");
            return (AcsResponse::TransferCompleteResponse, None);
        }
    };

    if *fault_code != 0 {
        revert_download(ctx, &instance_path, ts);
        let fault = SessionFault::new(
            format!("cwmp.{}", fault_code),
            fault_string.clone(),
            ctx.timestamp,
        )
        .with_channels(all_channels(ctx));
        return (AcsResponse::TransferCompleteResponse, Some(fault));
    }

    let dd = &mut ctx.device_data;
    let set_leaf = |dd: &mut DeviceData, name: &str, value: ParameterValue| {
        write_attrs(
            dd,
            instance_path.child(Segment::Name(name.to_string())),
            ts,
            leaf_value(ts, value),
        );
    };
    set_leaf(dd, "LastDownload", ParameterValue::new(op_ts, XsdType::DateTime));
    set_leaf(dd, "LastFileType", ParameterValue::string(file_type));
    set_leaf(dd, "LastFileName", ParameterValue::string(file_name));
    set_leaf(
        dd,
        "LastTargetFileName",
        ParameterValue::string(target_file_name),
    );
    if let Some(t) = start_time {
        set_leaf(dd, "StartTime", ParameterValue::new(*t, XsdType::DateTime));
    }
    if let Some(t) = complete_time {
        set_leaf(dd, "CompleteTime", ParameterValue::new(*t, XsdType::DateTime));
    }

    info!(command_key, "download transfer complete");
    (AcsResponse::TransferCompleteResponse, None)
}

fn revert_download(ctx: &mut SessionContext, instance_path: &Path, ts: i64) {
    let last = instance_path.child(Segment::Name("LastDownload".to_string()));
    let previous = ctx
        .device_data
        .paths
        .get(&last)
        .and_then(|p| ctx.device_data.attributes.get(&p))
        .and_then(|a| a.value.as_ref())
        .and_then(|(_, v)| sync::epoch_ms(v))
        .unwrap_or(0);
    write_attrs(
        &mut ctx.device_data,
        instance_path.child(Segment::Name("Download".to_string())),
        ts,
        leaf_value(ts, ParameterValue::new(previous, XsdType::DateTime)),
    );
}

/// Expire pending download operations. Returns the faults to surface; with
/// `downloadSuccessOnTimeout` a synthetic success is assimilated instead.
pub async fn timeout_operations(
    ctx: &mut SessionContext,
    env: &SessionEnv,
) -> anyhow::Result<Vec<SessionFault>> {
    ensure_config(ctx, env).await?;
    let cfg = ctx.config.clone().unwrap_or_default();
    let mut faults = Vec::new();

    let expired: Vec<(String, Operation)> = ctx
        .operations
        .iter()
        .filter(|(_, op)| {
            let Operation::Download { timestamp, .. } = op;
            timestamp + cfg.download_timeout * 1000 <= ctx.timestamp
        })
        .map(|(k, op)| (k.clone(), op.clone()))
        .collect();

    for (command_key, op) in expired {
        let Operation::Download { instance, .. } = &op;
        if cfg.download_success_on_timeout {
            debug!(command_key, "download timed out; synthesizing success");
            let synthetic = CpeRequest::TransferComplete {
                command_key: command_key.clone(),
                fault_code: 0,
                fault_string: String::new(),
                start_time: None,
                complete_time: None,
            };
            let (_, fault) = transfer_complete(ctx, &synthetic);
            faults.extend(fault);
        } else {
            ctx.operations.remove(&command_key);
            ctx.operations_touched.insert(command_key.clone());
            let ts = write_timestamp(ctx);
            if let Ok(instance_path) = Path::parse(instance) {
                revert_download(ctx, &instance_path, ts);
            }
            warn!(command_key, "download operation timed out");
            faults.push(
                SessionFault::new(
                    "timeout",
                    format!("download {} timed out", command_key),
                    ctx.timestamp,
                )
                .with_channels(all_channels(ctx)),
            );
        }
    }
    Ok(faults)
}

/// Install provisions on a channel. Duplicate provisions (same name and
/// arguments) are shared: the channel joins the existing entry's bitmap.
pub fn add_provisions(ctx: &mut SessionContext, channel: &str, new_provisions: Vec<Provision>) {
    for prov in new_provisions {
        let index = match ctx.provisions.iter().position(|p| *p == prov) {
            Some(i) => i,
            None => {
                ctx.provisions.push(prov);
                ctx.provisions.len() - 1
            }
        };
        if index >= 64 {
            warn!(index, "provision bitmap saturated; channel attribution lost");
            continue;
        }
        *ctx.channels.entry(channel.to_string()).or_insert(0) |= 1 << index;
    }
    reset_cycle(ctx);
}

/// Drop every provision, virtual parameter, declaration and extension cache
/// entry.
pub fn clear_provisions(ctx: &mut SessionContext) {
    ctx.provisions.clear();
    ctx.channels.clear();
    ctx.extensions_cache.clear();
    reset_cycle(ctx);
    ctx.declarations.clear();
    ctx.virtual_parameters.clear();
    ctx.provisions_ret.clear();
    ctx.revisions.clear();
    ctx.sync_state = None;
}

/// Mid-session provision changes restart planning: discard the worklist,
/// squash any revision history back to zero and open a new cycle.
fn reset_cycle(ctx: &mut SessionContext) {
    ctx.sync_state = None;
    ctx.rpc_request = None;

    let progressed = ctx.revisions.iter().any(|r| *r > 0) || !ctx.declarations.is_empty();
    if !progressed {
        return;
    }

    ctx.device_data.timestamps.collapse(0);
    ctx.device_data.attributes.collapse(0);
    ctx.declarations.clear();
    ctx.virtual_parameters.clear();
    ctx.provisions_ret.clear();
    ctx.revisions.clear();

    let max_iterations = ctx
        .config
        .clone()
        .unwrap_or_default()
        .max_iterations();
    ctx.cycle = ctx.cycle.saturating_add(1);
    ctx.rpc_count = 0;
    ctx.iteration = ctx.cycle as u32 * max_iterations;
    debug!(cycle = ctx.cycle, "opened new provision cycle");
}

// ============================================================================
// Driver
// ============================================================================

fn check_quotas(ctx: &SessionContext, cfg: &SessionConfig) -> Option<SessionFault> {
    let fault = |code: &str, message: String| {
        Some(SessionFault::new(code, message, ctx.timestamp).with_channels(all_channels(ctx)))
    };
    if ctx.rpc_count as u32 >= cfg.max_rpc_count {
        return fault("too_many_rpcs", format!("{} RPCs in one session", ctx.rpc_count));
    }
    if ctx.revisions.len() > 8 {
        return fault(
            "deeply_nested_vparams",
            "virtual parameters nested too deeply".to_string(),
        );
    }
    if ctx.cycle >= 255 {
        return fault("too_many_cycles", "too many provision cycles".to_string());
    }
    if ctx.iteration >= cfg.max_iterations() * (ctx.cycle as u32 + 1) {
        return fault(
            "too_many_commits",
            format!("commit iterations exhausted at {}", ctx.iteration),
        );
    }
    None
}

/// Step F's filter: virtual-parameter declarations are narrowed to known
/// virtual parameters; wildcards fan out over every defined name; anything
/// else is dropped and its stale state cleared.
fn filter_vparam_declarations(
    device_data: &mut DeviceData,
    raw: Vec<Declaration>,
    vparam_names: &BTreeSet<String>,
    timestamp: i64,
) -> Vec<Declaration> {
    let mut by_name: BTreeMap<String, Declaration> = BTreeMap::new();
    let mut keep = |d: Declaration| {
        let name = match &d.path.segments()[1] {
            Segment::Name(n) => n.clone(),
            _ => return,
        };
        match by_name.entry(name) {
            std::collections::btree_map::Entry::Vacant(e) => {
                e.insert(d);
            }
            std::collections::btree_map::Entry::Occupied(mut e) => {
                let existing = e.get_mut();
                if let Some(t) = d.path_get {
                    existing.path_get = Some(existing.path_get.unwrap_or(t).max(t));
                }
                if let Some(ag) = &d.attr_get {
                    existing
                        .attr_get
                        .get_or_insert_with(Default::default)
                        .merge_max(ag);
                }
                if let Some(avs) = &d.attr_set {
                    existing
                        .attr_set
                        .get_or_insert_with(Default::default)
                        .merge_over(avs);
                }
            }
        }
    };

    for d in raw {
        match d.path.len() {
            1 => {
                // `VirtualParameters` itself; the object attribute is
                // maintained by the engine, nothing to run.
            }
            2 => match &d.path.segments()[1] {
                Segment::Wildcard | Segment::Alias(_) => {
                    for name in vparam_names {
                        let mut expanded = d.clone();
                        expanded.path = d.path.slice(0, 1).child(Segment::Name(name.clone()));
                        keep(expanded);
                    }
                }
                Segment::Name(n) if vparam_names.contains(n) => keep(d),
                Segment::Name(_) | Segment::Instance(_) => {
                    device::clear(device_data, &d.path, timestamp, None);
                }
            },
            _ => {
                device::clear(device_data, &d.path, timestamp, None);
            }
        }
    }
    by_name.into_values().collect()
}

fn vparam_attrs(device_data: &DeviceData, name: &str) -> Option<Attributes> {
    let path = Path::parse("VirtualParameters")
        .expect("static path")
        .child(Segment::Name(name.to_string()));
    device_data
        .paths
        .get(&path)
        .and_then(|p| device_data.attributes.get(&p))
        .cloned()
}

fn generate_get_virtual_parameter_provisions(
    device_data: &DeviceData,
    sync_state: &SyncState,
    inception: usize,
) -> Option<Vec<VirtualParameterCall>> {
    let decls = sync_state.virtual_parameter_declarations.get(inception)?;
    let mut calls = Vec::new();
    for d in decls {
        let Some(Segment::Name(name)) = d.path.segments().get(1) else {
            continue;
        };
        let mut requested = d.attr_get.unwrap_or_default();
        if requested.is_empty() {
            if let Some(t) = d.path_get {
                requested.value = Some(t);
                requested.writable = Some(t);
            }
        }
        let attrs = vparam_attrs(device_data, name);
        let mut need = AttrTimestamps::default();
        if let Some(want) = requested.value {
            let have = attrs
                .as_ref()
                .and_then(|a| a.timestamp_of(AttributeName::Value))
                .unwrap_or(i64::MIN);
            if have < want {
                need.value = Some(want);
            }
        }
        if let Some(want) = requested.writable {
            let have = attrs
                .as_ref()
                .and_then(|a| a.timestamp_of(AttributeName::Writable))
                .unwrap_or(i64::MIN);
            if have < want {
                need.writable = Some(want);
            }
        }
        if !need.is_empty() {
            calls.push(VirtualParameterCall {
                name: name.clone(),
                attr_get: need,
                attr_set: AttrValues::default(),
            });
        }
    }
    if calls.is_empty() { None } else { Some(calls) }
}

fn generate_set_virtual_parameter_provisions(
    device_data: &DeviceData,
    sync_state: &SyncState,
    inception: usize,
) -> Option<Vec<VirtualParameterCall>> {
    let decls = sync_state.virtual_parameter_declarations.get(inception)?;
    let mut calls = Vec::new();
    for d in decls {
        let Some(avs) = &d.attr_set else { continue };
        let Some(Segment::Name(name)) = d.path.segments().get(1) else {
            continue;
        };
        let attrs = vparam_attrs(device_data, name);
        let mut pending = AttrValues::default();
        if let Some(desired) = &avs.value {
            let current = attrs.as_ref().and_then(|a| a.value.as_ref().map(|(_, v)| v));
            if current != Some(desired) {
                pending.value = Some(desired.clone());
            }
        }
        if let Some(w) = avs.writable {
            if attrs.as_ref().and_then(|a| a.is_writable()) != Some(w) {
                pending.writable = Some(w);
            }
        }
        if !pending.is_empty() {
            calls.push(VirtualParameterCall {
                name: name.clone(),
                attr_get: d.attr_get.unwrap_or_default(),
                attr_set: pending,
            });
        }
    }
    if calls.is_empty() { None } else { Some(calls) }
}

/// Flush pending ACS-virtual writes (tags, download slots and values).
/// Returns whether anything changed, in which case the caller re-plans.
fn apply_virtual_writes(ctx: &mut SessionContext) -> bool {
    let Some(sync_state) = &mut ctx.sync_state else {
        return false;
    };
    let ts = ctx.timestamp + ctx.iteration as i64 + 1;
    let mut applied = false;

    let tags = std::mem::take(&mut sync_state.tags);
    for (path, present) in tags {
        let current = ctx
            .device_data
            .paths
            .get(&path)
            .and_then(|p| ctx.device_data.attributes.get(&p))
            .and_then(|a| a.value.as_ref())
            .map(|(_, v)| v.literal == Json::Bool(true))
            .unwrap_or(false);
        if current == present {
            continue;
        }
        applied = true;
        if present {
            write_attrs(
                &mut ctx.device_data,
                Path::parse("Tags").expect("static path"),
                ts,
                Attributes {
                    object: Some((ts, true)),
                    writable: Some((ts, true)),
                    ..Default::default()
                },
            );
            write_attrs(
                &mut ctx.device_data,
                (*path).clone(),
                ts,
                Attributes {
                    object: Some((ts, false)),
                    writable: Some((ts, true)),
                    value: Some((ts, ParameterValue::new(true, XsdType::Boolean))),
                    ..Default::default()
                },
            );
        } else {
            device::clear(&mut ctx.device_data, &path, ts, None);
        }
    }

    let to_delete = std::mem::take(&mut sync_state.downloads_to_delete);
    for path in to_delete {
        let present = ctx
            .device_data
            .paths
            .get(&path)
            .map(|p| ctx.device_data.attributes.get(&p).is_some())
            .unwrap_or(false);
        if !present {
            continue;
        }
        applied = true;
        invalidate_path(&mut ctx.device_data, (*path).clone(), ts);
    }

    while let Some(keys) = ctx
        .sync_state
        .as_mut()
        .and_then(|s| s.downloads_to_create.take())
    {
        applied = true;
        let downloads_root = Path::parse("Downloads").expect("static path");
        write_attrs(
            &mut ctx.device_data,
            downloads_root.clone(),
            ts,
            Attributes {
                object: Some((ts, true)),
                writable: Some((ts, true)),
                ..Default::default()
            },
        );
        let existing = device::unpack(
            &ctx.device_data,
            &downloads_root.child(Segment::Wildcard),
        );
        let taken: BTreeSet<u32> = existing
            .iter()
            .filter_map(|p| match p.segments().get(1) {
                Some(Segment::Instance(n)) => Some(*n),
                _ => None,
            })
            .collect();
        let mut n = 1u32;
        while taken.contains(&n) {
            n += 1;
        }
        let instance = downloads_root.child(Segment::Instance(n));
        write_attrs(
            &mut ctx.device_data,
            instance.clone(),
            ts,
            Attributes {
                object: Some((ts, true)),
                writable: Some((ts, true)),
                ..Default::default()
            },
        );
        // The trigger parameter starts at zero: never downloaded.
        write_attrs(
            &mut ctx.device_data,
            instance.child(Segment::Name("Download".to_string())),
            ts,
            leaf_value(ts, ParameterValue::new(0, XsdType::DateTime)),
        );
        for (sub, value) in keys {
            match Path::parse(&sub) {
                Ok(sub_path) => write_attrs(
                    &mut ctx.device_data,
                    instance.concat(&sub_path),
                    ts,
                    leaf_value(ts, ParameterValue::string(value)),
                ),
                Err(e) => warn!(sub, error = %e, "unparsable download key"),
            }
        }
    }

    if let Some(sync_state) = &mut ctx.sync_state {
        let values = std::mem::take(&mut sync_state.downloads_values);
        for (path, value) in values {
            let current = ctx
                .device_data
                .paths
                .get(&path)
                .and_then(|p| ctx.device_data.attributes.get(&p))
                .and_then(|a| a.value.as_ref().map(|(_, v)| v.clone()));
            if current.as_ref() == Some(&value) {
                continue;
            }
            applied = true;
            write_attrs(&mut ctx.device_data, (*path).clone(), ts, leaf_value(ts, value));
        }
    }

    applied
}

fn prune_extensions_cache(ctx: &mut SessionContext, revision: u32) {
    ctx.extensions_cache.retain(|key, _| {
        key.split_once(':')
            .and_then(|(rev, _)| rev.parse::<u32>().ok())
            .map(|r| r <= revision)
            .unwrap_or(false)
    });
}

fn apply_vparam_returns(
    ctx: &mut SessionContext,
    calls: &[VirtualParameterCall],
    returns: &[Option<VpReturn>],
) {
    let ts = write_timestamp(ctx);
    let root = Path::parse("VirtualParameters").expect("static path");
    for (call, ret) in calls.iter().zip(returns) {
        let Some(ret) = ret else { continue };
        let mut attrs = Attributes {
            object: Some((ts, false)),
            ..Default::default()
        };
        if let Some(w) = ret.writable {
            attrs.writable = Some((ts, w));
        }
        if let Some(v) = &ret.value {
            attrs.value = Some((ts, v.clone()));
        }
        write_attrs(
            &mut ctx.device_data,
            root.child(Segment::Name(call.name.clone())),
            ts,
            attrs,
        );
    }
}

/// Compute the next thing to do: a request to send, a fault, or done.
///
/// Reentrant: calling again before a response re-returns the cached request.
/// `declarations` lets the host inject ad-hoc declarations into layer 0.
#[instrument(skip(ctx, env, declarations), fields(device_id = %ctx.device_id, iteration = ctx.iteration))]
pub async fn rpc_request(
    ctx: &mut SessionContext,
    env: &SessionEnv,
    declarations: Option<Vec<Declaration>>,
) -> anyhow::Result<DriverResult> {
    ensure_config(ctx, env).await?;
    let cfg = ctx.config.clone().expect("just ensured");
    let mut injected = declarations;

    loop {
        // (A) an in-flight request is simply re-issued.
        if let Some(request) = &ctx.rpc_request {
            return Ok(DriverResult::Request {
                rpc_id: current_rpc_id(ctx),
                request: request.clone(),
            });
        }

        // (B) nothing installed and nothing injected: the session is idle.
        let injected_empty = injected.as_ref().map(|d| d.is_empty()).unwrap_or(true);
        if ctx.provisions.is_empty()
            && ctx.declarations.is_empty()
            && ctx.virtual_parameters.is_empty()
            && injected_empty
        {
            return Ok(DriverResult::Done);
        }

        // (E) quotas.
        if let Some(fault) = check_quotas(ctx, &cfg) {
            warn!(code = %fault.code, "session quota exhausted");
            return Ok(DriverResult::Fault(fault));
        }

        // (C) run the next pending layer.
        if ctx.declarations.len() <= ctx.virtual_parameters.len() {
            let inception = ctx.declarations.len();
            if ctx.revisions.len() <= inception {
                let base = ctx.revisions.last().copied().unwrap_or(0);
                ctx.revisions.push(base);
            }
            ctx.iteration += 2;

            let script_ctx = ScriptContext {
                device_id: ctx.device_id.clone(),
                timestamp: ctx.timestamp,
                start_revision: if inception == 0 {
                    0
                } else {
                    ctx.revisions[inception - 1]
                },
                end_revision: ctx.revisions[inception] + 1,
            };

            let run = if inception == 0 {
                let user_scripts = env.cache.get_provisions().await?;
                provisions::run_provisions(
                    env.scripts.as_ref(),
                    &script_ctx,
                    &ctx.device_data,
                    &ctx.provisions,
                    &user_scripts,
                )
                .await
            } else {
                provisions::run_virtual_parameters(
                    env.scripts.as_ref(),
                    &script_ctx,
                    &ctx.virtual_parameters[inception - 1],
                )
                .await
            };

            let mut run = match run {
                Ok(r) => r,
                Err(fault) => {
                    return Ok(DriverResult::Fault(
                        fault.with_channels(all_channels(ctx)),
                    ));
                }
            };

            for d in &mut run.declarations {
                if let Some(t) = &mut d.path_get {
                    *t = (*t).min(ctx.timestamp);
                }
                if let Some(ag) = &mut d.attr_get {
                    ag.cap(ctx.timestamp);
                }
            }
            debug!(
                inception,
                declarations = run.declarations.len(),
                done = run.done,
                "layer executed"
            );
            ctx.declarations.push(run.declarations);
            ctx.provisions_ret.push(LayerResult {
                done: run.done,
                returns: run.returns,
            });
            for c in run.clears {
                device::clear(
                    &mut ctx.device_data,
                    &c.path,
                    c.timestamp,
                    c.attr_timestamps.as_ref(),
                );
            }
            continue;
        }

        // (D) splice caller declarations into layer 0.
        if let Some(mut extra) = injected.take() {
            if !extra.is_empty() {
                for d in &mut extra {
                    if let Some(t) = &mut d.path_get {
                        *t = (*t).min(ctx.timestamp);
                    }
                    if let Some(ag) = &mut d.attr_get {
                        ag.cap(ctx.timestamp);
                    }
                }
                ctx.declarations[0].extend(extra);
                if let Some(ss) = &mut ctx.sync_state {
                    ss.virtual_parameter_declarations.clear();
                }
                continue;
            }
        }

        // (F) process this layer's declarations once per commit round.
        let inception = ctx.declarations.len() - 1;
        let vparam_names = env.cache.get_virtual_parameters().await?;
        {
            let ss = ctx.sync_state.get_or_insert_with(SyncState::default);
            if ss.virtual_parameter_declarations.len() <= inception {
                let decs = ctx.declarations[inception].clone();
                let raw = sync::run_declarations(
                    &mut ctx.device_data,
                    ss,
                    &decs,
                    ctx.timestamp,
                    &vparam_names,
                );
                let filtered = filter_vparam_declarations(
                    &mut ctx.device_data,
                    raw,
                    &vparam_names,
                    ctx.timestamp,
                );
                ss.virtual_parameter_declarations.push(filtered);
            }
        }

        // (G) plan: vparam reads, then CPE reads, then writes.
        let mut new_vparams;
        {
            let ss = ctx.sync_state.as_mut().expect("initialized in step F");
            new_vparams =
                generate_get_virtual_parameter_provisions(&ctx.device_data, ss, inception);
            if new_vparams.is_none() {
                ctx.rpc_request =
                    rpc_plan::generate_get_rpc_request(&mut ctx.device_data, ss, &cfg);
            }
        }
        if new_vparams.is_none() && ctx.rpc_request.is_none() {
            if ctx.device_data.changes.contains("prerequisite") {
                debug!("prerequisites changed; replanning reads");
                device::clear_tracker(&mut ctx.device_data, "prerequisite");
                ctx.sync_state = None;
                continue;
            }
            if apply_virtual_writes(ctx) {
                // The writes may satisfy (or newly enable) declarations;
                // reprocess this layer before planning further.
                if let Some(ss) = &mut ctx.sync_state {
                    ss.virtual_parameter_declarations.truncate(inception);
                }
                continue;
            }
            let ss = ctx.sync_state.as_mut().expect("initialized in step F");
            new_vparams =
                generate_set_virtual_parameter_provisions(&ctx.device_data, ss, inception);
            if new_vparams.is_none() {
                ctx.rpc_request = rpc_plan::generate_set_rpc_request(
                    &mut ctx.device_data,
                    ss,
                    &cfg,
                    ctx.timestamp,
                );
            }
        }

        // (H) a new virtual-parameter layer opens.
        if let Some(calls) = new_vparams {
            debug!(count = calls.len(), "opening virtual parameter layer");
            ctx.virtual_parameters.push(calls);
            let top = ctx.revisions.last().copied().unwrap_or(0);
            ctx.revisions.push(top);
            continue;
        }

        // (I) a request was planned.
        if let Some(request) = &ctx.rpc_request {
            return Ok(DriverResult::Request {
                rpc_id: current_rpc_id(ctx),
                request: request.clone(),
            });
        }

        // (J) this layer is idle: advance its revision, pop it, and either
        // finish (provisions done), fold a vparam layer back, or re-run.
        ctx.revisions[inception] += 1;
        let rev = ctx.revisions[inception];
        ctx.device_data.set_revision(rev);
        ctx.declarations.pop();
        if let Some(ss) = &mut ctx.sync_state {
            ss.virtual_parameter_declarations.truncate(inception);
        }
        let ret = if ctx.provisions_ret.len() > inception {
            ctx.provisions_ret.drain(inception..).next()
        } else {
            None
        };
        let Some(ret) = ret else {
            return Ok(DriverResult::Done);
        };
        if !ret.done {
            continue;
        }

        ctx.device_data.timestamps.collapse(rev);
        ctx.device_data.attributes.collapse(rev);
        prune_extensions_cache(ctx, rev);

        if inception == 0 {
            debug!("provisions converged; session idle");
            return Ok(DriverResult::Done);
        }
        let calls = ctx.virtual_parameters.pop().unwrap_or_default();
        ctx.revisions.pop();
        apply_vparam_returns(ctx, &calls, &ret.returns);
    }
}

// ============================================================================
// Response assimilation
// ============================================================================

fn invalid_response(ctx: &SessionContext, reason: &str) -> SessionFault {
    SessionFault::new("invalid_response", reason.to_string(), ctx.timestamp)
        .with_channels(all_channels(ctx))
}

/// Assimilate a CPE response to the in-flight request. Returns a fault on
/// id/method mismatch, `None` on success.
#[instrument(skip(ctx, response), fields(device_id = %ctx.device_id))]
pub fn rpc_response(
    ctx: &mut SessionContext,
    rpc_id: &str,
    response: &CpeResponse,
) -> Option<SessionFault> {
    if rpc_id != current_rpc_id(ctx) {
        return Some(invalid_response(ctx, "response id does not match request id"));
    }
    let Some(request) = ctx.rpc_request.clone() else {
        return Some(invalid_response(ctx, "no request in flight"));
    };
    if request.method_name() != response.request_name() {
        return Some(invalid_response(ctx, "response name does not match request"));
    }

    ctx.rpc_request = None;
    ctx.rpc_count = ctx.rpc_count.saturating_add(1);
    let rev = ctx.revisions.last().copied().unwrap_or(0) + 1;
    ctx.device_data.set_revision(rev);
    let ts = write_timestamp(ctx);
    let cfg = ctx.config.clone().unwrap_or_default();

    match (&request, response) {
        (
            AcsRequest::GetParameterNames {
                parameter_path,
                next_level,
            },
            CpeResponse::GetParameterNamesResponse { parameter_list },
        ) => {
            assimilate_gpn(ctx, parameter_path, *next_level, parameter_list, ts, &cfg);
        }

        (
            AcsRequest::GetParameterValues {
                parameter_names,
                next,
                instance_values,
            },
            CpeResponse::GetParameterValuesResponse { parameter_list },
        ) => {
            let mut reported: BTreeSet<&str> = BTreeSet::new();
            for (name, value) in parameter_list {
                reported.insert(name.as_str());
                if !parameter_names.contains(name) {
                    warn!(name, "unexpected parameter in GPV response");
                }
                match Path::parse(name) {
                    Ok(path) => {
                        write_attrs(&mut ctx.device_data, path, ts, leaf_value(ts, value.clone()));
                    }
                    Err(e) => warn!(name, error = %e, "unparsable reported parameter"),
                }
            }
            for name in parameter_names {
                if !reported.contains(name.as_str()) {
                    warn!(name, "requested parameter missing from GPV response");
                    if let Ok(path) = Path::parse(name) {
                        write_attrs(
                            &mut ctx.device_data,
                            path,
                            ts,
                            leaf_value(ts, ParameterValue::string("")),
                        );
                    }
                }
            }

            if *next == Some(Continuation::SetInstanceKeys) {
                if let Some(desired) = instance_values {
                    let mut fixups = Vec::new();
                    for (full, wanted) in desired {
                        let reported_value =
                            parameter_list.iter().find(|(n, _)| n == full).map(|(_, v)| v);
                        let matches = reported_value
                            .map(|v| v.literal_string() == *wanted)
                            .unwrap_or(false);
                        if !matches {
                            let xsd_type = reported_value
                                .map(|v| v.xsd_type)
                                .unwrap_or(XsdType::String);
                            let value = device::sanitize_parameter_value(&ParameterValue {
                                literal: Json::String(wanted.clone()),
                                xsd_type,
                            })
                            .unwrap_or_else(|_| ParameterValue::string(wanted.clone()));
                            fixups.push(SpvEntry {
                                name: full.clone(),
                                value,
                            });
                        }
                    }
                    if !fixups.is_empty() {
                        ctx.rpc_request = Some(AcsRequest::SetParameterValues {
                            parameter_list: fixups,
                            datetime_milliseconds: cfg.datetime_milliseconds,
                            boolean_literal: cfg.boolean_literal,
                        });
                    }
                }
            }
        }

        (
            AcsRequest::GetParameterAttributes { parameter_names },
            CpeResponse::GetParameterAttributesResponse { parameter_list },
        ) => {
            for (name, notification, access_list) in parameter_list {
                if !parameter_names.contains(name) {
                    warn!(name, "unexpected parameter in GPA response");
                }
                match Path::parse(name) {
                    Ok(path) => write_attrs(
                        &mut ctx.device_data,
                        path,
                        ts,
                        Attributes {
                            notification: Some((ts, *notification)),
                            access_list: Some((ts, access_list.clone())),
                            ..Default::default()
                        },
                    ),
                    Err(e) => warn!(name, error = %e, "unparsable reported parameter"),
                }
            }
        }

        (
            AcsRequest::SetParameterValues { parameter_list, .. },
            CpeResponse::SetParameterValuesResponse { status },
        ) => {
            debug!(status, entries = parameter_list.len(), "SPV acknowledged");
            for entry in parameter_list {
                if let Ok(path) = Path::parse(&entry.name) {
                    write_attrs(
                        &mut ctx.device_data,
                        path,
                        ts + 1,
                        leaf_value(ts + 1, entry.value.clone()),
                    );
                }
            }
        }

        (
            AcsRequest::SetParameterAttributes { parameter_list },
            CpeResponse::SetParameterAttributesResponse,
        ) => {
            for entry in parameter_list {
                if let Ok(path) = Path::parse(&entry.name) {
                    let mut attrs = Attributes::default();
                    if let Some(n) = entry.notification {
                        attrs.notification = Some((ts + 1, n));
                    }
                    if let Some(l) = &entry.access_list {
                        attrs.access_list = Some((ts + 1, l.clone()));
                    }
                    write_attrs(&mut ctx.device_data, path, ts + 1, attrs);
                }
            }
        }

        (
            AcsRequest::AddObject {
                object_name,
                instance_values,
                next,
            },
            CpeResponse::AddObjectResponse {
                instance_number, ..
            },
        ) => {
            let instance_name = format!("{}{}", object_name, instance_number);
            match Path::parse(&instance_name) {
                Ok(path) => {
                    write_attrs(
                        &mut ctx.device_data,
                        path,
                        ts,
                        Attributes {
                            object: Some((ts, true)),
                            writable: Some((ts, true)),
                            ..Default::default()
                        },
                    );
                }
                Err(e) => warn!(instance_name, error = %e, "unparsable new instance"),
            }
            if *next == Some(Continuation::GetInstanceKeys) && !instance_values.is_empty() {
                let full: BTreeMap<String, String> = instance_values
                    .iter()
                    .map(|(k, v)| (format!("{}.{}", instance_name, k), v.clone()))
                    .collect();
                ctx.rpc_request = Some(AcsRequest::GetParameterValues {
                    parameter_names: full.keys().cloned().collect(),
                    next: Some(Continuation::SetInstanceKeys),
                    instance_values: Some(full),
                });
            }
        }

        (
            AcsRequest::DeleteObject { object_name },
            CpeResponse::DeleteObjectResponse { .. },
        ) => match Path::parse(object_name) {
            Ok(path) => invalidate_path(&mut ctx.device_data, path, ts),
            Err(e) => warn!(object_name, error = %e, "unparsable deleted object"),
        },

        (AcsRequest::Reboot, CpeResponse::RebootResponse) => {
            write_attrs(
                &mut ctx.device_data,
                Path::parse("Reboot").expect("static path"),
                ts,
                leaf_value(ts, ParameterValue::new(ctx.timestamp, XsdType::DateTime)),
            );
        }

        (AcsRequest::FactoryReset, CpeResponse::FactoryResetResponse) => {
            write_attrs(
                &mut ctx.device_data,
                Path::parse("FactoryReset").expect("static path"),
                ts,
                leaf_value(ts, ParameterValue::new(ctx.timestamp, XsdType::DateTime)),
            );
        }

        (
            AcsRequest::Download {
                command_key,
                instance,
                file_type,
                file_name,
                target_file_name,
            },
            CpeResponse::DownloadResponse {
                status,
                start_time,
                complete_time,
            },
        ) => {
            if let Ok(instance_path) = Path::parse(instance) {
                let set_leaf = |dd: &mut DeviceData, name: &str, value: ParameterValue| {
                    write_attrs(
                        dd,
                        instance_path.child(Segment::Name(name.to_string())),
                        ts,
                        leaf_value(ts, value),
                    );
                };
                set_leaf(
                    &mut ctx.device_data,
                    "Download",
                    ParameterValue::new(ctx.timestamp, XsdType::DateTime),
                );
                if *status == 0 {
                    set_leaf(
                        &mut ctx.device_data,
                        "LastDownload",
                        ParameterValue::new(ctx.timestamp, XsdType::DateTime),
                    );
                    set_leaf(
                        &mut ctx.device_data,
                        "LastFileType",
                        ParameterValue::string(file_type.clone()),
                    );
                    set_leaf(
                        &mut ctx.device_data,
                        "LastFileName",
                        ParameterValue::string(file_name.clone()),
                    );
                    set_leaf(
                        &mut ctx.device_data,
                        "LastTargetFileName",
                        ParameterValue::string(target_file_name.clone()),
                    );
                    if let Some(t) = start_time {
                        set_leaf(
                            &mut ctx.device_data,
                            "StartTime",
                            ParameterValue::new(*t, XsdType::DateTime),
                        );
                    }
                    if let Some(t) = complete_time {
                        set_leaf(
                            &mut ctx.device_data,
                            "CompleteTime",
                            ParameterValue::new(*t, XsdType::DateTime),
                        );
                    }
                } else {
                    debug!(command_key, "download pending transfer complete");
                    ctx.operations.insert(
                        command_key.clone(),
                        Operation::Download {
                            timestamp: ctx.timestamp,
                            instance: instance.clone(),
                            file_type: file_type.clone(),
                            file_name: file_name.clone(),
                            target_file_name: target_file_name.clone(),
                        },
                    );
                    ctx.operations_touched.insert(command_key.clone());
                }
            }
        }

        _ => {
            return Some(invalid_response(
                ctx,
                "response payload does not match request",
            ));
        }
    }

    None
}

fn assimilate_gpn(
    ctx: &mut SessionContext,
    parameter_path: &str,
    next_level: bool,
    parameter_list: &[trellis_protocol::GpnEntry],
    ts: i64,
    cfg: &SessionConfig,
) {
    let requested = Path::parse(parameter_path).unwrap_or_else(|_| Path::root());

    // The fixed virtual roots survive a root enumeration: refresh their
    // timestamps so declarations against them read fresh.
    if requested.is_empty() {
        for root in VIRTUAL_ROOTS {
            if let Ok(p) = Path::parse(root) {
                let interned = ctx.device_data.paths.add(p);
                ctx.device_data.timestamps.set(interned, ts);
            }
        }
    }

    let mut entries: Vec<&trellis_protocol::GpnEntry> = parameter_list
        .iter()
        .filter(|e| {
            let ignored = cfg.ignore_paths.iter().any(|pre| e.name.starts_with(pre));
            if ignored {
                debug!(name = %e.name, "ignoring blacklisted path");
            }
            !ignored
        })
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    for entry in entries {
        let path = match Path::parse(&entry.name) {
            Ok(p) => p,
            Err(e) => {
                warn!(name = %entry.name, error = %e, "unparsable reported name");
                continue;
            }
        };
        if path.is_empty() {
            continue;
        }

        // Missing intermediate objects: anything between the requested path
        // and this node is an object by construction.
        for depth in requested.len().max(1)..path.len() {
            let prefix = path.slice(0, depth);
            let known = ctx
                .device_data
                .paths
                .get(&prefix)
                .map(|p| ctx.device_data.attributes.get(&p).is_some())
                .unwrap_or(false);
            if !known {
                write_attrs(
                    &mut ctx.device_data,
                    prefix,
                    ts,
                    Attributes {
                        object: Some((ts, true)),
                        ..Default::default()
                    },
                );
            }
        }

        write_attrs(
            &mut ctx.device_data,
            path.clone(),
            ts,
            Attributes {
                object: Some((ts, entry.object)),
                writable: Some((ts, entry.writable)),
                ..Default::default()
            },
        );

        // Interior nodes whose children this reply fully enumerates sweep
        // anything stale below them. With nextLevel only the requested node
        // itself is fully enumerated.
        if entry.object && (!next_level || path == requested) {
            invalidate_path(&mut ctx.device_data, path.child(Segment::Wildcard), ts);
        }
    }

    // A nextLevel reply rarely repeats the requested node; its child set is
    // still fully enumerated, so sweep below it.
    if next_level && !requested.is_empty() {
        let already = parameter_list
            .iter()
            .any(|e| Path::parse(&e.name).map(|p| p == requested).unwrap_or(false));
        if !already {
            invalidate_path(
                &mut ctx.device_data,
                requested.child(Segment::Wildcard),
                ts,
            );
        }
    }
}

/// Handle a CPE fault for the in-flight request. `9005` (invalid parameter
/// name) is recovered internally: the referenced paths are invalidated and
/// planning resumes. Everything else surfaces as `cwmp.<code>`.
#[instrument(skip(ctx, fault), fields(device_id = %ctx.device_id))]
pub fn rpc_fault(ctx: &mut SessionContext, rpc_id: &str, fault: &CpeFault) -> Option<SessionFault> {
    if rpc_id != current_rpc_id(ctx) {
        return Some(invalid_response(ctx, "fault id does not match request id"));
    }
    let Some(request) = ctx.rpc_request.take() else {
        return Some(invalid_response(ctx, "no request in flight"));
    };
    ctx.rpc_count = ctx.rpc_count.saturating_add(1);

    if fault.cwmp_code() == "9005" {
        let rev = ctx.revisions.last().copied().unwrap_or(0) + 1;
        ctx.device_data.set_revision(rev);
        let ts = write_timestamp(ctx);
        let mut names: Vec<String> = Vec::new();
        match &request {
            AcsRequest::GetParameterValues {
                parameter_names, ..
            }
            | AcsRequest::GetParameterAttributes { parameter_names } => {
                names.extend(parameter_names.iter().cloned());
            }
            AcsRequest::SetParameterValues { parameter_list, .. } => {
                names.extend(parameter_list.iter().map(|e| e.name.clone()));
            }
            AcsRequest::SetParameterAttributes { parameter_list } => {
                names.extend(parameter_list.iter().map(|e| e.name.clone()));
            }
            AcsRequest::GetParameterNames { parameter_path, .. } => {
                names.push(parameter_path.clone());
            }
            AcsRequest::AddObject { object_name, .. }
            | AcsRequest::DeleteObject { object_name } => {
                names.push(object_name.clone());
            }
            _ => {}
        }
        for name in names {
            match Path::parse(&name) {
                Ok(path) => {
                    debug!(name, "invalidating after 9005");
                    invalidate_path(&mut ctx.device_data, path, ts);
                }
                Err(e) => warn!(name, error = %e, "unparsable faulted name"),
            }
        }
        ctx.sync_state = None;
        return None;
    }

    Some(SessionFault::from_cpe(fault, ctx.timestamp).with_channels(all_channels(ctx)))
}
