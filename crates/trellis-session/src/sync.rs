// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Declaration processing.
//!
//! [`run_declarations`] folds one layer of declarations into the session's
//! [`SyncState`]: the worklist of reads (refresh maps, GPN queue), writes
//! (SPV/SPA), instance creations/deletions, tags, downloads and the
//! reboot/factory-reset latches. Virtual-parameter declarations are split
//! off and returned to the driver, which decides whether to open another
//! inception layer for them.
//!
//! Everything here is idempotent over re-runs: a declaration already
//! satisfied by the current device data contributes nothing, which is what
//! makes the commit rounds converge.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use serde_json::Value as Json;
use tracing::{debug, warn};
use trellis_protocol::{ParameterValue, XsdType};

use crate::declarations::{AttrTimestamps, AttrValues, Declaration, PathSetBounds};
use crate::device::{self, DeviceData};
use crate::instance_set::{InstanceKeys, InstanceSet};
use crate::path::{Path, Segment};

/// The ACS-virtual roots: maintained by the engine, never fetched from the
/// CPE. A root GPN refreshes their timestamps so they survive sweeps.
pub const VIRTUAL_ROOTS: [&str; 7] = [
    "DeviceID",
    "Events",
    "Tags",
    "Reboot",
    "FactoryReset",
    "VirtualParameters",
    "Downloads",
];

/// Pending attribute reads, each path mapped to the freshness it must reach.
#[derive(Debug, Clone, Default)]
pub struct RefreshAttributes {
    /// Existence reconfirmations.
    pub exist: BTreeMap<Arc<Path>, i64>,
    /// Object-ness (and writability - both come from GPN).
    pub object: BTreeMap<Arc<Path>, i64>,
    /// Values (GPV).
    pub value: BTreeMap<Arc<Path>, i64>,
    /// Notification attribute (GPA).
    pub notification: BTreeMap<Arc<Path>, i64>,
    /// Access list (GPA).
    pub access_list: BTreeMap<Arc<Path>, i64>,
}

impl RefreshAttributes {
    /// True when no read is pending.
    pub fn is_empty(&self) -> bool {
        self.exist.is_empty()
            && self.object.is_empty()
            && self.value.is_empty()
            && self.notification.is_empty()
            && self.access_list.is_empty()
    }
}

/// A pending `SetParameterAttributes` entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpaState {
    /// Desired notification, when declared.
    pub notification: Option<u8>,
    /// Desired access list, when declared.
    pub access_list: Option<Vec<String>>,
}

/// The planner's worklist. Ephemeral: it can always be regenerated from the
/// declarations stack plus the device data, and is discarded wholesale when
/// prerequisites change.
#[derive(Debug, Default)]
pub struct SyncState {
    /// Pending reads.
    pub refresh_attributes: RefreshAttributes,
    /// Pending value writes.
    pub spv: BTreeMap<Arc<Path>, ParameterValue>,
    /// Pending attribute writes.
    pub spa: BTreeMap<Arc<Path>, SpaState>,
    /// Object paths queued for GetParameterNames.
    pub gpn: BTreeSet<Arc<Path>>,
    /// Declared patterns feeding the GPN cardinality estimate.
    pub gpn_patterns: BTreeMap<Arc<Path>, u32>,
    /// Tag writes: `Tags.<name>` → present/absent.
    pub tags: BTreeMap<Arc<Path>, bool>,
    /// Virtual-parameter declarations per inception layer, in the order the
    /// layers were planned.
    pub virtual_parameter_declarations: Vec<Vec<Declaration>>,
    /// Instances to delete, grouped under their parent object.
    pub instances_to_delete: BTreeMap<Arc<Path>, BTreeSet<Arc<Path>>>,
    /// Instances to create, grouped under their parent object.
    pub instances_to_create: BTreeMap<Arc<Path>, InstanceSet>,
    /// ACS-virtual download slots to delete.
    pub downloads_to_delete: BTreeSet<Arc<Path>>,
    /// ACS-virtual download slots to create.
    pub downloads_to_create: InstanceSet,
    /// Writes into `Downloads.{i}.<param>`.
    pub downloads_values: BTreeMap<Arc<Path>, ParameterValue>,
    /// `Downloads.{i}.Download` triggers: path → requested timestamp.
    pub downloads_download: BTreeMap<Arc<Path>, i64>,
    /// Requested reboot time, epoch ms.
    pub reboot: Option<i64>,
    /// Requested factory reset time, epoch ms.
    pub factory_reset: Option<i64>,
}

/// The freshest stored timestamp covering `path`: its own entry or any
/// stored wildcard entry that is a superset (an enumeration of a subtree
/// proves the absence of anything it did not report).
pub fn current_timestamp(device_data: &DeviceData, path: &Path) -> i64 {
    device_data
        .paths
        .find(path, true, false, path.len())
        .into_iter()
        .filter_map(|m| device_data.timestamps.get(&m).copied())
        .max()
        .unwrap_or(0)
}

/// Fold one layer of declarations into the sync state. Returns the
/// virtual-parameter declarations encountered, unfiltered.
pub fn run_declarations(
    device_data: &mut DeviceData,
    sync_state: &mut SyncState,
    declarations: &[Declaration],
    session_timestamp: i64,
    vparam_names: &BTreeSet<String>,
) -> Vec<Declaration> {
    let mut all_ts: BTreeMap<Arc<Path>, i64> = BTreeMap::new();
    let mut all_attr_ts: BTreeMap<Arc<Path>, AttrTimestamps> = BTreeMap::new();
    let mut all_attr_vals: BTreeMap<Arc<Path>, AttrValues> = BTreeMap::new();
    let mut bounds: Vec<(Arc<Path>, PathSetBounds)> = Vec::new();
    let mut vparam_declarations = Vec::new();
    let mut virtual_roots_interned = false;

    let mut work: VecDeque<Declaration> = declarations.iter().cloned().collect();
    while let Some(decl) = work.pop_front() {
        // ACS-virtual roots must exist in the path set before the walk, or
        // declarations against them would read as undiscovered CPE state.
        if matches!(
            decl.path.root_name(),
            Some("VirtualParameters" | "Reboot" | "FactoryReset")
        ) && !virtual_roots_interned
        {
            virtual_roots_interned = true;
            intern_virtual_roots(device_data, vparam_names);
        }

        // Aliased paths need their key parameters read before they can be
        // resolved; those reads are prerequisites, tracked so that any later
        // invalidation forces a re-plan.
        if decl.path.alias_mask() != 0 {
            let ts = decl.path_get.unwrap_or(session_timestamp);
            for alias_decl in device::get_alias_declarations(&decl.path, ts) {
                let interned = device_data.paths.add(alias_decl.path.clone());
                device::track(device_data, interned, "prerequisite");
                // Processed like any declaration: existence keyed by the
                // pattern, attribute reads bound to concrete matches.
                work.push_back(alias_decl);
            }
        }

        let interned = device_data.paths.add(decl.path.clone());

        if let Some(t) = decl.path_get {
            merge_ts(&mut all_ts, interned.clone(), t.min(session_timestamp));
        }

        // Concrete matches the attribute requirements bind to: the unpacked
        // instances, plus the path itself when it is already concrete (a
        // concrete declaration binds whether or not the path is known yet).
        let mut matches = device::unpack(device_data, &interned);
        if interned.is_concrete() && !matches.iter().any(|m| Arc::ptr_eq(m, &interned)) {
            matches.push(interned.clone());
        }

        if let Some(ag) = &decl.attr_get {
            let mut capped = *ag;
            capped.cap(session_timestamp);
            for m in &matches {
                all_attr_ts.entry(m.clone()).or_default().merge_max(&capped);
            }
        }

        if let Some(avs) = &decl.attr_set {
            for m in &matches {
                match all_attr_vals.entry(m.clone()) {
                    std::collections::btree_map::Entry::Vacant(e) => {
                        if !decl.defer {
                            e.insert(avs.clone());
                        }
                    }
                    std::collections::btree_map::Entry::Occupied(mut e) => {
                        e.get_mut().merge_over(avs);
                    }
                }
            }
        }

        if let Some(b) = decl.path_set {
            bounds.push((interned, b));
        }
    }

    process_declarations(
        device_data,
        sync_state,
        &all_ts,
        &all_attr_ts,
        &all_attr_vals,
        &mut vparam_declarations,
    );

    for (pattern, b) in bounds {
        process_instances(device_data, sync_state, &pattern, b);
    }

    vparam_declarations
}

fn merge_ts(map: &mut BTreeMap<Arc<Path>, i64>, key: Arc<Path>, ts: i64) {
    map.entry(key)
        .and_modify(|cur| *cur = (*cur).max(ts))
        .or_insert(ts);
}

// Interned with freshness 0: the nodes must exist for the walk, but a
// zero stamp keeps every declaration against them unsatisfied until the
// engine actually produces them.
fn intern_virtual_roots(device_data: &mut DeviceData, vparam_names: &BTreeSet<String>) {
    let timestamp = 0i64;
    let mut to_clear = Vec::new();
    for root in ["Reboot", "FactoryReset"] {
        let path = Path::from_segments(vec![Segment::Name(root.to_string())]);
        if device_data
            .paths
            .get(&path)
            .map(|p| device_data.attributes.get(&p).is_none())
            .unwrap_or(true)
        {
            device::set(
                device_data,
                path,
                timestamp,
                Some(crate::device::Attributes {
                    object: Some((timestamp, false)),
                    writable: Some((timestamp, true)),
                    ..Default::default()
                }),
                &mut to_clear,
            );
        }
    }

    let vp_root = Path::parse("VirtualParameters").expect("static path");
    device::set(
        device_data,
        vp_root.clone(),
        timestamp,
        Some(crate::device::Attributes {
            object: Some((timestamp, true)),
            writable: Some((timestamp, false)),
            ..Default::default()
        }),
        &mut to_clear,
    );
    for name in vparam_names {
        let leaf = vp_root.child(Segment::Name(name.clone()));
        if device_data
            .paths
            .get(&leaf)
            .map(|p| device_data.attributes.get(&p).is_none())
            .unwrap_or(true)
        {
            device::set(
                device_data,
                leaf,
                timestamp,
                Some(crate::device::Attributes {
                    object: Some((timestamp, false)),
                    ..Default::default()
                }),
                &mut to_clear,
            );
        }
    }
    for c in to_clear {
        device::clear(device_data, &c.path, c.timestamp, c.attr_timestamps.as_ref());
    }
}

/// The tree walk: for every declared path decide what, if anything, must be
/// read or written, dispatching on the root segment.
#[allow(clippy::too_many_arguments)]
fn process_declarations(
    device_data: &mut DeviceData,
    sync_state: &mut SyncState,
    all_ts: &BTreeMap<Arc<Path>, i64>,
    all_attr_ts: &BTreeMap<Arc<Path>, AttrTimestamps>,
    all_attr_vals: &BTreeMap<Arc<Path>, AttrValues>,
    vparam_declarations: &mut Vec<Declaration>,
) {
    // Existence / discovery planning, keyed by declared pattern. BTreeMap
    // order visits exact segments before wildcards.
    for (pattern, declared_ts) in all_ts {
        match pattern.root_name() {
            Some("Events") | Some("DeviceID") | Some("Tags") | Some("Downloads")
            | Some("Reboot") | Some("FactoryReset") => {
                // ACS-computed; nothing to discover.
            }
            Some("VirtualParameters") => {
                if pattern.len() <= 2 && current_timestamp(device_data, pattern) < *declared_ts {
                    vparam_declarations.push(Declaration {
                        path: (**pattern).clone(),
                        path_get: Some(*declared_ts),
                        path_set: None,
                        attr_get: all_attr_ts.get(pattern).copied(),
                        attr_set: None,
                        defer: false,
                    });
                }
            }
            _ => {
                plan_discovery_expanded(device_data, sync_state, pattern, *declared_ts);
            }
        }
    }

    // Per-attribute reads, keyed by concrete path.
    for (path, wanted) in all_attr_ts {
        match path.root_name() {
            Some("Events") | Some("DeviceID") | Some("Tags") | Some("Downloads")
            | Some("Reboot") | Some("FactoryReset") => continue,
            Some("VirtualParameters") => {
                // Stale vparam attributes re-run the vparam script; emitted
                // above iff the path-level timestamp was stale, and here for
                // pure attribute staleness.
                let attrs = device_data.attributes.get(path);
                let stale = [
                    (wanted.value, attrs.and_then(|a| a.value.as_ref().map(|(t, _)| *t))),
                    (wanted.writable, attrs.and_then(|a| a.writable.map(|(t, _)| t))),
                ]
                .into_iter()
                .any(|(want, have)| matches!(want, Some(w) if have.unwrap_or(i64::MIN) < w));
                if stale && path.len() == 2 {
                    vparam_declarations.push(Declaration {
                        path: (**path).clone(),
                        path_get: None,
                        path_set: None,
                        attr_get: Some(*wanted),
                        attr_set: None,
                        defer: false,
                    });
                }
                continue;
            }
            _ => {}
        }

        let attrs = device_data.attributes.get(path).cloned();
        let object = attrs.as_ref().and_then(|a| a.is_object());

        if let Some(want) = wanted.object {
            let have = attrs
                .as_ref()
                .and_then(|a| a.object.map(|(t, _)| t))
                .unwrap_or(i64::MIN);
            if have < want {
                merge_ts(&mut sync_state.refresh_attributes.object, path.clone(), want);
            }
        }
        if let Some(want) = wanted.writable {
            let have = attrs
                .as_ref()
                .and_then(|a| a.writable.map(|(t, _)| t))
                .unwrap_or(i64::MIN);
            if have < want {
                // Writability arrives with GPN, same as object-ness.
                merge_ts(&mut sync_state.refresh_attributes.object, path.clone(), want);
            }
        }
        if let Some(want) = wanted.value {
            let have = attrs
                .as_ref()
                .and_then(|a| a.value.as_ref().map(|(t, _)| *t))
                .unwrap_or(i64::MIN);
            if have < want {
                match object {
                    Some(true) => {} // objects carry no value
                    Some(false) => {
                        merge_ts(&mut sync_state.refresh_attributes.value, path.clone(), want);
                    }
                    None => {
                        // Object-ness first; the value read follows once the
                        // node is known to be a leaf.
                        merge_ts(&mut sync_state.refresh_attributes.object, path.clone(), want);
                        merge_ts(&mut sync_state.refresh_attributes.value, path.clone(), want);
                    }
                }
            }
        }
        if let Some(want) = wanted.notification {
            let have = attrs
                .as_ref()
                .and_then(|a| a.notification.map(|(t, _)| t))
                .unwrap_or(i64::MIN);
            if have < want {
                merge_ts(
                    &mut sync_state.refresh_attributes.notification,
                    path.clone(),
                    want,
                );
            }
        }
        if let Some(want) = wanted.access_list {
            let have = attrs
                .as_ref()
                .and_then(|a| a.access_list.as_ref().map(|(t, _)| *t))
                .unwrap_or(i64::MIN);
            if have < want {
                merge_ts(
                    &mut sync_state.refresh_attributes.access_list,
                    path.clone(),
                    want,
                );
            }
        }
    }

    // Writes, keyed by concrete path.
    for (path, vals) in all_attr_vals {
        match path.root_name() {
            Some("Reboot") => {
                if path.len() == 1 {
                    if let Some(ms) = vals.value.as_ref().and_then(epoch_ms) {
                        sync_state.reboot = Some(ms);
                    }
                }
            }
            Some("FactoryReset") => {
                if path.len() == 1 {
                    if let Some(ms) = vals.value.as_ref().and_then(epoch_ms) {
                        sync_state.factory_reset = Some(ms);
                    }
                }
            }
            Some("Tags") => {
                if path.len() == 2 && path.is_concrete() {
                    if let Some(v) = &vals.value {
                        match device::sanitize_parameter_value(&ParameterValue {
                            literal: v.literal.clone(),
                            xsd_type: XsdType::Boolean,
                        }) {
                            Ok(b) => {
                                sync_state
                                    .tags
                                    .insert(path.clone(), b.literal == Json::Bool(true));
                            }
                            Err(e) => warn!(path = %path, error = %e, "invalid tag value"),
                        }
                    }
                }
            }
            Some("Events") | Some("DeviceID") => {}
            Some("Downloads") => {
                if path.len() == 3 && path.is_concrete() {
                    if let Some(v) = &vals.value {
                        if matches!(path.segments().last(), Some(Segment::Name(n)) if n == "Download")
                        {
                            if let Some(ms) = epoch_ms(v) {
                                sync_state.downloads_download.insert(path.clone(), ms);
                            }
                        } else {
                            sync_state.downloads_values.insert(path.clone(), v.clone());
                        }
                    }
                }
            }
            Some("VirtualParameters") => {
                if path.len() == 2 {
                    vparam_declarations.push(Declaration {
                        path: (**path).clone(),
                        path_get: None,
                        path_set: None,
                        attr_get: all_attr_ts.get(path).copied(),
                        attr_set: Some(vals.clone()),
                        defer: false,
                    });
                }
            }
            _ => {
                if let Some(v) = &vals.value {
                    match device::sanitize_parameter_value(v) {
                        Ok(sanitized) => {
                            sync_state.spv.insert(path.clone(), sanitized);
                        }
                        Err(e) => warn!(path = %path, error = %e, "invalid declared value"),
                    }
                }
                if vals.notification.is_some() || vals.access_list.is_some() {
                    let entry = sync_state.spa.entry(path.clone()).or_default();
                    if vals.notification.is_some() {
                        entry.notification = vals.notification;
                    }
                    if vals.access_list.is_some() {
                        entry.access_list = vals.access_list.clone();
                    }
                }
            }
        }
    }

    debug!(
        gpn = sync_state.gpn.len(),
        exist = sync_state.refresh_attributes.exist.len(),
        value = sync_state.refresh_attributes.value.len(),
        spv = sync_state.spv.len(),
        "declarations processed"
    );
}

/// First wildcard/alias position, where a pattern can fan out over the
/// instances already known at that level.
fn first_expandable(pattern: &Path) -> Option<usize> {
    let mask = pattern.wildcard_mask() | pattern.alias_mask();
    if mask == 0 {
        None
    } else {
        Some(mask.trailing_zeros() as usize)
    }
}

/// Plan discovery for a pattern, fanning out through known instances so
/// that `A.*.Name` keeps descending below an already-discovered `A.1` while
/// the bare pattern still probes for instances not seen yet.
fn plan_discovery_expanded(
    device_data: &mut DeviceData,
    sync_state: &mut SyncState,
    pattern: &Arc<Path>,
    declared_ts: i64,
) {
    let mut stack = vec![(**pattern).clone()];
    let mut seen = BTreeSet::new();
    while let Some(p) = stack.pop() {
        if !seen.insert(p.to_string()) {
            continue;
        }
        if let Some(i) = first_expandable(&p) {
            let level = p.slice(0, i).child(Segment::Wildcard);
            for child in device_data.paths.find(&level, false, true, i + 1) {
                if child.is_concrete() && device_data.attributes.get(&child).is_some() {
                    stack.push(child.concat(&p.slice(i + 1, p.len())));
                }
            }
        }
        plan_discovery(device_data, sync_state, &p, declared_ts);
    }
}

/// Plan discovery for one declared pattern whose freshness is not met.
fn plan_discovery(
    device_data: &mut DeviceData,
    sync_state: &mut SyncState,
    pattern: &Path,
    declared_ts: i64,
) {
    if current_timestamp(device_data, pattern) >= declared_ts {
        return;
    }

    // Deepest prefix whose node is known.
    let mut leaf_len = 0;
    for i in (1..=pattern.len()).rev() {
        let prefix = pattern.slice(0, i);
        if let Some(p) = device_data.paths.get(&prefix) {
            if device_data.attributes.get(&p).is_some() {
                leaf_len = i;
                break;
            }
        }
    }

    if leaf_len == pattern.len() {
        // The node exists but its confirmation is stale.
        let interned = device_data.paths.add(pattern.clone());
        merge_ts(
            &mut sync_state.refresh_attributes.exist,
            interned,
            declared_ts,
        );
        return;
    }

    // An enumeration of the frontier level fresher than the declaration
    // proves anything it did not report is absent; there is nothing left to
    // discover along this pattern.
    let frontier = pattern.slice(0, leaf_len).child(Segment::Wildcard);
    if let Some(m) = device_data.paths.get(&frontier) {
        if device_data.timestamps.get(&m).copied().unwrap_or(0) >= declared_ts {
            return;
        }
    }

    if leaf_len == 0 {
        // Nothing along the path is known. Queue the depth-1 parent rather
        // than the root; the root object is assumed present.
        let head = device_data.paths.add(pattern.slice(0, 1));
        sync_state.gpn.insert(head);
        let interned = device_data.paths.add(pattern.clone());
        sync_state
            .gpn_patterns
            .entry(interned.clone())
            .and_modify(|m| *m |= interned.wildcard_mask() | interned.alias_mask())
            .or_insert(interned.wildcard_mask() | interned.alias_mask());
        return;
    }

    let leaf = device_data.paths.add(pattern.slice(0, leaf_len));
    let leaf_object = device_data
        .attributes
        .get(&leaf)
        .and_then(|a| a.is_object());
    match leaf_object {
        Some(true) => {
            sync_state.gpn.insert(leaf);
            let interned = device_data.paths.add(pattern.clone());
            sync_state
                .gpn_patterns
                .entry(interned.clone())
                .and_modify(|m| *m |= interned.wildcard_mask() | interned.alias_mask())
                .or_insert(interned.wildcard_mask() | interned.alias_mask());
        }
        Some(false) => {
            // The declared path descends below a parameter; it cannot exist.
        }
        None => {
            merge_ts(
                &mut sync_state.refresh_attributes.object,
                leaf,
                declared_ts,
            );
        }
    }
}

/// Plan instance creations and deletions for one `pathSet` declaration.
fn process_instances(
    device_data: &mut DeviceData,
    sync_state: &mut SyncState,
    pattern: &Arc<Path>,
    bounds: PathSetBounds,
) {
    if pattern.is_empty() {
        return;
    }
    let parent_path = pattern.parent();
    let keys: InstanceKeys = match pattern.segments().last() {
        Some(Segment::Alias(pairs)) => pairs
            .iter()
            .map(|(sub, val)| (sub.to_string(), val.clone()))
            .collect(),
        Some(Segment::Wildcard) => InstanceKeys::new(),
        _ => {
            warn!(path = %pattern, "pathSet requires a wildcard or alias tail");
            return;
        }
    };

    let is_downloads = pattern.root_name() == Some("Downloads") && pattern.len() == 2;
    let existing = device::unpack(device_data, pattern);
    let parent = device_data.paths.add(parent_path);

    if is_downloads {
        let pending = sync_state.downloads_to_create.superset(&keys).len();
        let total = existing.len() + pending;
        for _ in total..bounds.min as usize {
            sync_state.downloads_to_create.add(keys.clone());
        }
        if existing.len() > bounds.max as usize {
            for victim in existing.iter().rev().take(existing.len() - bounds.max as usize) {
                sync_state.downloads_to_delete.insert(victim.clone());
            }
        }
        return;
    }

    let pending = sync_state
        .instances_to_create
        .get(&parent)
        .map(|s| s.superset(&keys).len())
        .unwrap_or(0);
    let planned_deletes = sync_state
        .instances_to_delete
        .get(&parent)
        .map(|s| existing.iter().filter(|e| s.contains(*e)).count())
        .unwrap_or(0);
    let total = existing.len() + pending - planned_deletes;

    if total < bounds.min as usize {
        let create = sync_state.instances_to_create.entry(parent.clone()).or_default();
        for _ in total..bounds.min as usize {
            create.add(keys.clone());
        }
    } else if total > bounds.max as usize {
        let mut excess = total - bounds.max as usize;
        // Cancel pending creations first; real instances go last, highest
        // instance numbers first.
        if let Some(create) = sync_state.instances_to_create.get_mut(&parent) {
            while excess > 0 && create.remove(&keys) {
                excess -= 1;
            }
        }
        if excess > 0 {
            let delete = sync_state.instances_to_delete.entry(parent).or_default();
            for victim in existing.iter().rev() {
                if excess == 0 {
                    break;
                }
                if delete.insert(victim.clone()) {
                    excess -= 1;
                }
            }
        }
    }
}

/// Interpret a declared value as an epoch-ms instant. Numbers are taken as
/// ms; strings are parsed as RFC 3339; booleans map to 0/1 (the
/// "now/never" convention scripts use for Reboot).
pub fn epoch_ms(value: &ParameterValue) -> Option<i64> {
    match &value.literal {
        Json::Number(n) => n.as_i64(),
        Json::String(s) => s
            .parse::<chrono::DateTime<chrono::Utc>>()
            .ok()
            .map(|d| d.timestamp_millis()),
        Json::Bool(b) => Some(if *b { 1 } else { 0 }),
        _ => None,
    }
}
