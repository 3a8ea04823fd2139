// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-device engine configuration.
//!
//! Configuration reaches the engine through the local cache as a flat
//! `cwmp.*` key map (the host merges global and per-device overrides before
//! handing it over). [`SessionConfig::from_map`] parses it with defaults.

use std::collections::BTreeMap;

use serde_json::Value as Json;

/// Engine knobs, all under the `cwmp.` prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Commit iterations allowed per cycle. Each commit costs two iterations
    /// (read phase, update phase).
    pub max_commit_iterations: u32,
    /// Total RPCs allowed per session.
    pub max_rpc_count: u32,
    /// Seconds before a pending Download operation times out.
    pub download_timeout: i64,
    /// Synthesize a successful TransferComplete on timeout instead of
    /// faulting.
    pub download_success_on_timeout: bool,
    /// Max parameters per GPV/SPV/GPA/SPA request.
    pub gpv_batch_size: usize,
    /// Depth threshold at which GetParameterNames switches to single-hop
    /// (`nextLevel = true`) enumeration.
    pub gpn_next_level: usize,
    /// Suppress the root-level GetParameterNames.
    pub skip_root_gpn: bool,
    /// Bypass writable checks before AddObject/DeleteObject.
    pub skip_writable_check: bool,
    /// Keep milliseconds when encoding `xsd:dateTime` values.
    pub datetime_milliseconds: bool,
    /// Encode booleans as `true`/`false` rather than `1`/`0`.
    pub boolean_literal: bool,
    /// Path prefixes the engine must never assimilate from GPN replies.
    pub ignore_paths: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_commit_iterations: 32,
            max_rpc_count: 255,
            download_timeout: 3600,
            download_success_on_timeout: false,
            gpv_batch_size: 32,
            gpn_next_level: 0,
            skip_root_gpn: false,
            skip_writable_check: false,
            datetime_milliseconds: false,
            boolean_literal: true,
            ignore_paths: Vec::new(),
        }
    }
}

impl SessionConfig {
    /// Iterations per cycle: two per commit round.
    pub fn max_iterations(&self) -> u32 {
        self.max_commit_iterations * 2
    }

    /// Parse from the cache's config map. Unknown keys are ignored (the map
    /// carries plenty of host-side settings); malformed values fall back to
    /// their defaults.
    pub fn from_map(map: &BTreeMap<String, Json>) -> Self {
        let mut cfg = Self::default();

        if let Some(v) = get_u32(map, "cwmp.maxCommitIterations") {
            cfg.max_commit_iterations = v.max(1);
        }
        if let Some(v) = get_u32(map, "cwmp.maxRpcCount") {
            cfg.max_rpc_count = v.clamp(1, 255);
        }
        if let Some(v) = get_i64(map, "cwmp.downloadTimeout") {
            cfg.download_timeout = v;
        }
        if let Some(v) = get_bool(map, "cwmp.downloadSuccessOnTimeout") {
            cfg.download_success_on_timeout = v;
        }
        if let Some(v) = get_u32(map, "cwmp.gpvBatchSize") {
            cfg.gpv_batch_size = v.max(1) as usize;
        }
        if let Some(v) = get_u32(map, "cwmp.gpnNextLevel") {
            cfg.gpn_next_level = v as usize;
        }
        if let Some(v) = get_bool(map, "cwmp.skipRootGpn") {
            cfg.skip_root_gpn = v;
        }
        if let Some(v) = get_bool(map, "cwmp.skipWritableCheck") {
            cfg.skip_writable_check = v;
        }
        if let Some(v) = get_bool(map, "cwmp.datetimeMilliseconds") {
            cfg.datetime_milliseconds = v;
        }
        if let Some(v) = get_bool(map, "cwmp.booleanLiteral") {
            cfg.boolean_literal = v;
        }
        if let Some(Json::Array(arr)) = map.get("cwmp.ignorePaths") {
            cfg.ignore_paths = arr
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
        }

        cfg
    }
}

fn get_u32(map: &BTreeMap<String, Json>, key: &str) -> Option<u32> {
    match map.get(key)? {
        Json::Number(n) => n.as_u64().map(|v| v.min(u32::MAX as u64) as u32),
        Json::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn get_i64(map: &BTreeMap<String, Json>, key: &str) -> Option<i64> {
    match map.get(key)? {
        Json::Number(n) => n.as_i64(),
        Json::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn get_bool(map: &BTreeMap<String, Json>, key: &str) -> Option<bool> {
    match map.get(key)? {
        Json::Bool(b) => Some(*b),
        Json::String(s) => match s.trim() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        Json::Number(n) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        _ => None,
    }
}
