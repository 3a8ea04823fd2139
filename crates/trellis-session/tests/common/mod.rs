// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for trellis-session integration tests.
//!
//! Provides an in-memory cache, a scripted sandbox and builders for the
//! messages a CPE would send. No network, no database, no real scripts.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value as Json;
use trellis_protocol::{CpeRequest, DeviceIdStruct, ParameterValue};
use trellis_session::cache::LocalCache;
use trellis_session::sandbox::{ScriptContext, ScriptOutcome, ScriptRunner};
use trellis_session::session::{self, SessionContext, SessionEnv};

/// Session start used by most tests, epoch ms.
pub const T0: i64 = 1_700_000_000_000;

/// In-memory [`LocalCache`].
#[derive(Default)]
pub struct MemoryCache {
    pub config: BTreeMap<String, Json>,
    pub provisions: BTreeSet<String>,
    pub virtual_parameters: BTreeSet<String>,
}

#[async_trait]
impl LocalCache for MemoryCache {
    async fn get_config(&self, _device_id: &str) -> anyhow::Result<BTreeMap<String, Json>> {
        Ok(self.config.clone())
    }

    async fn get_provisions(&self) -> anyhow::Result<BTreeSet<String>> {
        Ok(self.provisions.clone())
    }

    async fn get_virtual_parameters(&self) -> anyhow::Result<BTreeSet<String>> {
        Ok(self.virtual_parameters.clone())
    }
}

/// A sandbox whose scripts are canned [`ScriptOutcome`]s, recorded per call.
#[derive(Default)]
pub struct ScriptedRunner {
    pub provisions: HashMap<String, ScriptOutcome>,
    pub virtual_parameters: HashMap<String, ScriptOutcome>,
    pub calls: Mutex<Vec<String>>,
}

#[async_trait]
impl ScriptRunner for ScriptedRunner {
    async fn run_provision(
        &self,
        _ctx: &ScriptContext,
        name: &str,
        _args: &[Json],
    ) -> anyhow::Result<ScriptOutcome> {
        self.calls.lock().unwrap().push(format!("provision:{}", name));
        self.provisions
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no scripted provision {}", name))
    }

    async fn run_virtual_parameter(
        &self,
        _ctx: &ScriptContext,
        name: &str,
        _attr_get: &trellis_session::declarations::AttrTimestamps,
        _attr_set: &trellis_session::declarations::AttrValues,
    ) -> anyhow::Result<ScriptOutcome> {
        self.calls.lock().unwrap().push(format!("vparam:{}", name));
        self.virtual_parameters
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no scripted virtual parameter {}", name))
    }
}

/// A context plus collaborators, ready to drive.
pub struct TestSession {
    pub ctx: SessionContext,
    pub env: SessionEnv,
}

impl TestSession {
    /// A fresh session at [`T0`] with empty collaborators.
    pub fn new() -> Self {
        Self::with(MemoryCache::default(), ScriptedRunner::default())
    }

    /// A fresh session with specific collaborators.
    pub fn with(cache: MemoryCache, runner: ScriptedRunner) -> Self {
        Self {
            ctx: session::init_at("test-device", "1.4", 30_000, T0),
            env: SessionEnv {
                cache: Arc::new(cache),
                scripts: Arc::new(runner),
            },
        }
    }
}

/// The standard test `Inform`.
pub fn inform_request(events: &[&str], parameters: &[(&str, ParameterValue)]) -> CpeRequest {
    CpeRequest::Inform {
        device_id: DeviceIdStruct {
            manufacturer: "M".to_string(),
            oui: "000000".to_string(),
            product_class: "P".to_string(),
            serial_number: "S".to_string(),
        },
        event: events.iter().map(|e| e.to_string()).collect(),
        parameter_list: parameters
            .iter()
            .map(|(n, v)| (n.to_string(), v.clone()))
            .collect(),
        retry_count: 0,
    }
}

/// Read a stored value attribute as `(literal, type)`.
pub fn stored_value(ctx: &SessionContext, path: &str) -> Option<ParameterValue> {
    let parsed = trellis_session::path::Path::parse(path).unwrap();
    let interned = ctx.device_data.paths.get(&parsed)?;
    ctx.device_data
        .attributes
        .get(&interned)
        .and_then(|a| a.value.as_ref().map(|(_, v)| v.clone()))
}
