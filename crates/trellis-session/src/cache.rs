// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The local-cache seam.
//!
//! The engine never reads its configuration, provision scripts or virtual
//! parameter definitions from disk or a database; the host injects an
//! implementation of [`LocalCache`]. First access may block while the host
//! bootstraps the cache - that is the only awaitable thing about it.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde_json::Value as Json;

use crate::config::SessionConfig;

/// Read-mostly host state the engine consults.
#[async_trait]
pub trait LocalCache: Send + Sync {
    /// The merged `cwmp.*` configuration for a device.
    async fn get_config(&self, device_id: &str) -> anyhow::Result<BTreeMap<String, Json>>;

    /// Names of provisions that have a user-defined script. Provision names
    /// outside this set run the engine builtin of the same name.
    async fn get_provisions(&self) -> anyhow::Result<BTreeSet<String>>;

    /// Names of defined virtual parameters. Each name must be a single
    /// valid path segment; they become `VirtualParameters.<name>` leaves.
    async fn get_virtual_parameters(&self) -> anyhow::Result<BTreeSet<String>>;
}

/// Resolve the typed config for a device.
pub async fn session_config(
    cache: &dyn LocalCache,
    device_id: &str,
) -> anyhow::Result<SessionConfig> {
    let map = cache.get_config(device_id).await?;
    Ok(SessionConfig::from_map(&map))
}
