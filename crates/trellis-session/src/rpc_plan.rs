// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! RPC planning: turn the [`SyncState`] worklist into the next request.
//!
//! [`generate_get_rpc_request`] drains reads in priority order (GPN, GPV,
//! GPA); [`generate_set_rpc_request`] drains writes (DeleteObject,
//! AddObject, SPV, SPA, Download, Reboot, FactoryReset). Both re-check every
//! queued entry against the live device data first: anything a response has
//! satisfied in the meantime - or proven absent via a subtree enumeration -
//! is dropped, never emitted. That re-check is what makes the driver's
//! request/response rounds converge instead of ping-ponging.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value as Json;
use tracing::{debug, warn};
use trellis_protocol::{AcsRequest, Continuation, ParameterValue, SpaEntry, SpvEntry, XsdType};

use crate::config::SessionConfig;
use crate::device::{self, AttributeName, DeviceData};
use crate::path::Path;
use crate::sync::{current_timestamp, SyncState};

/// Compare two access lists. Order matters: the list is ordered on the wire.
pub fn compare_access_lists(a: &[String], b: &[String]) -> bool {
    a == b
}

/// Estimated number of nodes a deep `GetParameterNames` under `base` would
/// report, from the declared patterns and the instances already known.
pub fn estimate_gpn_count(
    device_data: &DeviceData,
    patterns: &BTreeMap<Arc<Path>, u32>,
    base: &Path,
) -> u64 {
    let mut total = 0u64;
    for pattern in patterns.keys() {
        if pattern.len() <= base.len() || !pattern_covers(pattern, base) {
            continue;
        }
        let known = device::unpack(device_data, pattern).len() as u64;
        total += known.max(1);
    }
    total.max(1)
}

fn pattern_covers(pattern: &Path, base: &Path) -> bool {
    base.segments()
        .iter()
        .zip(pattern.segments())
        .all(|(b, p)| p == b || !matches!(p, crate::path::Segment::Name(_) | crate::path::Segment::Instance(_)))
}

/// Whether a queued attribute read is already answered or pointless.
fn attr_read_satisfied(
    device_data: &DeviceData,
    path: &Arc<Path>,
    want: i64,
    kind: AttributeName,
) -> bool {
    if let Some(attrs) = device_data.attributes.get(path) {
        if attrs.timestamp_of(kind).unwrap_or(i64::MIN) >= want {
            return true;
        }
        // Objects carry no value to read.
        if kind == AttributeName::Value && attrs.is_object() == Some(true) {
            return true;
        }
        false
    } else {
        // Absent - but a fresh-enough enumeration proves it stays absent.
        current_timestamp(device_data, path) >= want
    }
}

/// Produce the next read RPC, or `None` when no read is pending.
pub fn generate_get_rpc_request(
    device_data: &mut DeviceData,
    sync_state: &mut SyncState,
    config: &SessionConfig,
) -> Option<AcsRequest> {
    // 1. Promote pending existence/object reads to GPN where no queued entry
    // covers them yet.
    sync_state
        .refresh_attributes
        .exist
        .retain(|p, ts| current_timestamp(device_data, p) < *ts);
    sync_state
        .refresh_attributes
        .object
        .retain(|p, ts| !attr_read_satisfied(device_data, p, *ts, AttributeName::Object));

    let mut to_promote = Vec::new();
    for p in sync_state
        .refresh_attributes
        .exist
        .keys()
        .chain(sync_state.refresh_attributes.object.keys())
    {
        if !sync_state.gpn.iter().any(|g| p.starts_with(g)) {
            to_promote.push(p.clone());
        }
    }
    for p in to_promote {
        let parent = device_data.paths.add(p.parent());
        sync_state.gpn.insert(parent);
        let mask = p.wildcard_mask() | p.alias_mask();
        sync_state
            .gpn_patterns
            .entry(p)
            .and_modify(|m| *m |= mask)
            .or_insert(mask);
    }

    // 2. GPN: deepest queued path, preferring ones not yet discovered.
    loop {
        let chosen = sync_state
            .gpn
            .iter()
            .filter(|p| device_data.attributes.get(*p).is_none())
            .max_by_key(|p| p.len())
            .or_else(|| sync_state.gpn.iter().max_by_key(|p| p.len()))
            .cloned();
        let Some(path) = chosen else { break };
        sync_state.gpn.remove(&path);

        if path.is_empty() && config.skip_root_gpn {
            debug!("root GPN suppressed by configuration");
            continue;
        }

        let depth = path.len();
        let next_level = if depth >= config.gpn_next_level {
            let estimate = estimate_gpn_count(device_data, &sync_state.gpn_patterns, &path);
            estimate < 1u64 << (8 - depth.min(8))
        } else {
            false
        };

        let parameter_path = if path.is_empty() {
            String::new()
        } else {
            format!("{}.", path)
        };
        return Some(AcsRequest::GetParameterNames {
            parameter_path,
            next_level,
        });
    }

    // 3. GPV over known leaves.
    let mut names = Vec::new();
    let value_paths: Vec<Arc<Path>> = sync_state
        .refresh_attributes
        .value
        .keys()
        .cloned()
        .collect();
    for p in value_paths {
        if names.len() >= config.gpv_batch_size {
            break;
        }
        let want = sync_state.refresh_attributes.value[&p];
        if attr_read_satisfied(device_data, &p, want, AttributeName::Value) {
            sync_state.refresh_attributes.value.remove(&p);
            continue;
        }
        let is_leaf = device_data
            .attributes
            .get(&p)
            .and_then(|a| a.is_object())
            == Some(false);
        if !is_leaf {
            // Object-ness not yet known; a GPN round will settle it.
            continue;
        }
        sync_state.refresh_attributes.value.remove(&p);
        names.push(p.to_string());
    }
    if !names.is_empty() {
        return Some(AcsRequest::GetParameterValues {
            parameter_names: names,
            next: None,
            instance_values: None,
        });
    }

    // 4. GPA over notification/access-list reads.
    let mut names = Vec::new();
    for field in [AttributeName::Notification, AttributeName::AccessList] {
        let map = match field {
            AttributeName::Notification => &mut sync_state.refresh_attributes.notification,
            _ => &mut sync_state.refresh_attributes.access_list,
        };
        let paths: Vec<Arc<Path>> = map.keys().cloned().collect();
        for p in paths {
            if names.len() >= config.gpv_batch_size {
                break;
            }
            let want = map[&p];
            if attr_read_satisfied(device_data, &p, want, field) {
                map.remove(&p);
                continue;
            }
            if device_data.attributes.get(&p).is_none() {
                continue;
            }
            map.remove(&p);
            let name = p.to_string();
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    if !names.is_empty() {
        return Some(AcsRequest::GetParameterAttributes {
            parameter_names: names,
        });
    }

    None
}

/// Produce the next write RPC, or `None` when no write is pending.
pub fn generate_set_rpc_request(
    device_data: &mut DeviceData,
    sync_state: &mut SyncState,
    config: &SessionConfig,
    timestamp: i64,
) -> Option<AcsRequest> {
    // 1. DeleteObject.
    let mut emitted = None;
    for (parent, victims) in sync_state.instances_to_delete.iter_mut() {
        let candidate = victims
            .iter()
            .find(|v| {
                config.skip_writable_check
                    || device_data
                        .attributes
                        .get(*v)
                        .and_then(|a| a.is_writable())
                        == Some(true)
            })
            .cloned();
        if let Some(victim) = candidate {
            victims.remove(&victim);
            emitted = Some((parent.clone(), victim));
            break;
        }
    }
    if let Some((parent, victim)) = emitted {
        if sync_state.instances_to_delete[&parent].is_empty() {
            sync_state.instances_to_delete.remove(&parent);
        }
        return Some(AcsRequest::DeleteObject {
            object_name: format!("{}.", victim),
        });
    }

    // 2. AddObject, with the instance-key continuation. Only DeleteObject
    // carries a writability precondition.
    let chosen_parent = sync_state
        .instances_to_create
        .iter()
        .find(|(_, pending)| !pending.is_empty())
        .map(|(parent, _)| parent.clone());
    if let Some(parent) = chosen_parent {
        let pending = sync_state.instances_to_create.get_mut(&parent).expect("chosen above");
        let keys = pending.take().expect("non-empty checked");
        if pending.is_empty() {
            sync_state.instances_to_create.remove(&parent);
        }
        let next = if keys.is_empty() {
            None
        } else {
            Some(Continuation::GetInstanceKeys)
        };
        return Some(AcsRequest::AddObject {
            object_name: format!("{}.", parent),
            instance_values: keys,
            next,
        });
    }

    // 3. SetParameterValues.
    let mut entries = Vec::new();
    let spv_paths: Vec<Arc<Path>> = sync_state.spv.keys().cloned().collect();
    for p in spv_paths {
        if entries.len() >= config.gpv_batch_size {
            break;
        }
        let desired = sync_state.spv.remove(&p).expect("key just listed");
        let current = device_data
            .attributes
            .get(&p)
            .and_then(|a| a.value.as_ref().map(|(_, v)| v.clone()));

        let mut outgoing = desired.clone();
        if let Some(cur) = &current {
            if cur.xsd_type != outgoing.xsd_type {
                // The device's stored type wins; coerce when possible.
                match device::sanitize_parameter_value(&ParameterValue {
                    literal: outgoing.literal.clone(),
                    xsd_type: cur.xsd_type,
                }) {
                    Ok(coerced) => outgoing = coerced,
                    Err(e) => {
                        warn!(path = %p, error = %e, "keeping declared type for SPV");
                    }
                }
            }
        }
        if outgoing.xsd_type == XsdType::DateTime && !config.datetime_milliseconds {
            outgoing.literal = strip_datetime_millis(&outgoing.literal);
        }
        if current.as_ref() == Some(&outgoing) {
            continue; // already the device's value
        }
        entries.push(SpvEntry {
            name: p.to_string(),
            value: outgoing,
        });
    }
    if !entries.is_empty() {
        return Some(AcsRequest::SetParameterValues {
            parameter_list: entries,
            datetime_milliseconds: config.datetime_milliseconds,
            boolean_literal: config.boolean_literal,
        });
    }

    // 4. SetParameterAttributes.
    let mut entries = Vec::new();
    let spa_paths: Vec<Arc<Path>> = sync_state.spa.keys().cloned().collect();
    for p in spa_paths {
        if entries.len() >= config.gpv_batch_size {
            break;
        }
        let wanted = sync_state.spa.remove(&p).expect("key just listed");
        let attrs = device_data.attributes.get(&p);
        let notification = wanted.notification.filter(|n| {
            attrs.and_then(|a| a.notification.map(|(_, v)| v)) != Some(*n)
        });
        let access_list = wanted.access_list.filter(|l| {
            attrs
                .and_then(|a| a.access_list.as_ref().map(|(_, v)| compare_access_lists(v, l)))
                != Some(true)
        });
        if notification.is_none() && access_list.is_none() {
            continue;
        }
        entries.push(SpaEntry {
            name: p.to_string(),
            notification,
            access_list,
        });
    }
    if !entries.is_empty() {
        return Some(AcsRequest::SetParameterAttributes {
            parameter_list: entries,
        });
    }

    // 5. Download.
    let download_paths: Vec<Arc<Path>> = sync_state.downloads_download.keys().cloned().collect();
    for p in download_paths {
        let wanted = sync_state.downloads_download[&p];
        let current = device_data
            .attributes
            .get(&p)
            .and_then(|a| a.value.as_ref())
            .and_then(|(_, v)| crate::sync::epoch_ms(v))
            .unwrap_or(0);
        if wanted <= 0 || wanted > timestamp || wanted <= current {
            if wanted <= current {
                sync_state.downloads_download.remove(&p);
            }
            continue;
        }
        sync_state.downloads_download.remove(&p);

        let instance = p.parent();
        let sibling = |name: &str| -> String {
            let sib = instance.child(crate::path::Segment::Name(name.to_string()));
            device_data
                .paths
                .get(&sib)
                .and_then(|sp| device_data.attributes.get(&sp))
                .and_then(|a| a.value.as_ref().map(|(_, v)| v.literal_string()))
                .unwrap_or_default()
        };
        return Some(AcsRequest::Download {
            command_key: uuid::Uuid::new_v4().simple().to_string(),
            instance: instance.to_string(),
            file_type: sibling("FileType"),
            file_name: sibling("FileName"),
            target_file_name: sibling("TargetFileName"),
        });
    }

    // 6. Reboot / FactoryReset.
    if let Some(t) = sync_state.reboot {
        sync_state.reboot = None;
        let current = virtual_value_ms(device_data, "Reboot");
        if t > current {
            return Some(AcsRequest::Reboot);
        }
    }
    if let Some(t) = sync_state.factory_reset {
        sync_state.factory_reset = None;
        let current = virtual_value_ms(device_data, "FactoryReset");
        if t > current {
            return Some(AcsRequest::FactoryReset);
        }
    }

    None
}

fn virtual_value_ms(device_data: &DeviceData, name: &str) -> i64 {
    Path::parse(name)
        .ok()
        .and_then(|p| device_data.paths.get(&p))
        .and_then(|p| device_data.attributes.get(&p))
        .and_then(|a| a.value.as_ref())
        .and_then(|(_, v)| crate::sync::epoch_ms(v))
        .unwrap_or(0)
}

fn strip_datetime_millis(literal: &Json) -> Json {
    match literal {
        Json::String(s) => match s.parse::<DateTime<Utc>>() {
            Ok(d) => Json::String(d.to_rfc3339_opts(SecondsFormat::Secs, true)),
            Err(_) => literal.clone(),
        },
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declarations::Declaration;
    use crate::device::Attributes;
    use crate::sync::{run_declarations, SyncState};
    use std::collections::BTreeSet;

    fn path(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    fn seed_leaf(dd: &mut DeviceData, p: &str, ts: i64, value: ParameterValue) {
        let mut to_clear = Vec::new();
        device::set(
            dd,
            path(p),
            ts,
            Some(Attributes {
                object: Some((ts, false)),
                writable: Some((ts, true)),
                value: Some((ts, value)),
                ..Default::default()
            }),
            &mut to_clear,
        );
    }

    fn plan_get(dd: &mut DeviceData, ss: &mut SyncState) -> Option<AcsRequest> {
        generate_get_rpc_request(dd, ss, &SessionConfig::default())
    }

    #[test]
    fn test_fresh_tree_yields_next_level_gpn() {
        let mut dd = DeviceData::new();
        let mut ss = SyncState::default();
        run_declarations(
            &mut dd,
            &mut ss,
            &[Declaration::fresh_value(
                path("InternetGatewayDevice.DeviceInfo.SoftwareVersion"),
                100,
            )],
            100,
            &BTreeSet::new(),
        );
        let req = plan_get(&mut dd, &mut ss).unwrap();
        assert_eq!(
            req,
            AcsRequest::GetParameterNames {
                parameter_path: "InternetGatewayDevice.".to_string(),
                next_level: true,
            }
        );
    }

    #[test]
    fn test_gpv_only_over_known_leaves() {
        let mut dd = DeviceData::new();
        let mut ss = SyncState::default();
        seed_leaf(&mut dd, "A.B", 50, ParameterValue::string("x"));
        let interned = dd.paths.get(&path("A.B")).unwrap();
        ss.refresh_attributes.value.insert(interned, 100);

        // An unknown path rides along but must not be emitted.
        let unknown = dd.paths.add(path("A.C"));
        ss.refresh_attributes.value.insert(unknown, 100);

        let req = plan_get(&mut dd, &mut ss);
        // Promotion queued nothing (no exist/object entries), so this is GPV.
        match req.unwrap() {
            AcsRequest::GetParameterValues {
                parameter_names, ..
            } => assert_eq!(parameter_names, vec!["A.B"]),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_spv_suppresses_no_op_writes() {
        let mut dd = DeviceData::new();
        let mut ss = SyncState::default();
        seed_leaf(&mut dd, "P", 50, ParameterValue::string("1.0"));
        let p = dd.paths.get(&path("P")).unwrap();
        ss.spv.insert(p.clone(), ParameterValue::string("1.0"));

        let req = generate_set_rpc_request(&mut dd, &mut ss, &SessionConfig::default(), 100);
        assert_eq!(req, None);
        assert!(ss.spv.is_empty());

        ss.spv.insert(p, ParameterValue::string("1.1"));
        let req = generate_set_rpc_request(&mut dd, &mut ss, &SessionConfig::default(), 100);
        match req.unwrap() {
            AcsRequest::SetParameterValues { parameter_list, .. } => {
                assert_eq!(parameter_list.len(), 1);
                assert_eq!(parameter_list[0].name, "P");
                assert_eq!(parameter_list[0].value, ParameterValue::string("1.1"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_spv_coerces_to_stored_type() {
        let mut dd = DeviceData::new();
        let mut ss = SyncState::default();
        seed_leaf(&mut dd, "P", 50, ParameterValue::new(5, XsdType::Int));
        let p = dd.paths.get(&path("P")).unwrap();
        ss.spv.insert(p, ParameterValue::string("42"));

        let req = generate_set_rpc_request(&mut dd, &mut ss, &SessionConfig::default(), 100);
        match req.unwrap() {
            AcsRequest::SetParameterValues { parameter_list, .. } => {
                assert_eq!(parameter_list[0].value, ParameterValue::new(42, XsdType::Int));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_delete_object_requires_writable() {
        let mut dd = DeviceData::new();
        let mut ss = SyncState::default();
        let mut to_clear = Vec::new();
        device::set(
            &mut dd,
            path("IF.3"),
            50,
            Some(Attributes {
                object: Some((50, true)),
                writable: Some((50, false)),
                ..Default::default()
            }),
            &mut to_clear,
        );
        let parent = dd.paths.add(path("IF"));
        let victim = dd.paths.get(&path("IF.3")).unwrap();
        ss.instances_to_delete
            .entry(parent)
            .or_default()
            .insert(victim);

        let req = generate_set_rpc_request(&mut dd, &mut ss, &SessionConfig::default(), 100);
        assert_eq!(req, None);

        let mut cfg = SessionConfig::default();
        cfg.skip_writable_check = true;
        let req = generate_set_rpc_request(&mut dd, &mut ss, &cfg, 100);
        assert_eq!(
            req,
            Some(AcsRequest::DeleteObject {
                object_name: "IF.3.".to_string()
            })
        );
    }

    #[test]
    fn test_add_object_carries_keys_and_continuation() {
        let mut dd = DeviceData::new();
        let mut ss = SyncState::default();
        let mut to_clear = Vec::new();
        device::set(
            &mut dd,
            path("IF"),
            50,
            Some(Attributes {
                object: Some((50, true)),
                writable: Some((50, true)),
                ..Default::default()
            }),
            &mut to_clear,
        );
        let parent = dd.paths.get(&path("IF")).unwrap();
        let mut keys = crate::instance_set::InstanceKeys::new();
        keys.insert("Name".to_string(), "wan0".to_string());
        ss.instances_to_create.entry(parent).or_default().add(keys);

        let req = generate_set_rpc_request(&mut dd, &mut ss, &SessionConfig::default(), 100);
        match req.unwrap() {
            AcsRequest::AddObject {
                object_name,
                instance_values,
                next,
            } => {
                assert_eq!(object_name, "IF.");
                assert_eq!(instance_values.get("Name").map(String::as_str), Some("wan0"));
                assert_eq!(next, Some(Continuation::GetInstanceKeys));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(ss.instances_to_create.is_empty());
    }

    #[test]
    fn test_download_reads_sibling_parameters() {
        let mut dd = DeviceData::new();
        let mut ss = SyncState::default();
        let mut to_clear = Vec::new();
        device::set(
            &mut dd,
            path("Downloads.1"),
            50,
            Some(Attributes {
                object: Some((50, true)),
                ..Default::default()
            }),
            &mut to_clear,
        );
        seed_leaf(
            &mut dd,
            "Downloads.1.FileType",
            50,
            ParameterValue::string("1 Firmware Upgrade Image"),
        );
        seed_leaf(
            &mut dd,
            "Downloads.1.FileName",
            50,
            ParameterValue::string("http://acs/fw.bin"),
        );
        let p = dd.paths.add(path("Downloads.1.Download"));
        ss.downloads_download.insert(p, 90);

        let req = generate_set_rpc_request(&mut dd, &mut ss, &SessionConfig::default(), 100);
        match req.unwrap() {
            AcsRequest::Download {
                instance,
                file_type,
                file_name,
                target_file_name,
                command_key,
            } => {
                assert_eq!(instance, "Downloads.1");
                assert_eq!(file_type, "1 Firmware Upgrade Image");
                assert_eq!(file_name, "http://acs/fw.bin");
                assert_eq!(target_file_name, "");
                assert!(!command_key.is_empty());
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(ss.downloads_download.is_empty());
    }

    #[test]
    fn test_reboot_consumed_after_emission() {
        let mut dd = DeviceData::new();
        let mut ss = SyncState::default();
        ss.reboot = Some(100);
        let req = generate_set_rpc_request(&mut dd, &mut ss, &SessionConfig::default(), 100);
        assert_eq!(req, Some(AcsRequest::Reboot));
        assert_eq!(ss.reboot, None);
        let req = generate_set_rpc_request(&mut dd, &mut ss, &SessionConfig::default(), 100);
        assert_eq!(req, None);
    }

    #[test]
    fn test_compare_access_lists_is_order_sensitive() {
        let a = vec!["Subscriber".to_string()];
        let b = vec!["Subscriber".to_string()];
        assert!(compare_access_lists(&a, &b));
        let c = vec!["Subscriber".to_string(), "X".to_string()];
        assert!(!compare_access_lists(&a, &c));
    }
}
