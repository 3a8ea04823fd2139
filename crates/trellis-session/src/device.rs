// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The device data model and its mutation helpers.
//!
//! [`DeviceData`] aggregates the interning [`PathSet`], the two versioned
//! maps (path timestamps, path attributes), the trackers and the change set.
//! All writes funnel through [`set`] and [`clear`] so the invariants hold:
//! attribute timestamps only move forward, object transitions sweep the
//! subtree below, and every path carrying attributes is interned.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use thiserror::Error;
use trellis_protocol::{ParameterValue, XsdType};

use crate::declarations::{AttrTimestamps, Clear, Declaration};
use crate::path::{Path, Segment};
use crate::path_set::PathSet;
use crate::versioned_map::VersionedMap;

/// The attribute kinds a path may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttributeName {
    /// Interior (object) vs leaf (parameter).
    Object,
    /// Writability.
    Writable,
    /// The parameter value.
    Value,
    /// Notification level.
    Notification,
    /// Access list.
    AccessList,
}

/// Attributes stored at a path. Each kind carries its own timestamp: the
/// moment the engine last learned it from the device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attributes {
    /// `(timestamp, is_object)`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<(i64, bool)>,
    /// `(timestamp, is_writable)`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writable: Option<(i64, bool)>,
    /// `(timestamp, value)`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<(i64, ParameterValue)>,
    /// `(timestamp, notification)`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification: Option<(i64, u8)>,
    /// `(timestamp, access_list)`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_list: Option<(i64, Vec<String>)>,
}

impl Attributes {
    /// True when no attribute is present.
    pub fn is_empty(&self) -> bool {
        self.object.is_none()
            && self.writable.is_none()
            && self.value.is_none()
            && self.notification.is_none()
            && self.access_list.is_none()
    }

    /// The timestamp of one attribute kind.
    pub fn timestamp_of(&self, name: AttributeName) -> Option<i64> {
        match name {
            AttributeName::Object => self.object.map(|(t, _)| t),
            AttributeName::Writable => self.writable.map(|(t, _)| t),
            AttributeName::Value => self.value.as_ref().map(|(t, _)| *t),
            AttributeName::Notification => self.notification.map(|(t, _)| t),
            AttributeName::AccessList => self.access_list.as_ref().map(|(t, _)| *t),
        }
    }

    /// Shorthand: the object flag, when known.
    pub fn is_object(&self) -> Option<bool> {
        self.object.map(|(_, o)| o)
    }

    /// Shorthand: the writable flag, when known.
    pub fn is_writable(&self) -> Option<bool> {
        self.writable.map(|(_, w)| w)
    }
}

/// The in-memory model of one device.
#[derive(Debug, Default)]
pub struct DeviceData {
    /// Interning trie over all paths the session has seen.
    pub paths: PathSet,
    /// Path → freshness timestamp. Wildcard paths record when a subtree
    /// enumeration happened.
    pub timestamps: VersionedMap<Arc<Path>, i64>,
    /// Path → attributes.
    pub attributes: VersionedMap<Arc<Path>, Attributes>,
    /// Path → marker → count. Markers name engine facts derived from this
    /// path (e.g. `prerequisite` for alias-key reads).
    pub trackers: HashMap<Arc<Path>, BTreeMap<String, u32>>,
    /// Markers whose tracked paths got invalidated since last cleared.
    pub changes: BTreeSet<String>,
}

impl DeviceData {
    /// A fresh, empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move both versioned maps to `revision`.
    pub fn set_revision(&mut self, revision: u32) {
        self.timestamps.set_revision(revision);
        self.attributes.set_revision(revision);
    }
}

/// Merge attributes into the model at `path`.
///
/// With `attributes == None` the path is being *invalidated*: the timestamp
/// is recorded (this is how wildcard enumeration times are kept) and a sweep
/// of everything at or below the path older than `timestamp` is scheduled
/// onto `to_clear`. The caller drains `to_clear` through [`clear`].
pub fn set(
    device_data: &mut DeviceData,
    path: Path,
    timestamp: i64,
    attributes: Option<Attributes>,
    to_clear: &mut Vec<Clear>,
) -> Arc<Path> {
    let path = device_data.paths.add(path);

    let Some(new_attrs) = attributes else {
        device_data.timestamps.set(path.clone(), timestamp);
        to_clear.push(Clear {
            path: (*path).clone(),
            timestamp,
            attr_timestamps: None,
        });
        return path;
    };

    let current = device_data.attributes.get(&path).cloned();
    let mut merged = current.clone().unwrap_or_default();

    macro_rules! merge_attr {
        ($field:ident) => {
            if let Some((ts, v)) = new_attrs.$field.clone() {
                let stale = matches!(&merged.$field, Some((cur_ts, _)) if *cur_ts > ts);
                if !stale {
                    merged.$field = Some((ts, v));
                }
            }
        };
    }
    merge_attr!(object);
    merge_attr!(writable);
    merge_attr!(value);
    merge_attr!(notification);
    merge_attr!(access_list);

    // A change of object-ness invalidates everything below: a leaf that
    // became an object has no known children, an object that became a leaf
    // has none at all.
    let old_object = current.as_ref().and_then(Attributes::is_object);
    let new_object = merged.is_object();
    if let (Some(old), Some(new)) = (old_object, new_object) {
        if old != new {
            to_clear.push(Clear {
                path: path.child(Segment::Wildcard),
                timestamp,
                attr_timestamps: None,
            });
        }
    }

    let ts = device_data
        .timestamps
        .get(&path)
        .copied()
        .unwrap_or(i64::MIN)
        .max(timestamp);
    device_data.timestamps.set(path.clone(), ts);
    device_data.attributes.set(path.clone(), merged);
    path
}

/// Sweep the model at and below `path`.
///
/// With no `attr_timestamps`, whole paths whose timestamp is at or below
/// `timestamp` are dropped. With `attr_timestamps`, only the named attribute
/// kinds are dropped, each against its own threshold. Trackers on anything
/// touched land in `changes`.
pub fn clear(
    device_data: &mut DeviceData,
    path: &Path,
    timestamp: i64,
    attr_timestamps: Option<&AttrTimestamps>,
) {
    let matched = device_data.paths.find(path, true, true, 99);
    for p in matched {
        let mut touched = false;

        match attr_timestamps {
            None => {
                // The pattern itself, when it carries no attributes, is the
                // enumeration marker being refreshed - not sweep material.
                if *p == *path && device_data.attributes.get(&p).is_none() {
                    continue;
                }
                let path_ts = device_data.timestamps.get(&p).copied();
                let attr_ts = device_data
                    .attributes
                    .get(&p)
                    .map(|a| {
                        [
                            a.timestamp_of(AttributeName::Object),
                            a.timestamp_of(AttributeName::Writable),
                            a.timestamp_of(AttributeName::Value),
                            a.timestamp_of(AttributeName::Notification),
                            a.timestamp_of(AttributeName::AccessList),
                        ]
                        .into_iter()
                        .flatten()
                        .max()
                    })
                    .unwrap_or(None);
                let newest = path_ts.into_iter().chain(attr_ts).max();
                if let Some(newest) = newest {
                    if newest <= timestamp {
                        device_data.timestamps.delete(&p);
                        device_data.attributes.delete(&p);
                        touched = true;
                    }
                }
            }
            Some(thresholds) => {
                if let Some(current) = device_data.attributes.get(&p).cloned() {
                    let mut updated = current.clone();
                    macro_rules! drop_attr {
                        ($field:ident, $threshold:expr) => {
                            if let (Some(limit), Some((ts, _))) = ($threshold, &updated.$field) {
                                if *ts <= limit {
                                    updated.$field = None;
                                }
                            }
                        };
                    }
                    drop_attr!(object, thresholds.object);
                    drop_attr!(writable, thresholds.writable);
                    drop_attr!(value, thresholds.value);
                    drop_attr!(notification, thresholds.notification);
                    drop_attr!(access_list, thresholds.access_list);

                    if updated != current {
                        touched = true;
                        if updated.is_empty() {
                            device_data.attributes.delete(&p);
                        } else {
                            device_data.attributes.set(p.clone(), updated);
                        }
                    }
                }
                if timestamp > 0 {
                    if let Some(ts) = device_data.timestamps.get(&p).copied() {
                        if ts <= timestamp {
                            device_data.timestamps.delete(&p);
                            touched = true;
                        }
                    }
                }
            }
        }

        if touched {
            if let Some(markers) = device_data.trackers.remove(&p) {
                for marker in markers.into_keys() {
                    device_data.changes.insert(marker);
                }
            }
        }
    }
}

/// Attach a tracker marker to a path.
pub fn track(device_data: &mut DeviceData, path: Arc<Path>, marker: &str) {
    *device_data
        .trackers
        .entry(path)
        .or_default()
        .entry(marker.to_string())
        .or_insert(0) += 1;
}

/// Remove every tracker with this marker and clear its change flag.
pub fn clear_tracker(device_data: &mut DeviceData, marker: &str) {
    device_data.trackers.retain(|_, markers| {
        markers.remove(marker);
        !markers.is_empty()
    });
    device_data.changes.remove(marker);
}

/// Expand a wildcarded/aliased pattern into the concrete paths currently
/// present in the model.
pub fn unpack(device_data: &DeviceData, pattern: &Path) -> Vec<Arc<Path>> {
    let mut out: Vec<Arc<Path>> = device_data
        .paths
        .find(pattern, false, true, pattern.len())
        .into_iter()
        .filter(|p| p.is_concrete() && device_data.attributes.get(p).is_some())
        .filter(|p| alias_constraints_hold(device_data, pattern, p))
        .collect();
    out.sort();
    out
}

fn alias_constraints_hold(device_data: &DeviceData, pattern: &Path, concrete: &Path) -> bool {
    for (i, seg) in pattern.segments().iter().enumerate() {
        let Segment::Alias(pairs) = seg else {
            continue;
        };
        let base = concrete.slice(0, i + 1);
        for (sub, expected) in pairs {
            let key_path = base.concat(sub);
            let Some(interned) = device_data.paths.get(&key_path) else {
                return false;
            };
            let actual = device_data
                .attributes
                .get(&interned)
                .and_then(|a| a.value.as_ref().map(|(_, v)| v.literal_string()));
            if actual.as_deref() != Some(expected.as_str()) {
                return false;
            }
        }
    }
    true
}

/// The extra reads an aliased path needs before it can be resolved: for each
/// alias constraint, the key parameter of *every* sibling instance must be
/// known and fresh.
pub fn get_alias_declarations(path: &Path, timestamp: i64) -> Vec<Declaration> {
    let mut out = Vec::new();
    collect_alias_declarations(path, timestamp, &mut out);
    out
}

fn collect_alias_declarations(path: &Path, timestamp: i64, out: &mut Vec<Declaration>) {
    for (i, seg) in path.segments().iter().enumerate() {
        let Segment::Alias(pairs) = seg else {
            continue;
        };
        for (sub, _) in pairs {
            let key_path = path.slice(0, i).child(Segment::Wildcard).concat(sub);
            out.push(Declaration::fresh_value(key_path.clone(), timestamp));
            // The prefix may itself contain aliases; their keys are needed
            // too. Alias positions strictly decrease, so this terminates.
            collect_alias_declarations(&key_path, timestamp, out);
        }
    }
}

/// Errors from [`sanitize_parameter_value`].
#[derive(Debug, Clone, Error)]
pub enum SanitizeError {
    /// The literal cannot represent the declared type.
    #[error("cannot coerce {literal} to {xsd_type}")]
    Mismatch {
        /// The offending literal, rendered.
        literal: String,
        /// The declared type.
        xsd_type: XsdType,
    },
}

fn mismatch(literal: &Json, xsd_type: XsdType) -> SanitizeError {
    SanitizeError::Mismatch {
        literal: literal.to_string(),
        xsd_type,
    }
}

/// Coerce a value's literal into canonical form for its XSD type.
///
/// Coercions are explicit and conservative; a literal that cannot represent
/// the type is an error, never a silent stringification.
pub fn sanitize_parameter_value(value: &ParameterValue) -> Result<ParameterValue, SanitizeError> {
    let lit = &value.literal;
    let sanitized = match value.xsd_type {
        XsdType::String => match lit {
            Json::String(_) => lit.clone(),
            other => return Err(mismatch(other, XsdType::String)),
        },
        XsdType::Int => match lit {
            Json::Number(n) if n.is_i64() => Json::from(n.as_i64().unwrap()),
            Json::String(s) => match s.trim().parse::<i64>() {
                Ok(n) => Json::from(n),
                Err(_) => return Err(mismatch(lit, XsdType::Int)),
            },
            other => return Err(mismatch(other, XsdType::Int)),
        },
        XsdType::UnsignedInt => match lit {
            Json::Number(n) if n.is_u64() => Json::from(n.as_u64().unwrap()),
            Json::String(s) => match s.trim().parse::<u64>() {
                Ok(n) => Json::from(n),
                Err(_) => return Err(mismatch(lit, XsdType::UnsignedInt)),
            },
            other => return Err(mismatch(other, XsdType::UnsignedInt)),
        },
        XsdType::Boolean => match lit {
            Json::Bool(_) => lit.clone(),
            Json::Number(n) if n.as_i64() == Some(0) => Json::Bool(false),
            Json::Number(n) if n.as_i64() == Some(1) => Json::Bool(true),
            Json::String(s) => match s.trim() {
                "true" | "1" => Json::Bool(true),
                "false" | "0" => Json::Bool(false),
                _ => return Err(mismatch(lit, XsdType::Boolean)),
            },
            other => return Err(mismatch(other, XsdType::Boolean)),
        },
        XsdType::DateTime => {
            let parsed: DateTime<Utc> = match lit {
                Json::String(s) => s
                    .parse::<DateTime<Utc>>()
                    .map_err(|_| mismatch(lit, XsdType::DateTime))?,
                Json::Number(n) => {
                    let ms = n.as_i64().ok_or_else(|| mismatch(lit, XsdType::DateTime))?;
                    DateTime::<Utc>::from_timestamp_millis(ms)
                        .ok_or_else(|| mismatch(lit, XsdType::DateTime))?
                }
                other => return Err(mismatch(other, XsdType::DateTime)),
            };
            Json::String(parsed.to_rfc3339_opts(SecondsFormat::Millis, true))
        }
        XsdType::Base64 => match lit {
            Json::String(s) => {
                base64::engine::general_purpose::STANDARD
                    .decode(s.as_bytes())
                    .map_err(|_| mismatch(lit, XsdType::Base64))?;
                lit.clone()
            }
            other => return Err(mismatch(other, XsdType::Base64)),
        },
        XsdType::HexBinary => match lit {
            Json::String(s)
                if s.len() % 2 == 0 && s.bytes().all(|b| b.is_ascii_hexdigit()) =>
            {
                lit.clone()
            }
            other => return Err(mismatch(other, XsdType::HexBinary)),
        },
    };
    Ok(ParameterValue {
        literal: sanitized,
        xsd_type: value.xsd_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    fn object_attrs(ts: i64, is_object: bool) -> Attributes {
        Attributes {
            object: Some((ts, is_object)),
            ..Default::default()
        }
    }

    fn value_attrs(ts: i64, v: &str) -> Attributes {
        Attributes {
            object: Some((ts, false)),
            value: Some((ts, ParameterValue::string(v))),
            ..Default::default()
        }
    }

    #[test]
    fn test_set_merges_monotonically() {
        let mut dd = DeviceData::new();
        let mut to_clear = Vec::new();
        set(&mut dd, path("A.B"), 10, Some(value_attrs(10, "x")), &mut to_clear);
        // An older write must not clobber.
        set(&mut dd, path("A.B"), 5, Some(value_attrs(5, "old")), &mut to_clear);

        let p = dd.paths.get(&path("A.B")).unwrap();
        let attrs = dd.attributes.get(&p).unwrap();
        assert_eq!(attrs.value.as_ref().unwrap().1.literal, json!("x"));
        assert_eq!(*dd.timestamps.get(&p).unwrap(), 10);
        assert!(to_clear.is_empty());
    }

    #[test]
    fn test_set_object_transition_schedules_subtree_clear() {
        let mut dd = DeviceData::new();
        let mut to_clear = Vec::new();
        set(&mut dd, path("A"), 1, Some(object_attrs(1, true)), &mut to_clear);
        set(&mut dd, path("A.B"), 1, Some(value_attrs(1, "x")), &mut to_clear);
        assert!(to_clear.is_empty());

        set(&mut dd, path("A"), 2, Some(object_attrs(2, false)), &mut to_clear);
        assert_eq!(to_clear.len(), 1);
        assert_eq!(to_clear[0].path.to_string(), "A.*");

        let c = to_clear.remove(0);
        clear(&mut dd, &c.path, c.timestamp, c.attr_timestamps.as_ref());
        assert!(dd.paths.get(&path("A.B")).is_none() || {
            let p = dd.paths.get(&path("A.B")).unwrap();
            dd.attributes.get(&p).is_none()
        });
    }

    #[test]
    fn test_set_invalidation_sweeps_stale_children() {
        let mut dd = DeviceData::new();
        let mut to_clear = Vec::new();
        set(&mut dd, path("A.1"), 10, Some(value_attrs(10, "a")), &mut to_clear);
        set(&mut dd, path("A.2"), 20, Some(value_attrs(20, "b")), &mut to_clear);

        // Enumeration at t=15: the t=10 child is stale, the t=20 child stays.
        set(&mut dd, path("A.*"), 15, None, &mut to_clear);
        let c = to_clear.remove(0);
        clear(&mut dd, &c.path, c.timestamp, None);

        let p1 = dd.paths.get(&path("A.1")).unwrap();
        let p2 = dd.paths.get(&path("A.2")).unwrap();
        assert!(dd.attributes.get(&p1).is_none());
        assert!(dd.attributes.get(&p2).is_some());
        // The wildcard enumeration time is recorded.
        let pw = dd.paths.get(&path("A.*")).unwrap();
        assert_eq!(*dd.timestamps.get(&pw).unwrap(), 15);
    }

    #[test]
    fn test_clear_attribute_level() {
        let mut dd = DeviceData::new();
        let mut to_clear = Vec::new();
        set(&mut dd, path("A.B"), 10, Some(value_attrs(10, "x")), &mut to_clear);

        clear(
            &mut dd,
            &path("A.B"),
            0,
            Some(&AttrTimestamps {
                value: Some(10),
                ..Default::default()
            }),
        );
        let p = dd.paths.get(&path("A.B")).unwrap();
        let attrs = dd.attributes.get(&p).unwrap();
        assert!(attrs.value.is_none());
        assert!(attrs.object.is_some());
    }

    #[test]
    fn test_clear_fires_trackers() {
        let mut dd = DeviceData::new();
        let mut to_clear = Vec::new();
        let p = set(&mut dd, path("A.B"), 10, Some(value_attrs(10, "x")), &mut to_clear);
        track(&mut dd, p, "prerequisite");

        clear(&mut dd, &path("A.B"), 10, None);
        assert!(dd.changes.contains("prerequisite"));

        clear_tracker(&mut dd, "prerequisite");
        assert!(dd.changes.is_empty());
        assert!(dd.trackers.is_empty());
    }

    #[test]
    fn test_unpack_wildcard() {
        let mut dd = DeviceData::new();
        let mut to_clear = Vec::new();
        set(&mut dd, path("A.1.N"), 1, Some(value_attrs(1, "x")), &mut to_clear);
        set(&mut dd, path("A.2.N"), 1, Some(value_attrs(1, "y")), &mut to_clear);

        let found = unpack(&dd, &path("A.*.N"));
        let names: Vec<String> = found.iter().map(|p| p.to_string()).collect();
        assert_eq!(names, vec!["A.1.N", "A.2.N"]);
    }

    #[test]
    fn test_unpack_alias_filters_on_key_values() {
        let mut dd = DeviceData::new();
        let mut to_clear = Vec::new();
        set(&mut dd, path("IF.1"), 1, Some(object_attrs(1, true)), &mut to_clear);
        set(&mut dd, path("IF.2"), 1, Some(object_attrs(1, true)), &mut to_clear);
        set(&mut dd, path("IF.1.Name"), 1, Some(value_attrs(1, "wan0")), &mut to_clear);
        set(&mut dd, path("IF.2.Name"), 1, Some(value_attrs(1, "lan0")), &mut to_clear);

        let found = unpack(&dd, &path("IF.[Name=wan0]"));
        let names: Vec<String> = found.iter().map(|p| p.to_string()).collect();
        assert_eq!(names, vec!["IF.1"]);
    }

    #[test]
    fn test_get_alias_declarations() {
        let decls = get_alias_declarations(&path("IF.[Name=wan0].Enable"), 99);
        assert_eq!(decls.len(), 1);
        assert_eq!(decls[0].path.to_string(), "IF.*.Name");
        assert_eq!(decls[0].path_get, Some(99));
        assert_eq!(decls[0].attr_get.unwrap().value, Some(99));
    }

    #[test]
    fn test_sanitize_happy_paths() {
        let v = sanitize_parameter_value(&ParameterValue::new("42", XsdType::Int)).unwrap();
        assert_eq!(v.literal, json!(42));

        let v = sanitize_parameter_value(&ParameterValue::new("1", XsdType::Boolean)).unwrap();
        assert_eq!(v.literal, json!(true));

        let v = sanitize_parameter_value(&ParameterValue::new(
            1_700_000_000_000i64,
            XsdType::DateTime,
        ))
        .unwrap();
        assert_eq!(v.literal, json!("2023-11-14T22:13:20.000Z"));

        let v = sanitize_parameter_value(&ParameterValue::new("aGk=", XsdType::Base64)).unwrap();
        assert_eq!(v.literal, json!("aGk="));

        let v = sanitize_parameter_value(&ParameterValue::new("0aff", XsdType::HexBinary)).unwrap();
        assert_eq!(v.literal, json!("0aff"));
    }

    #[test]
    fn test_sanitize_rejects_mismatches() {
        assert!(sanitize_parameter_value(&ParameterValue::new(42, XsdType::String)).is_err());
        assert!(sanitize_parameter_value(&ParameterValue::new("x", XsdType::Int)).is_err());
        assert!(sanitize_parameter_value(&ParameterValue::new("-1", XsdType::UnsignedInt)).is_err());
        assert!(sanitize_parameter_value(&ParameterValue::new("maybe", XsdType::Boolean)).is_err());
        assert!(sanitize_parameter_value(&ParameterValue::new("???", XsdType::Base64)).is_err());
        assert!(sanitize_parameter_value(&ParameterValue::new("abc", XsdType::HexBinary)).is_err());
    }
}
