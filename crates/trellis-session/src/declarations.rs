// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The declaration IR.
//!
//! Provisions and virtual parameters do not mutate anything directly; they
//! emit *declarations* - assertions over a path: "was refreshed no earlier
//! than T", "has between `min` and `max` instances", "has this value". The
//! planner owns turning these into RPCs. Scripts hand declarations across
//! the sandbox boundary as JSON; [`Declaration::from_json`] is the validating
//! gate, so malformed script output faults instead of corrupting the plan.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use trellis_protocol::{ParameterValue, XsdType};

use crate::path::{Path, PathParseError};

/// Per-attribute freshness requirements, epoch ms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttrTimestamps {
    /// The `object` attribute (leaf vs interior).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<i64>,
    /// The `writable` attribute.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writable: Option<i64>,
    /// The parameter value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<i64>,
    /// The notification attribute.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification: Option<i64>,
    /// The access list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_list: Option<i64>,
}

impl AttrTimestamps {
    /// True when no attribute is requested.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Merge, keeping the later timestamp per attribute.
    pub fn merge_max(&mut self, other: &AttrTimestamps) {
        fn mx(a: &mut Option<i64>, b: Option<i64>) {
            *a = match (*a, b) {
                (Some(x), Some(y)) => Some(x.max(y)),
                (x, y) => x.or(y),
            };
        }
        mx(&mut self.object, other.object);
        mx(&mut self.writable, other.writable);
        mx(&mut self.value, other.value);
        mx(&mut self.notification, other.notification);
        mx(&mut self.access_list, other.access_list);
    }

    /// Cap every requested timestamp at `limit`.
    pub fn cap(&mut self, limit: i64) {
        for t in [
            &mut self.object,
            &mut self.writable,
            &mut self.value,
            &mut self.notification,
            &mut self.access_list,
        ] {
            if let Some(v) = t {
                *v = (*v).min(limit);
            }
        }
    }
}

/// Desired attribute values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttrValues {
    /// Desired parameter value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<ParameterValue>,
    /// Desired notification level 0..=6.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification: Option<u8>,
    /// Desired access list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_list: Option<Vec<String>>,
    /// Requested writability; only meaningful on virtual parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writable: Option<bool>,
}

impl AttrValues {
    /// True when nothing is being set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Merge, `other` winning where both set an attribute.
    pub fn merge_over(&mut self, other: &AttrValues) {
        if other.value.is_some() {
            self.value = other.value.clone();
        }
        if other.notification.is_some() {
            self.notification = other.notification;
        }
        if other.access_list.is_some() {
            self.access_list = other.access_list.clone();
        }
        if other.writable.is_some() {
            self.writable = other.writable;
        }
    }
}

/// Instance cardinality bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathSetBounds {
    /// Minimum number of matching instances.
    pub min: u32,
    /// Maximum number of matching instances.
    pub max: u32,
}

impl PathSetBounds {
    /// An exact count.
    pub fn exactly(n: u32) -> Self {
        Self { min: n, max: n }
    }
}

/// One declaration, as emitted by a script or a builtin provision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Declaration {
    /// Target path; may contain wildcards and aliases.
    pub path: Path,
    /// The path's own existence must have been confirmed at or after this.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_get: Option<i64>,
    /// Instance cardinality requirement.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_set: Option<PathSetBounds>,
    /// Attribute freshness requirements.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attr_get: Option<AttrTimestamps>,
    /// Attribute value requirements.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attr_set: Option<AttrValues>,
    /// Deferred writes only take effect once the whole provision batch is
    /// done, or a previous round already recorded the write.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub defer: bool,
}

impl Declaration {
    /// A bare existence declaration.
    pub fn exists(path: Path, timestamp: i64) -> Self {
        Self {
            path,
            path_get: Some(timestamp),
            path_set: None,
            attr_get: None,
            attr_set: None,
            defer: false,
        }
    }

    /// Declare a refreshed value read.
    pub fn fresh_value(path: Path, timestamp: i64) -> Self {
        Self {
            path,
            path_get: Some(timestamp),
            path_set: None,
            attr_get: Some(AttrTimestamps {
                value: Some(timestamp),
                ..Default::default()
            }),
            attr_set: None,
            defer: false,
        }
    }

    /// Declare a value write.
    pub fn set_value(path: Path, timestamp: i64, value: ParameterValue) -> Self {
        Self {
            path,
            path_get: Some(timestamp),
            path_set: None,
            attr_get: Some(AttrTimestamps {
                value: Some(timestamp),
                ..Default::default()
            }),
            attr_set: Some(AttrValues {
                value: Some(value),
                ..Default::default()
            }),
            defer: false,
        }
    }
}

/// A clear directive emitted by a script: invalidate state so it gets
/// re-discovered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clear {
    /// Target pattern; descendants are swept through wildcards.
    pub path: Path,
    /// Path-level invalidation threshold; entries at or below it go.
    pub timestamp: i64,
    /// Per-attribute thresholds, when only some attributes are invalidated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attr_timestamps: Option<AttrTimestamps>,
}

/// Errors validating script-emitted declarations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeclarationError {
    /// The path did not parse.
    #[error("invalid declaration path: {0}")]
    Path(#[from] PathParseError),

    /// A field had the wrong JSON shape.
    #[error("invalid declaration field {field}: {reason}")]
    Field {
        /// Offending field name.
        field: &'static str,
        /// What was wrong with it.
        reason: String,
    },
}

fn field_err(field: &'static str, reason: impl fmt::Display) -> DeclarationError {
    DeclarationError::Field {
        field,
        reason: reason.to_string(),
    }
}

impl Declaration {
    /// Validate one script-emitted declaration.
    ///
    /// Expected shape (all fields but `path` optional):
    ///
    /// ```json
    /// {"path": "A.B.*", "pathGet": 1, "pathSet": [1, 2],
    ///  "attrGet": {"value": 1}, "attrSet": {"value": ["x", "xsd:string"]},
    ///  "defer": true}
    /// ```
    pub fn from_json(json: &Json) -> Result<Self, DeclarationError> {
        let obj = json
            .as_object()
            .ok_or_else(|| field_err("declaration", "not an object"))?;

        let path_str = obj
            .get("path")
            .and_then(Json::as_str)
            .ok_or_else(|| field_err("path", "missing or not a string"))?;
        let path = Path::parse(path_str)?;

        let path_get = match obj.get("pathGet") {
            None | Some(Json::Null) => None,
            Some(v) => Some(
                v.as_i64()
                    .ok_or_else(|| field_err("pathGet", "not an integer"))?,
            ),
        };

        let path_set = match obj.get("pathSet") {
            None | Some(Json::Null) => None,
            Some(Json::Number(n)) => {
                let n = n
                    .as_u64()
                    .ok_or_else(|| field_err("pathSet", "negative count"))?;
                Some(PathSetBounds::exactly(n as u32))
            }
            Some(Json::Array(arr)) if arr.len() == 2 => {
                let min = arr[0]
                    .as_u64()
                    .ok_or_else(|| field_err("pathSet", "min not an integer"))?;
                let max = arr[1]
                    .as_u64()
                    .ok_or_else(|| field_err("pathSet", "max not an integer"))?;
                Some(PathSetBounds {
                    min: min as u32,
                    max: max as u32,
                })
            }
            Some(other) => {
                return Err(field_err(
                    "pathSet",
                    format!("expected count or [min, max], got {}", other),
                ));
            }
        };

        let attr_get = match obj.get("attrGet") {
            None | Some(Json::Null) => None,
            Some(v) => Some(parse_attr_timestamps(v)?),
        };

        let attr_set = match obj.get("attrSet") {
            None | Some(Json::Null) => None,
            Some(v) => Some(parse_attr_values(v)?),
        };

        let defer = obj.get("defer").and_then(Json::as_bool).unwrap_or(false);

        Ok(Self {
            path,
            path_get,
            path_set,
            attr_get,
            attr_set,
            defer,
        })
    }
}

fn parse_attr_timestamps(json: &Json) -> Result<AttrTimestamps, DeclarationError> {
    let obj = json
        .as_object()
        .ok_or_else(|| field_err("attrGet", "not an object"))?;
    let mut out = AttrTimestamps::default();
    for (key, v) in obj {
        let ts = v
            .as_i64()
            .ok_or_else(|| field_err("attrGet", format!("{} not an integer", key)))?;
        match key.as_str() {
            "object" => out.object = Some(ts),
            "writable" => out.writable = Some(ts),
            "value" => out.value = Some(ts),
            "notification" => out.notification = Some(ts),
            "accessList" => out.access_list = Some(ts),
            other => return Err(field_err("attrGet", format!("unknown attribute {}", other))),
        }
    }
    Ok(out)
}

fn parse_attr_values(json: &Json) -> Result<AttrValues, DeclarationError> {
    let obj = json
        .as_object()
        .ok_or_else(|| field_err("attrSet", "not an object"))?;
    let mut out = AttrValues::default();
    for (key, v) in obj {
        match key.as_str() {
            "value" => out.value = Some(parse_parameter_value(v)?),
            "notification" => {
                let n = v
                    .as_u64()
                    .filter(|n| *n <= 6)
                    .ok_or_else(|| field_err("attrSet", "notification outside 0..=6"))?;
                out.notification = Some(n as u8);
            }
            "accessList" => {
                let arr = v
                    .as_array()
                    .ok_or_else(|| field_err("attrSet", "accessList not an array"))?;
                let mut list = Vec::with_capacity(arr.len());
                for e in arr {
                    list.push(
                        e.as_str()
                            .ok_or_else(|| field_err("attrSet", "accessList entry not a string"))?
                            .to_string(),
                    );
                }
                out.access_list = Some(list);
            }
            "writable" => {
                out.writable = Some(
                    v.as_bool()
                        .ok_or_else(|| field_err("attrSet", "writable not a boolean"))?,
                );
            }
            other => return Err(field_err("attrSet", format!("unknown attribute {}", other))),
        }
    }
    Ok(out)
}

/// Parse a `[literal, xsdType]` pair or a bare literal (type inferred later
/// by sanitization).
fn parse_parameter_value(json: &Json) -> Result<ParameterValue, DeclarationError> {
    match json {
        Json::Array(arr) if !arr.is_empty() && arr.len() <= 2 => {
            let xsd_type = match arr.get(1) {
                None | Some(Json::Null) => XsdType::String,
                Some(Json::String(s)) => s
                    .parse()
                    .map_err(|e| field_err("attrSet", format!("value type: {}", e)))?,
                Some(other) => {
                    return Err(field_err(
                        "attrSet",
                        format!("value type not a string: {}", other),
                    ));
                }
            };
            Ok(ParameterValue {
                literal: arr[0].clone(),
                xsd_type,
            })
        }
        Json::Object(_) => Err(field_err("attrSet", "value must be a literal or pair")),
        other => Ok(ParameterValue {
            literal: other.clone(),
            xsd_type: infer_xsd_type(other),
        }),
    }
}

/// Infer an XSD type for a bare literal, mirroring what scripts get when
/// they do not spell a type.
pub fn infer_xsd_type(literal: &Json) -> XsdType {
    match literal {
        Json::Bool(_) => XsdType::Boolean,
        Json::Number(n) if n.is_i64() || n.is_u64() => XsdType::Int,
        _ => XsdType::String,
    }
}
