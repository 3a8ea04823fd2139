// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provision execution.
//!
//! A provision layer is a batch of named scripts run concurrently against a
//! snapshot; their outcomes (declarations, clears, done flags) are joined
//! before the layer completes. Provision names without a user script fall
//! back to the engine builtins defined here: `refresh`, `value`, `tag`,
//! `reboot`, `reset`, `download`, `instances`.
//!
//! Virtual parameters run the same way, with one extra obligation: a done
//! script must return a `{writable?, value?}` object matching exactly what
//! was requested, validated by [`validate_vparam_return`].

use std::collections::BTreeSet;

use futures::future::join_all;
use serde_json::Value as Json;
use tracing::warn;
use trellis_protocol::{ParameterValue, SessionFault, XsdType};

use crate::declarations::{
    infer_xsd_type, AttrTimestamps, AttrValues, Declaration, PathSetBounds,
};
use crate::device::{self, DeviceData};
use crate::path::{Path, Segment};
use crate::sandbox::{ScriptContext, ScriptOutcome, ScriptRunner};
use crate::session::{Provision, VirtualParameterCall};

/// Deepest level a `refresh` declaration descends to.
const REFRESH_DEPTH: usize = 16;

/// The joined result of one provision or virtual-parameter layer run.
#[derive(Debug, Default)]
pub struct LayerRun {
    /// Concatenated declarations from every script.
    pub declarations: Vec<Declaration>,
    /// Concatenated clears from every script.
    pub clears: Vec<crate::declarations::Clear>,
    /// True when every script in the layer was done.
    pub done: bool,
    /// Per-script validated returns (virtual parameters only).
    pub returns: Vec<Option<VpReturn>>,
}

/// A validated virtual-parameter return.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpReturn {
    /// Reported writability.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writable: Option<bool>,
    /// Reported value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<ParameterValue>,
}

/// Run one provisions layer: user scripts through the sandbox, builtins
/// inline. Fails with the first script fault.
pub async fn run_provisions(
    scripts: &dyn ScriptRunner,
    script_ctx: &ScriptContext,
    device_data: &DeviceData,
    provisions: &[Provision],
    user_scripts: &BTreeSet<String>,
) -> Result<LayerRun, SessionFault> {
    let mut outcomes: Vec<Option<ScriptOutcome>> = vec![None; provisions.len()];
    let mut futures = Vec::new();
    for (i, prov) in provisions.iter().enumerate() {
        if user_scripts.contains(&prov.name) {
            futures.push((i, scripts.run_provision(script_ctx, &prov.name, &prov.args)));
        } else {
            outcomes[i] = Some(run_builtin(script_ctx, device_data, prov)?);
        }
    }
    let indices: Vec<usize> = futures.iter().map(|(i, _)| *i).collect();
    let results = join_all(futures.into_iter().map(|(_, f)| f)).await;
    for (i, result) in indices.into_iter().zip(results) {
        outcomes[i] = Some(result.map_err(|e| {
            SessionFault::script_error("Error", e.to_string(), script_ctx.timestamp)
        })?);
    }

    join_layer(outcomes.into_iter().flatten(), script_ctx.timestamp)
}

/// Run one virtual-parameter layer.
pub async fn run_virtual_parameters(
    scripts: &dyn ScriptRunner,
    script_ctx: &ScriptContext,
    calls: &[VirtualParameterCall],
) -> Result<LayerRun, SessionFault> {
    let results = join_all(calls.iter().map(|call| {
        scripts.run_virtual_parameter(script_ctx, &call.name, &call.attr_get, &call.attr_set)
    }))
    .await;

    let mut outcomes = Vec::with_capacity(calls.len());
    let mut returns = Vec::with_capacity(calls.len());
    for (call, result) in calls.iter().zip(results) {
        let outcome = result.map_err(|e| {
            SessionFault::script_error("Error", e.to_string(), script_ctx.timestamp)
        })?;
        if let Some(fault) = &outcome.fault {
            return Err(fault.clone());
        }
        if outcome.done {
            returns.push(Some(validate_vparam_return(
                call,
                outcome.return_value.as_ref(),
                script_ctx.timestamp,
            )?));
        } else {
            returns.push(None);
        }
        outcomes.push(outcome);
    }

    let mut run = join_layer(outcomes.into_iter(), script_ctx.timestamp)?;
    run.returns = returns;
    Ok(run)
}

fn join_layer(
    outcomes: impl Iterator<Item = ScriptOutcome>,
    timestamp: i64,
) -> Result<LayerRun, SessionFault> {
    let mut run = LayerRun {
        done: true,
        ..Default::default()
    };
    for outcome in outcomes {
        if let Some(fault) = outcome.fault {
            return Err(SessionFault {
                timestamp,
                ..fault
            });
        }
        run.done &= outcome.done;
        run.declarations.extend(outcome.declare);
        run.clears.extend(outcome.clear);
    }
    if run.done {
        // Once the whole batch is done, deferred writes take effect.
        for d in &mut run.declarations {
            d.defer = false;
        }
    }
    Ok(run)
}

// ============================================================================
// Builtins
// ============================================================================

fn run_builtin(
    script_ctx: &ScriptContext,
    device_data: &DeviceData,
    prov: &Provision,
) -> Result<ScriptOutcome, SessionFault> {
    let now = script_ctx.timestamp;
    let arg_str = |i: usize| -> Result<&str, SessionFault> {
        prov.args.get(i).and_then(Json::as_str).ok_or_else(|| {
            SessionFault::script_error(
                "Error",
                format!("provision {} missing argument {}", prov.name, i),
                now,
            )
        })
    };
    let parse_path = |s: &str| -> Result<Path, SessionFault> {
        Path::parse(s).map_err(|e| SessionFault::script_error("Error", e.to_string(), now))
    };

    let mut outcome = ScriptOutcome {
        done: true,
        ..Default::default()
    };

    match prov.name.as_str() {
        "refresh" => {
            let base = parse_path(arg_str(0)?)?;
            let attrs = AttrTimestamps {
                object: Some(now),
                writable: Some(now),
                value: Some(now),
                ..Default::default()
            };
            let mut path = base;
            loop {
                outcome.declare.push(Declaration {
                    path: path.clone(),
                    path_get: Some(now),
                    path_set: None,
                    attr_get: Some(attrs),
                    attr_set: None,
                    defer: false,
                });
                if path.len() >= REFRESH_DEPTH {
                    break;
                }
                path = path.child(Segment::Wildcard);
            }
        }
        "value" => {
            let path = parse_path(arg_str(0)?)?;
            let raw = prov.args.get(1).cloned().unwrap_or(Json::Null);
            let value = ParameterValue {
                xsd_type: infer_xsd_type(&raw),
                literal: raw,
            };
            outcome.declare.push(Declaration {
                path,
                path_get: Some(1),
                path_set: None,
                attr_get: Some(AttrTimestamps {
                    value: Some(1),
                    ..Default::default()
                }),
                attr_set: Some(AttrValues {
                    value: Some(value),
                    ..Default::default()
                }),
                defer: false,
            });
        }
        "tag" => {
            // Tag names become path segments; fold anything a segment
            // cannot carry into underscores.
            let tag: String = arg_str(0)?
                .trim()
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                        c
                    } else {
                        '_'
                    }
                })
                .collect();
            if tag.is_empty() {
                return Err(SessionFault::script_error("Error", "empty tag name", now));
            }
            let present = prov.args.get(1).and_then(Json::as_bool).unwrap_or(true);
            let path = Path::parse("Tags")
                .expect("static path")
                .child(Segment::Name(tag));
            outcome.declare.push(Declaration {
                path,
                path_get: None,
                path_set: None,
                attr_get: None,
                attr_set: Some(AttrValues {
                    value: Some(ParameterValue::new(present, XsdType::Boolean)),
                    ..Default::default()
                }),
                defer: false,
            });
        }
        "reboot" => {
            outcome.declare.push(Declaration {
                path: Path::parse("Reboot").expect("static path"),
                path_get: Some(1),
                path_set: None,
                attr_get: Some(AttrTimestamps {
                    value: Some(1),
                    ..Default::default()
                }),
                attr_set: Some(AttrValues {
                    value: Some(ParameterValue::new(now, XsdType::Int)),
                    ..Default::default()
                }),
                defer: false,
            });
        }
        "reset" => {
            outcome.declare.push(Declaration {
                path: Path::parse("FactoryReset").expect("static path"),
                path_get: Some(1),
                path_set: None,
                attr_get: Some(AttrTimestamps {
                    value: Some(1),
                    ..Default::default()
                }),
                attr_set: Some(AttrValues {
                    value: Some(ParameterValue::new(now, XsdType::Int)),
                    ..Default::default()
                }),
                defer: false,
            });
        }
        "download" => {
            let file_type = arg_str(0)?;
            let file_name = arg_str(1)?;
            let target = prov.args.get(2).and_then(Json::as_str).unwrap_or("");
            let mut pairs = vec![
                (Path::parse("FileType").expect("static"), file_type.to_string()),
                (Path::parse("FileName").expect("static"), file_name.to_string()),
                (Path::parse("TargetFileName").expect("static"), target.to_string()),
            ];
            // Alias pairs are canonically ordered by subpath.
            pairs.sort_by(|a, b| a.0.to_string().cmp(&b.0.to_string()));
            let alias = Segment::Alias(pairs);
            let slot = Path::parse("Downloads").expect("static path").child(alias);
            outcome.declare.push(Declaration {
                path: slot.clone(),
                path_get: Some(1),
                path_set: Some(PathSetBounds { min: 1, max: u32::MAX }),
                attr_get: None,
                attr_set: None,
                defer: false,
            });
            outcome.declare.push(Declaration {
                path: slot.child(Segment::Name("Download".to_string())),
                path_get: Some(1),
                path_set: None,
                attr_get: Some(AttrTimestamps {
                    value: Some(1),
                    ..Default::default()
                }),
                attr_set: Some(AttrValues {
                    value: Some(ParameterValue::new(now, XsdType::Int)),
                    ..Default::default()
                }),
                defer: false,
            });
        }
        "instances" => {
            let path = parse_path(arg_str(0)?)?;
            let count_arg = prov.args.get(1).cloned().unwrap_or(Json::Null);
            let target = match &count_arg {
                Json::Number(n) => n.as_u64().unwrap_or(0) as i64,
                Json::String(s) => {
                    let trimmed = s.trim();
                    let current = device::unpack(device_data, &path).len() as i64;
                    if let Some(delta) = trimmed.strip_prefix('+') {
                        current + delta.parse::<i64>().unwrap_or(0)
                    } else if trimmed.starts_with('-') {
                        current + trimmed.parse::<i64>().unwrap_or(0)
                    } else {
                        trimmed.parse::<i64>().unwrap_or(0)
                    }
                }
                _ => {
                    return Err(SessionFault::script_error(
                        "Error",
                        "instances provision requires a count",
                        now,
                    ));
                }
            };
            let target = target.max(0) as u32;
            outcome.declare.push(Declaration {
                path,
                path_get: Some(1),
                path_set: Some(PathSetBounds::exactly(target)),
                attr_get: None,
                attr_set: None,
                defer: false,
            });
        }
        other => {
            return Err(SessionFault::script_error(
                "Error",
                format!("unknown provision: {}", other),
                now,
            ));
        }
    }

    Ok(outcome)
}

// ============================================================================
// Virtual-parameter return validation
// ============================================================================

/// Validate a done virtual parameter's return value against what the call
/// requested. Shape violations fault with code `script`.
pub fn validate_vparam_return(
    call: &VirtualParameterCall,
    value: Option<&Json>,
    timestamp: i64,
) -> Result<VpReturn, SessionFault> {
    let invalid = |reason: String| -> SessionFault {
        SessionFault::invalid_script_return(
            format!("virtual parameter {}: {}", call.name, reason),
            timestamp,
        )
    };

    let obj = value
        .and_then(Json::as_object)
        .ok_or_else(|| invalid("return value must be an object".to_string()))?;
    for key in obj.keys() {
        if key != "writable" && key != "value" {
            return Err(invalid(format!("unexpected return field {:?}", key)));
        }
    }

    let wants_writable =
        call.attr_get.writable.is_some() || call.attr_set.writable.is_some();
    let wants_value = call.attr_get.value.is_some() || call.attr_set.value.is_some();

    let writable = match (wants_writable, obj.get("writable")) {
        (true, Some(Json::Bool(b))) => Some(*b),
        (true, Some(other)) => {
            return Err(invalid(format!("writable must be a boolean, got {}", other)));
        }
        (true, None) => return Err(invalid("writable was requested but not returned".into())),
        (false, Some(_)) => {
            return Err(invalid("writable returned but not requested".into()));
        }
        (false, None) => None,
    };

    let value = match (wants_value, obj.get("value")) {
        (true, Some(v)) => Some(normalize_vparam_value(&call.name, v, timestamp)?),
        (true, None) => return Err(invalid("value was requested but not returned".into())),
        (false, Some(_)) => return Err(invalid("value returned but not requested".into())),
        (false, None) => None,
    };

    Ok(VpReturn { writable, value })
}

fn normalize_vparam_value(
    name: &str,
    raw: &Json,
    timestamp: i64,
) -> Result<ParameterValue, SessionFault> {
    let invalid = |reason: String| -> SessionFault {
        SessionFault::invalid_script_return(
            format!("virtual parameter {}: {}", name, reason),
            timestamp,
        )
    };

    let (literal, xsd_type) = match raw {
        Json::Array(arr) if !arr.is_empty() && arr.len() <= 2 => {
            let t = match arr.get(1) {
                None | Some(Json::Null) => infer_xsd_type(&arr[0]),
                Some(Json::String(s)) => {
                    if s == "xsd:datetime" {
                        warn!(vparam = name, "lower-case xsd:datetime spelling, normalizing");
                    }
                    s.parse::<XsdType>()
                        .map_err(|e| invalid(e.to_string()))?
                }
                Some(other) => {
                    return Err(invalid(format!("type must be a string, got {}", other)));
                }
            };
            (arr[0].clone(), t)
        }
        Json::Object(obj) => {
            // Dates cross the sandbox boundary as {"$date": epochMs}.
            match obj.get("$date").and_then(Json::as_i64) {
                Some(ms) => (Json::from(ms), XsdType::DateTime),
                None => return Err(invalid("value must be a literal or pair".into())),
            }
        }
        other => (other.clone(), infer_xsd_type(other)),
    };

    device::sanitize_parameter_value(&ParameterValue { literal, xsd_type })
        .map_err(|e| invalid(e.to_string()))
}
