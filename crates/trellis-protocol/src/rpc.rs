// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! CWMP RPC payload types.
//!
//! Each ACS-initiated RPC is a variant of [`AcsRequest`]; the CPE's reply is
//! the matching [`CpeResponse`] variant. The two CPE-initiated calls the
//! engine handles (`Inform`, `TransferComplete`) live in [`CpeRequest`] with
//! their acks in [`AcsResponse`].
//!
//! Serde representations use the `name`-tagged form so a serialized request
//! reads the way the CWMP method is spelled, e.g.
//! `{"name":"GetParameterValues","parameterNames":[...]}`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value::ParameterValue;

/// Continuation marker attached to a planned request, so that the engine can
/// chain follow-up RPCs after the response arrives (instance-key fixup after
/// `AddObject`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Continuation {
    /// After `AddObject`: fetch the alias-key parameters of the new instance.
    GetInstanceKeys,
    /// After that fetch: set any alias keys that disagree.
    SetInstanceKeys,
}

/// One entry of a `SetParameterValues` parameter list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpvEntry {
    /// Full parameter path.
    pub name: String,
    /// Value with its XSD type.
    pub value: ParameterValue,
}

/// One entry of a `SetParameterAttributes` parameter list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaEntry {
    /// Full parameter path.
    pub name: String,
    /// Notification level 0..=6, when being changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification: Option<u8>,
    /// Access list, when being changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_list: Option<Vec<String>>,
}

/// An RPC the engine asks the host to deliver to the CPE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum AcsRequest {
    /// Enumerate names under a partial path.
    #[serde(rename_all = "camelCase")]
    GetParameterNames {
        /// Partial path ending in `.`, or empty for the root.
        parameter_path: String,
        /// When true, only immediate children are reported.
        next_level: bool,
    },

    /// Read parameter values.
    #[serde(rename_all = "camelCase")]
    GetParameterValues {
        /// Full parameter paths.
        parameter_names: Vec<String>,
        /// Continuation, present only on the synthesized instance-key fetch.
        #[serde(skip_serializing_if = "Option::is_none")]
        next: Option<Continuation>,
        /// Desired alias-key values, carried through the continuation chain.
        #[serde(skip_serializing_if = "Option::is_none")]
        instance_values: Option<BTreeMap<String, String>>,
    },

    /// Read notification and access-list attributes.
    #[serde(rename_all = "camelCase")]
    GetParameterAttributes {
        /// Full parameter paths.
        parameter_names: Vec<String>,
    },

    /// Write parameter values.
    #[serde(rename_all = "camelCase")]
    SetParameterValues {
        /// `(name, value, type)` triples.
        parameter_list: Vec<SpvEntry>,
        /// Encode `xsd:dateTime` with milliseconds.
        datetime_milliseconds: bool,
        /// Encode booleans as `true`/`false` rather than `1`/`0`.
        boolean_literal: bool,
    },

    /// Write notification / access-list attributes.
    #[serde(rename_all = "camelCase")]
    SetParameterAttributes {
        /// Attribute changes, one entry per parameter.
        parameter_list: Vec<SpaEntry>,
    },

    /// Create an instance under a multi-instance object.
    #[serde(rename_all = "camelCase")]
    AddObject {
        /// Object path ending in `.`.
        object_name: String,
        /// Alias-key values the new instance must end up with.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        instance_values: BTreeMap<String, String>,
        /// Continuation driving the key fetch/fixup chain.
        #[serde(skip_serializing_if = "Option::is_none")]
        next: Option<Continuation>,
    },

    /// Delete an instance.
    #[serde(rename_all = "camelCase")]
    DeleteObject {
        /// Instance path ending in `.`.
        object_name: String,
    },

    /// Instruct the CPE to download and apply a file.
    #[serde(rename_all = "camelCase")]
    Download {
        /// Correlates the later `TransferComplete`.
        command_key: String,
        /// The `Downloads.{i}` instance this download belongs to.
        instance: String,
        /// TR-069 file type string.
        file_type: String,
        /// Source URL.
        file_name: String,
        /// Target name on the device.
        target_file_name: String,
    },

    /// Reboot the CPE.
    Reboot,

    /// Factory-reset the CPE.
    FactoryReset,
}

impl AcsRequest {
    /// The CWMP method name, used to match responses against requests.
    pub fn method_name(&self) -> &'static str {
        match self {
            AcsRequest::GetParameterNames { .. } => "GetParameterNames",
            AcsRequest::GetParameterValues { .. } => "GetParameterValues",
            AcsRequest::GetParameterAttributes { .. } => "GetParameterAttributes",
            AcsRequest::SetParameterValues { .. } => "SetParameterValues",
            AcsRequest::SetParameterAttributes { .. } => "SetParameterAttributes",
            AcsRequest::AddObject { .. } => "AddObject",
            AcsRequest::DeleteObject { .. } => "DeleteObject",
            AcsRequest::Download { .. } => "Download",
            AcsRequest::Reboot => "Reboot",
            AcsRequest::FactoryReset => "FactoryReset",
        }
    }
}

/// One entry of a `GetParameterNamesResponse`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpnEntry {
    /// Reported path. Objects end in `.` on the wire; the codec strips that.
    pub name: String,
    /// Whether the node is an object (interior) or a parameter (leaf).
    pub object: bool,
    /// Whether the node is writable.
    pub writable: bool,
}

impl GpnEntry {
    /// Convenience constructor used heavily in tests.
    pub fn new(name: impl Into<String>, object: bool, writable: bool) -> Self {
        Self {
            name: name.into(),
            object,
            writable,
        }
    }
}

/// A CPE reply to an [`AcsRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum CpeResponse {
    /// Reply to `GetParameterNames`.
    #[serde(rename_all = "camelCase")]
    GetParameterNamesResponse {
        /// Reported `(name, object, writable)` entries.
        parameter_list: Vec<GpnEntry>,
    },

    /// Reply to `GetParameterValues`.
    #[serde(rename_all = "camelCase")]
    GetParameterValuesResponse {
        /// `(name, value)` pairs.
        parameter_list: Vec<(String, ParameterValue)>,
    },

    /// Reply to `GetParameterAttributes`.
    #[serde(rename_all = "camelCase")]
    GetParameterAttributesResponse {
        /// `(name, notification, accessList)` triples.
        parameter_list: Vec<(String, u8, Vec<String>)>,
    },

    /// Reply to `SetParameterValues`.
    #[serde(rename_all = "camelCase")]
    SetParameterValuesResponse {
        /// 0 = applied, 1 = applied but requires reboot.
        status: i32,
    },

    /// Reply to `SetParameterAttributes`.
    SetParameterAttributesResponse,

    /// Reply to `AddObject`.
    #[serde(rename_all = "camelCase")]
    AddObjectResponse {
        /// The instance number assigned by the CPE.
        instance_number: String,
        /// 0 = created, 1 = created but not yet committed.
        status: i32,
    },

    /// Reply to `DeleteObject`.
    #[serde(rename_all = "camelCase")]
    DeleteObjectResponse {
        /// 0 = deleted, 1 = deleted but not yet committed.
        status: i32,
    },

    /// Reply to `Download`.
    #[serde(rename_all = "camelCase")]
    DownloadResponse {
        /// 0 = completed synchronously, 1 = will complete asynchronously.
        status: i32,
        /// Transfer start, epoch ms, when completed synchronously.
        #[serde(skip_serializing_if = "Option::is_none")]
        start_time: Option<i64>,
        /// Transfer end, epoch ms, when completed synchronously.
        #[serde(skip_serializing_if = "Option::is_none")]
        complete_time: Option<i64>,
    },

    /// Reply to `Reboot`.
    RebootResponse,

    /// Reply to `FactoryReset`.
    FactoryResetResponse,
}

impl CpeResponse {
    /// The CWMP method name of the request this response answers.
    pub fn request_name(&self) -> &'static str {
        match self {
            CpeResponse::GetParameterNamesResponse { .. } => "GetParameterNames",
            CpeResponse::GetParameterValuesResponse { .. } => "GetParameterValues",
            CpeResponse::GetParameterAttributesResponse { .. } => "GetParameterAttributes",
            CpeResponse::SetParameterValuesResponse { .. } => "SetParameterValues",
            CpeResponse::SetParameterAttributesResponse => "SetParameterAttributes",
            CpeResponse::AddObjectResponse { .. } => "AddObject",
            CpeResponse::DeleteObjectResponse { .. } => "DeleteObject",
            CpeResponse::DownloadResponse { .. } => "Download",
            CpeResponse::RebootResponse => "Reboot",
            CpeResponse::FactoryResetResponse => "FactoryReset",
        }
    }
}

/// The `DeviceIdStruct` a CPE sends in every `Inform`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceIdStruct {
    /// Device manufacturer name.
    pub manufacturer: String,
    /// Organizationally unique identifier, six hex digits.
    #[serde(rename = "OUI")]
    pub oui: String,
    /// Product class, may be empty.
    #[serde(default)]
    pub product_class: String,
    /// Serial number.
    pub serial_number: String,
}

/// A CPE-initiated call handled by the session engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum CpeRequest {
    /// Session-opening `Inform`.
    #[serde(rename_all = "camelCase")]
    Inform {
        /// Identity of the reporting device.
        device_id: DeviceIdStruct,
        /// Event codes, e.g. `"0 BOOTSTRAP"`, `"2 PERIODIC"`.
        event: Vec<String>,
        /// Reported parameters.
        parameter_list: Vec<(String, ParameterValue)>,
        /// How many times the CPE retried this session.
        #[serde(default)]
        retry_count: u32,
    },

    /// Completion report for an asynchronous `Download`.
    #[serde(rename_all = "camelCase")]
    TransferComplete {
        /// Correlates the original `Download`.
        command_key: String,
        /// Nonzero fault code when the transfer failed.
        #[serde(default)]
        fault_code: u32,
        /// Fault string accompanying a nonzero code.
        #[serde(default)]
        fault_string: String,
        /// Transfer start, epoch ms.
        #[serde(skip_serializing_if = "Option::is_none")]
        start_time: Option<i64>,
        /// Transfer end, epoch ms.
        #[serde(skip_serializing_if = "Option::is_none")]
        complete_time: Option<i64>,
    },
}

/// Engine replies to CPE-initiated calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum AcsResponse {
    /// Ack for `Inform`.
    #[serde(rename_all = "camelCase")]
    InformResponse {
        /// Always 1 per TR-069.
        max_envelopes: u32,
    },

    /// Ack for `TransferComplete`.
    TransferCompleteResponse,
}
