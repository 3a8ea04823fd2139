// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SetParameterValues idempotence: no-op writes are suppressed, applied
//! writes do not repeat.

mod common;

use common::{stored_value, TestSession, T0};
use serde_json::json;
use trellis_protocol::{AcsRequest, CpeResponse, ParameterValue};
use trellis_session::device::{self, Attributes};
use trellis_session::path::Path;
use trellis_session::session::{self, DriverResult, Provision};

const PARAM: &str = "Device.ManagementServer.PeriodicInformInterval";

fn seed_leaf(s: &mut TestSession, path: &str, value: ParameterValue) {
    let mut to_clear = Vec::new();
    device::set(
        &mut s.ctx.device_data,
        Path::parse(path).unwrap(),
        T0 - 1000,
        Some(Attributes {
            object: Some((T0 - 1000, false)),
            writable: Some((T0 - 1000, true)),
            value: Some((T0 - 1000, value)),
            ..Default::default()
        }),
        &mut to_clear,
    );
    assert!(to_clear.is_empty());
}

fn value_provision(value: &str) -> Provision {
    Provision {
        name: "value".to_string(),
        args: vec![json!(PARAM), json!(value)],
    }
}

async fn drive(s: &mut TestSession) -> DriverResult {
    session::rpc_request(&mut s.ctx, &s.env, None).await.unwrap()
}

#[tokio::test]
async fn test_equal_value_emits_no_spv() {
    let mut s = TestSession::new();
    seed_leaf(&mut s, PARAM, ParameterValue::string("1.0"));
    session::add_provisions(&mut s.ctx, "default", vec![value_provision("1.0")]);

    assert_eq!(drive(&mut s).await, DriverResult::Done);
    assert_eq!(s.ctx.rpc_count, 0);
}

#[tokio::test]
async fn test_changed_value_emits_spv_once() {
    let mut s = TestSession::new();
    seed_leaf(&mut s, PARAM, ParameterValue::string("1.0"));
    session::add_provisions(&mut s.ctx, "default", vec![value_provision("1.1")]);

    let DriverResult::Request { rpc_id, request } = drive(&mut s).await else {
        panic!("expected SPV");
    };
    match &request {
        AcsRequest::SetParameterValues { parameter_list, .. } => {
            assert_eq!(parameter_list.len(), 1);
            assert_eq!(parameter_list[0].name, PARAM);
            assert_eq!(parameter_list[0].value, ParameterValue::string("1.1"));
        }
        other => panic!("expected SPV, got {:?}", other),
    }

    let fault = session::rpc_response(
        &mut s.ctx,
        &rpc_id,
        &CpeResponse::SetParameterValuesResponse { status: 0 },
    );
    assert_eq!(fault, None);
    assert_eq!(drive(&mut s).await, DriverResult::Done);
    assert_eq!(
        stored_value(&s.ctx, PARAM),
        Some(ParameterValue::string("1.1"))
    );

    // Re-installing the same provision replans but finds nothing to send.
    session::add_provisions(&mut s.ctx, "default", vec![value_provision("1.1")]);
    assert_eq!(drive(&mut s).await, DriverResult::Done);
    assert_eq!(s.ctx.rpc_count, 0); // reset by the new cycle, and unused
}

#[tokio::test]
async fn test_spv_respects_stored_type() {
    let mut s = TestSession::new();
    seed_leaf(&mut s, PARAM, ParameterValue::new(300, trellis_protocol::XsdType::UnsignedInt));
    session::add_provisions(&mut s.ctx, "default", vec![value_provision("600")]);

    let DriverResult::Request { request, .. } = drive(&mut s).await else {
        panic!("expected SPV");
    };
    match &request {
        AcsRequest::SetParameterValues { parameter_list, .. } => {
            assert_eq!(
                parameter_list[0].value,
                ParameterValue::new(600, trellis_protocol::XsdType::UnsignedInt)
            );
        }
        other => panic!("expected SPV, got {:?}", other),
    }
}
