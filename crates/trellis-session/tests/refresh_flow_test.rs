// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The discovery flow: refresh provision → GPN → GPV → converged.

mod common;

use common::{inform_request, stored_value, TestSession};
use serde_json::json;
use trellis_protocol::{AcsRequest, CpeResponse, GpnEntry, ParameterValue};
use trellis_session::session::{self, DriverResult, Provision};

const SW_VERSION: &str = "InternetGatewayDevice.DeviceInfo.SoftwareVersion";

async fn drive(s: &mut TestSession) -> DriverResult {
    session::rpc_request(&mut s.ctx, &s.env, None).await.unwrap()
}

#[tokio::test]
async fn test_refresh_discovers_then_reads() {
    let mut s = TestSession::new();
    session::inform(&mut s.ctx, &inform_request(&["2 PERIODIC"], &[]));
    session::add_provisions(
        &mut s.ctx,
        "default",
        vec![Provision {
            name: "refresh".to_string(),
            args: vec![json!(SW_VERSION)],
        }],
    );

    // 1. Nothing known under InternetGatewayDevice: single-hop GPN first.
    let DriverResult::Request { rpc_id, request } = drive(&mut s).await else {
        panic!("expected GPN");
    };
    assert_eq!(
        request,
        AcsRequest::GetParameterNames {
            parameter_path: "InternetGatewayDevice.".to_string(),
            next_level: true,
        }
    );

    let fault = session::rpc_response(
        &mut s.ctx,
        &rpc_id,
        &CpeResponse::GetParameterNamesResponse {
            parameter_list: vec![
                GpnEntry::new("InternetGatewayDevice", true, false),
                GpnEntry::new("InternetGatewayDevice.DeviceInfo", true, false),
                GpnEntry::new(SW_VERSION, false, false),
            ],
        },
    );
    assert_eq!(fault, None);

    // 2. The leaf is now known: its value is fetched.
    let DriverResult::Request { rpc_id, request } = drive(&mut s).await else {
        panic!("expected GPV");
    };
    match &request {
        AcsRequest::GetParameterValues {
            parameter_names, ..
        } => assert_eq!(parameter_names, &vec![SW_VERSION.to_string()]),
        other => panic!("expected GPV, got {:?}", other),
    }

    let fault = session::rpc_response(
        &mut s.ctx,
        &rpc_id,
        &CpeResponse::GetParameterValuesResponse {
            parameter_list: vec![(SW_VERSION.to_string(), ParameterValue::string("1.0"))],
        },
    );
    assert_eq!(fault, None);

    // 3. Declarations satisfied: the session converges.
    assert_eq!(drive(&mut s).await, DriverResult::Done);
    assert_eq!(
        stored_value(&s.ctx, SW_VERSION),
        Some(ParameterValue::string("1.0"))
    );
    assert_eq!(s.ctx.rpc_count, 2);
}

#[tokio::test]
async fn test_rpc_request_is_reentrant() {
    let mut s = TestSession::new();
    session::inform(&mut s.ctx, &inform_request(&["2 PERIODIC"], &[]));
    session::add_provisions(
        &mut s.ctx,
        "default",
        vec![Provision {
            name: "refresh".to_string(),
            args: vec![json!(SW_VERSION)],
        }],
    );

    let first = drive(&mut s).await;
    let second = drive(&mut s).await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_gpn_sweeps_stale_children() {
    let mut s = TestSession::new();
    session::inform(
        &mut s.ctx,
        &inform_request(
            &["2 PERIODIC"],
            &[("IGD.Old", ParameterValue::string("stale"))],
        ),
    );
    session::add_provisions(
        &mut s.ctx,
        "default",
        vec![Provision {
            name: "refresh".to_string(),
            args: vec![json!("IGD.New")],
        }],
    );

    let DriverResult::Request { rpc_id, request } = drive(&mut s).await else {
        panic!("expected GPN");
    };
    assert!(matches!(request, AcsRequest::GetParameterNames { .. }));

    // The device no longer reports Old.
    session::rpc_response(
        &mut s.ctx,
        &rpc_id,
        &CpeResponse::GetParameterNamesResponse {
            parameter_list: vec![
                GpnEntry::new("IGD", true, false),
                GpnEntry::new("IGD.New", false, false),
            ],
        },
    );

    assert_eq!(stored_value(&s.ctx, "IGD.Old"), None);
}
