// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance management: AddObject with the instance-key continuation chain,
//! and DeleteObject for overage.

mod common;

use common::{TestSession, T0};
use serde_json::json;
use trellis_protocol::{AcsRequest, Continuation, CpeResponse, ParameterValue};
use trellis_session::declarations::Declaration;
use trellis_session::device::{self, Attributes};
use trellis_session::path::Path;
use trellis_session::session::{self, DriverResult};

fn seed_object(s: &mut TestSession, path: &str, writable: bool) {
    let mut to_clear = Vec::new();
    device::set(
        &mut s.ctx.device_data,
        Path::parse(path).unwrap(),
        T0 - 1000,
        Some(Attributes {
            object: Some((T0 - 1000, true)),
            writable: Some((T0 - 1000, writable)),
            ..Default::default()
        }),
        &mut to_clear,
    );
}

/// Record that the children of `parent` were enumerated (and empty unless
/// seeded) just before the session started.
fn seed_enumerated(s: &mut TestSession, parent: &str) {
    let mut to_clear = Vec::new();
    device::set(
        &mut s.ctx.device_data,
        Path::parse(parent).unwrap().child(trellis_session::path::Segment::Wildcard),
        T0 - 1000,
        None,
        &mut to_clear,
    );
    for c in to_clear {
        device::clear(
            &mut s.ctx.device_data,
            &c.path,
            c.timestamp,
            c.attr_timestamps.as_ref(),
        );
    }
}

fn keyed_instance_declaration() -> Declaration {
    Declaration::from_json(&json!({
        "path": "IF.[Name=wan0]",
        "pathGet": 1,
        "pathSet": 1
    }))
    .unwrap()
}

async fn drive(s: &mut TestSession, decls: Option<Vec<Declaration>>) -> DriverResult {
    session::rpc_request(&mut s.ctx, &s.env, decls).await.unwrap()
}

#[tokio::test]
async fn test_add_object_continuation_chain() {
    let mut s = TestSession::new();
    seed_object(&mut s, "IF", true);
    seed_enumerated(&mut s, "IF");

    // 1. AddObject with the desired keys and the continuation marker.
    let result = drive(&mut s, Some(vec![keyed_instance_declaration()])).await;
    let DriverResult::Request { rpc_id, request } = result else {
        panic!("expected AddObject, got {:?}", result);
    };
    assert_eq!(
        request,
        AcsRequest::AddObject {
            object_name: "IF.".to_string(),
            instance_values: [("Name".to_string(), "wan0".to_string())].into(),
            next: Some(Continuation::GetInstanceKeys),
        }
    );

    let fault = session::rpc_response(
        &mut s.ctx,
        &rpc_id,
        &CpeResponse::AddObjectResponse {
            instance_number: "3".to_string(),
            status: 0,
        },
    );
    assert_eq!(fault, None);

    // 2. The engine fetches the new instance's key parameters.
    let DriverResult::Request { rpc_id, request } = drive(&mut s, None).await else {
        panic!("expected key fetch");
    };
    assert_eq!(
        request,
        AcsRequest::GetParameterValues {
            parameter_names: vec!["IF.3.Name".to_string()],
            next: Some(Continuation::SetInstanceKeys),
            instance_values: Some([("IF.3.Name".to_string(), "wan0".to_string())].into()),
        }
    );

    // 3. The CPE assigned a different name, so a fixup SPV follows.
    let fault = session::rpc_response(
        &mut s.ctx,
        &rpc_id,
        &CpeResponse::GetParameterValuesResponse {
            parameter_list: vec![("IF.3.Name".to_string(), ParameterValue::string("other"))],
        },
    );
    assert_eq!(fault, None);

    let DriverResult::Request { rpc_id, request } = drive(&mut s, None).await else {
        panic!("expected fixup SPV");
    };
    match &request {
        AcsRequest::SetParameterValues { parameter_list, .. } => {
            assert_eq!(parameter_list.len(), 1);
            assert_eq!(parameter_list[0].name, "IF.3.Name");
            assert_eq!(parameter_list[0].value, ParameterValue::string("wan0"));
        }
        other => panic!("expected SPV, got {:?}", other),
    }

    let fault = session::rpc_response(
        &mut s.ctx,
        &rpc_id,
        &CpeResponse::SetParameterValuesResponse { status: 0 },
    );
    assert_eq!(fault, None);
    assert_eq!(drive(&mut s, None).await, DriverResult::Done);
}

#[tokio::test]
async fn test_matching_keys_skip_fixup() {
    let mut s = TestSession::new();
    seed_object(&mut s, "IF", true);
    seed_enumerated(&mut s, "IF");

    let result = drive(&mut s, Some(vec![keyed_instance_declaration()])).await;
    let DriverResult::Request { rpc_id, .. } = result else {
        panic!("expected AddObject");
    };
    session::rpc_response(
        &mut s.ctx,
        &rpc_id,
        &CpeResponse::AddObjectResponse {
            instance_number: "1".to_string(),
            status: 0,
        },
    );

    let DriverResult::Request { rpc_id, .. } = drive(&mut s, None).await else {
        panic!("expected key fetch");
    };
    // The CPE already stored the right name: no SPV follows.
    session::rpc_response(
        &mut s.ctx,
        &rpc_id,
        &CpeResponse::GetParameterValuesResponse {
            parameter_list: vec![("IF.1.Name".to_string(), ParameterValue::string("wan0"))],
        },
    );
    assert_eq!(drive(&mut s, None).await, DriverResult::Done);
}

#[tokio::test]
async fn test_add_object_ignores_parent_writability() {
    // Writability gates DeleteObject only; creation under a parent the CPE
    // reports as read-only is still attempted (the CPE may fault it).
    let mut s = TestSession::new();
    seed_object(&mut s, "IF", false);
    seed_enumerated(&mut s, "IF");

    let result = drive(&mut s, Some(vec![keyed_instance_declaration()])).await;
    let DriverResult::Request { request, .. } = result else {
        panic!("expected AddObject, got {:?}", result);
    };
    assert!(matches!(request, AcsRequest::AddObject { .. }));
}

#[tokio::test]
async fn test_overage_plans_delete_object() {
    let mut s = TestSession::new();
    seed_object(&mut s, "IF", true);
    seed_object(&mut s, "IF.1", true);
    seed_object(&mut s, "IF.2", true);
    seed_enumerated(&mut s, "IF");
    // Re-seed after the enumeration sweep.
    seed_object(&mut s, "IF.1", true);
    seed_object(&mut s, "IF.2", true);

    let decl = Declaration::from_json(&json!({
        "path": "IF.*",
        "pathGet": 1,
        "pathSet": [0, 1]
    }))
    .unwrap();

    let result = drive(&mut s, Some(vec![decl])).await;
    let DriverResult::Request { rpc_id, request } = result else {
        panic!("expected DeleteObject, got {:?}", result);
    };
    assert_eq!(
        request,
        AcsRequest::DeleteObject {
            object_name: "IF.2.".to_string()
        }
    );

    let fault = session::rpc_response(
        &mut s.ctx,
        &rpc_id,
        &CpeResponse::DeleteObjectResponse { status: 0 },
    );
    assert_eq!(fault, None);

    // The instance is gone from the model.
    let p = Path::parse("IF.2").unwrap();
    let gone = s
        .ctx
        .device_data
        .paths
        .get(&p)
        .map(|i| s.ctx.device_data.attributes.get(&i).is_none())
        .unwrap_or(true);
    assert!(gone);
}
