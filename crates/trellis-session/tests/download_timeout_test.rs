// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Download operations: dispatch, TransferComplete, and timeout handling.

mod common;

use common::{stored_value, MemoryCache, ScriptedRunner, TestSession, T0};
use serde_json::json;
use trellis_protocol::{AcsRequest, CpeRequest, CpeResponse, ParameterValue, XsdType};
use trellis_session::session::{self, DriverResult, Operation, Provision};

fn pending_download(s: &mut TestSession, command_key: &str, dispatched_at: i64) {
    s.ctx.operations.insert(
        command_key.to_string(),
        Operation::Download {
            timestamp: dispatched_at,
            instance: "Downloads.1".to_string(),
            file_type: "1 Firmware Upgrade Image".to_string(),
            file_name: "http://acs/fw.bin".to_string(),
            target_file_name: String::new(),
        },
    );
}

fn seed_last_download(s: &mut TestSession, ms: i64) {
    use trellis_session::device::{self, Attributes};
    use trellis_session::path::Path;
    let mut to_clear = Vec::new();
    for (path, value) in [
        ("Downloads.1", None),
        ("Downloads.1.LastDownload", Some(ms)),
    ] {
        device::set(
            &mut s.ctx.device_data,
            Path::parse(path).unwrap(),
            T0 - 10_000,
            Some(match value {
                None => Attributes {
                    object: Some((T0 - 10_000, true)),
                    ..Default::default()
                },
                Some(ms) => Attributes {
                    object: Some((T0 - 10_000, false)),
                    value: Some((
                        T0 - 10_000,
                        ParameterValue::new(ms, XsdType::DateTime),
                    )),
                    ..Default::default()
                },
            }),
            &mut to_clear,
        );
    }
}

#[tokio::test]
async fn test_timeout_faults_and_reverts() {
    let mut s = TestSession::new();
    let dispatched = T0 - 3600 * 1000 - 1; // one tick past the default timeout
    pending_download(&mut s, "cmd-1", dispatched);
    seed_last_download(&mut s, 500);

    let faults = session::timeout_operations(&mut s.ctx, &s.env).await.unwrap();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].code, "timeout");
    assert!(s.ctx.operations.is_empty());

    let reverted = stored_value(&s.ctx, "Downloads.1.Download").unwrap();
    assert_eq!(reverted.literal, json!(500));
}

#[tokio::test]
async fn test_fresh_operation_does_not_time_out() {
    let mut s = TestSession::new();
    pending_download(&mut s, "cmd-1", T0 - 1000);
    let faults = session::timeout_operations(&mut s.ctx, &s.env).await.unwrap();
    assert!(faults.is_empty());
    assert_eq!(s.ctx.operations.len(), 1);
}

#[tokio::test]
async fn test_timeout_can_synthesize_success() {
    let cache = MemoryCache {
        config: [(
            "cwmp.downloadSuccessOnTimeout".to_string(),
            json!(true),
        )]
        .into(),
        ..Default::default()
    };
    let mut s = TestSession::with(cache, ScriptedRunner::default());
    let dispatched = T0 - 3600 * 1000 - 1;
    pending_download(&mut s, "cmd-1", dispatched);

    let faults = session::timeout_operations(&mut s.ctx, &s.env).await.unwrap();
    assert!(faults.is_empty());
    assert!(s.ctx.operations.is_empty());
    assert_eq!(
        stored_value(&s.ctx, "Downloads.1.LastDownload").unwrap().literal,
        json!(dispatched)
    );
    assert_eq!(
        stored_value(&s.ctx, "Downloads.1.LastFileName"),
        Some(ParameterValue::string("http://acs/fw.bin"))
    );
}

#[tokio::test]
async fn test_transfer_complete_fault_reverts_and_surfaces() {
    let mut s = TestSession::new();
    pending_download(&mut s, "cmd-1", T0 - 1000);
    seed_last_download(&mut s, 500);

    let (_, fault) = session::transfer_complete(
        &mut s.ctx,
        &CpeRequest::TransferComplete {
            command_key: "cmd-1".to_string(),
            fault_code: 9010,
            fault_string: "Download failure".to_string(),
            start_time: None,
            complete_time: None,
        },
    );
    let fault = fault.unwrap();
    assert_eq!(fault.code, "cwmp.9010");
    assert!(s.ctx.operations.is_empty());
    assert_eq!(
        stored_value(&s.ctx, "Downloads.1.Download").unwrap().literal,
        json!(500)
    );
}

#[tokio::test]
async fn test_transfer_complete_unknown_key_is_acked() {
    let mut s = TestSession::new();
    let (_, fault) = session::transfer_complete(
        &mut s.ctx,
        &CpeRequest::TransferComplete {
            command_key: "nope".to_string(),
            fault_code: 0,
            fault_string: String::new(),
            start_time: None,
            complete_time: None,
        },
    );
    assert!(fault.is_none());
}

#[tokio::test]
async fn test_download_provision_dispatches_and_registers_operation() {
    let mut s = TestSession::new();
    session::add_provisions(
        &mut s.ctx,
        "default",
        vec![Provision {
            name: "download".to_string(),
            args: vec![
                json!("1 Firmware Upgrade Image"),
                json!("http://acs/fw.bin"),
            ],
        }],
    );

    let result = session::rpc_request(&mut s.ctx, &s.env, None).await.unwrap();
    let DriverResult::Request { rpc_id, request } = result else {
        panic!("expected Download, got {:?}", result);
    };
    let AcsRequest::Download {
        command_key,
        instance,
        file_type,
        file_name,
        ..
    } = &request
    else {
        panic!("expected Download, got {:?}", request);
    };
    assert_eq!(instance, "Downloads.1");
    assert_eq!(file_type, "1 Firmware Upgrade Image");
    assert_eq!(file_name, "http://acs/fw.bin");

    // Asynchronous acceptance registers a pending operation.
    let fault = session::rpc_response(
        &mut s.ctx,
        &rpc_id,
        &CpeResponse::DownloadResponse {
            status: 1,
            start_time: None,
            complete_time: None,
        },
    );
    assert_eq!(fault, None);
    assert!(s.ctx.operations.contains_key(command_key));
    assert_eq!(
        stored_value(&s.ctx, "Downloads.1.Download").unwrap().literal,
        json!(T0)
    );
}
