//! Wire-level delegation round trips.
//!
//! The delegate lives on the local transport (so it can attach a notify
//! channel under this process's pid); requesters play separate actors
//! over TCP with claimed identities.

mod common;

use bytes::Bytes;
use common::{TEST_TIMEOUT, TestClient, spawn_daemon};
use varbus_core::wire::{VarDescriptor, decode_value, value_bytes};
use varbus_core::{NotifyKind, RequestCode, StatusCode, VarValue};

#[tokio::test]
async fn computed_read_round_trip() {
    let daemon = spawn_daemon().await;
    let mut delegate = TestClient::connect_local(&daemon).await;
    let mut signals = TestClient::attach_notify(&daemon).await;

    let desc = VarDescriptor::new("calc.sum", 0, VarValue::Int32(0));
    let resp = delegate.request(RequestCode::Create, 0, 0, desc.encode()).await;
    let handle = resp.frame.header.param1;
    let resp = delegate
        .request(RequestCode::Subscribe, handle, NotifyKind::Computed.wire(), Bytes::new())
        .await;
    assert_eq!(resp.status(), StatusCode::Ok);

    // The reader blocks inside its own task until the delegate answers.
    let mut reader = TestClient::connect_tcp(&daemon, 31337, 0).await;
    let pending = tokio::spawn(async move {
        let resp = reader.request(RequestCode::Get, handle, 0, Bytes::new()).await;
        (resp.status(), resp.frame.payload)
    });

    // Delegate receives the signal, computes, and writes.
    let (kind, signalled_handle, txn) = signals.next_signal().await;
    assert_eq!(kind, NotifyKind::Computed.wire());
    assert_eq!(signalled_handle, handle);
    assert!(txn > 0);

    let resp = delegate
        .request(RequestCode::Set, handle, 0, value_bytes(&VarValue::Int32(777)))
        .await;
    assert_eq!(resp.status(), StatusCode::Ok);

    // The reader is released with the fresh value.
    let (status, payload) = tokio::time::timeout(TEST_TIMEOUT, pending)
        .await
        .expect("reader released")
        .expect("reader task");
    assert_eq!(status, StatusCode::Ok);
    let mut payload = payload;
    assert_eq!(decode_value(&mut payload).unwrap(), VarValue::Int32(777));
}

#[tokio::test]
async fn validated_write_round_trip() {
    let daemon = spawn_daemon().await;
    let mut validator = TestClient::connect_local(&daemon).await;
    let mut signals = TestClient::attach_notify(&daemon).await;

    let desc = VarDescriptor::new("lim.rate", 0, VarValue::UInt32(10));
    let resp = validator.request(RequestCode::Create, 0, 0, desc.encode()).await;
    let handle = resp.frame.header.param1;
    let resp = validator
        .request(RequestCode::Subscribe, handle, NotifyKind::Validated.wire(), Bytes::new())
        .await;
    assert_eq!(resp.status(), StatusCode::Ok);

    let mut writer = TestClient::connect_tcp(&daemon, 555, 0).await;
    let pending = tokio::spawn(async move {
        let resp = writer
            .request(RequestCode::Set, handle, 0, value_bytes(&VarValue::UInt32(99)))
            .await;
        resp.status()
    });

    let (kind, _, txn) = signals.next_signal().await;
    assert_eq!(kind, NotifyKind::Validated.wire());

    // Validator inspects the proposal...
    let resp = validator
        .request(RequestCode::GetPendingValidation, 0, 0, Bytes::new())
        .await;
    assert_eq!(resp.status(), StatusCode::Ok);
    assert_eq!(resp.frame.header.param1, txn);
    assert_eq!(resp.frame.header.param2, handle);
    let mut proposed = resp.frame.payload;
    assert_eq!(decode_value(&mut proposed).unwrap(), VarValue::UInt32(99));

    // ...and accepts it.
    let resp = validator
        .request(
            RequestCode::SendValidationResponse,
            txn,
            u32::from(StatusCode::Ok.wire()),
            Bytes::new(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::Ok);

    let status = tokio::time::timeout(TEST_TIMEOUT, pending)
        .await
        .expect("writer released")
        .expect("writer task");
    assert_eq!(status, StatusCode::Ok);

    // The accepted write really landed.
    let resp = validator.request(RequestCode::Get, handle, 0, Bytes::new()).await;
    let mut payload = resp.frame.payload;
    assert_eq!(decode_value(&mut payload).unwrap(), VarValue::UInt32(99));
}
