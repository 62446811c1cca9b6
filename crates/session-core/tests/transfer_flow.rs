//! Inbound transfer requests and sipfrag progress reports

mod common;

use common::*;
use rsua_session_core::{CallId, CallState, Engine, SignalingEvent, UaEvent, VideoMode};
use serial_test::serial;

/// An established incoming call from Bob
fn established_call(engine: &mut Engine) -> CallId {
    let sender = engine.signaling_sender(ALICE);
    let id = CallId::from("bob-1");
    sender
        .send(SignalingEvent::Incoming {
            call: id.clone(),
            from: BOB.to_string(),
            media: vec![remote_audio(42000)],
        })
        .unwrap();
    engine.poll_pending();
    engine.answer(&id, 200, VideoMode::Off).unwrap();
    id
}

#[tokio::test]
#[serial]
async fn test_failed_transfer_notifies_transferor() {
    let (mut engine, signaling) = engine();
    let mut events = engine.subscribe();
    let sender = engine.signaling_sender(ALICE);
    let original = established_call(&mut engine);
    signaling.fail_connect_to(CAROL);

    sender
        .send(SignalingEvent::Transfer {
            call: original.clone(),
            uri: CAROL.to_string(),
        })
        .unwrap();
    engine.poll_pending();

    assert_eq!(
        signaling.sipfrags(),
        vec![(original.clone(), 500, "Call Error".to_string())]
    );
    // The child was discarded and the original is untouched
    assert_eq!(engine.context().call_count(), 1);
    assert_eq!(engine.call_info(&original).unwrap().state, CallState::Established);
    assert!(drain(&mut events).contains(&UaEvent::CallTransfer {
        call: original,
        uri: CAROL.to_string(),
    }));
}

#[tokio::test]
#[serial]
async fn test_transfer_child_reports_success() {
    let (mut engine, signaling) = engine();
    let sender = engine.signaling_sender(ALICE);
    let original = established_call(&mut engine);

    let child = engine.transfer(&original, CAROL).unwrap();
    let info = engine.call_info(&child).unwrap();
    assert_eq!(info.transferred_from, Some(original.clone()));
    assert_eq!(info.peer, CAROL);
    assert_eq!(info.linenum, 2);
    assert!(signaling.sipfrags().is_empty());

    sender
        .send(SignalingEvent::Established {
            call: child.clone(),
            media: vec![remote_audio(42010)],
        })
        .unwrap();
    engine.poll_pending();

    assert_eq!(signaling.sipfrags(), vec![(original, 200, "OK".to_string())]);
}

#[tokio::test]
#[serial]
async fn test_transfer_child_rejected_reports_code() {
    let (mut engine, signaling) = engine();
    let sender = engine.signaling_sender(ALICE);
    let original = established_call(&mut engine);
    let child = engine.transfer(&original, CAROL).unwrap();

    sender
        .send(SignalingEvent::Closed {
            call: child,
            code: 486,
            reason: "Busy Here".to_string(),
        })
        .unwrap();
    engine.poll_pending();

    assert_eq!(signaling.sipfrags(), vec![(original.clone(), 486, "Busy Here".to_string())]);
    assert!(engine.call_info(&original).is_some());
}

#[tokio::test]
#[serial]
async fn test_transfer_failed_is_forwarded() {
    let (mut engine, _signaling) = engine();
    let mut events = engine.subscribe();
    let sender = engine.signaling_sender(ALICE);
    let original = established_call(&mut engine);

    sender
        .send(SignalingEvent::TransferFailed {
            call: original.clone(),
            reason: "603 Declined".to_string(),
        })
        .unwrap();
    engine.poll_pending();

    assert!(drain(&mut events).contains(&UaEvent::CallTransferFailed {
        call: original,
        reason: "603 Declined".to_string(),
    }));
}
