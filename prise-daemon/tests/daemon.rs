mod support;

use prise_protocol::{Message, Value};
use support::DaemonProc;

#[test]
fn daemon_starts_and_answers_ping() -> anyhow::Result<()> {
    let daemon = DaemonProc::spawn()?;
    let mut client = daemon.connect()?;

    let resp = client.request("ping", Value::Array(vec![]))?;
    match resp {
        Message::Response { error, result, .. } => {
            assert_eq!(error, Value::Nil);
            assert_eq!(result, Value::from("pong"));
        }
        other => panic!("expected a response, got {other:?}"),
    }
    Ok(())
}

#[test]
fn spawn_attach_write_and_detach_round_trip() -> anyhow::Result<()> {
    let daemon = DaemonProc::spawn()?;
    let mut client = daemon.connect()?;

    let spawn_resp = client.request("spawn_pty", Value::Array(vec![Value::from(24u64), Value::from(80u64)]))?;
    let session_id = match spawn_resp {
        Message::Response { error, result, .. } => {
            assert_eq!(error, Value::Nil, "spawn_pty should not fail");
            result.as_u64().expect("spawn_pty should return a session id")
        }
        other => panic!("expected a response, got {other:?}"),
    };

    let attach_resp = client.request("attach_pty", Value::Array(vec![Value::from(session_id)]))?;
    match attach_resp {
        Message::Response { error, .. } => assert_eq!(error, Value::Nil, "attach_pty should not fail"),
        other => panic!("expected a response, got {other:?}"),
    }

    // Attaching schedules an immediate full redraw; the daemon should push
    // it as a notification before answering anything else.
    let redraw = client.read_one()?;
    match redraw {
        Message::Notification { method, .. } => assert_eq!(method, "redraw"),
        other => panic!("expected a redraw notification, got {other:?}"),
    }

    client.notify(
        "write_pty",
        Value::Array(vec![Value::from(session_id), Value::Binary(b"echo hi\n".to_vec())]),
    )?;

    let detach_resp = client.request("detach_pty", Value::Array(vec![Value::from(session_id)]))?;
    match detach_resp {
        Message::Response { error, .. } => assert_eq!(error, Value::Nil, "detach_pty should not fail"),
        other => panic!("expected a response, got {other:?}"),
    }

    Ok(())
}

#[test]
fn unknown_method_is_reported_as_an_error_response() -> anyhow::Result<()> {
    let daemon = DaemonProc::spawn()?;
    let mut client = daemon.connect()?;

    let resp = client.request("not_a_real_method", Value::Array(vec![]))?;
    match resp {
        Message::Response { error, .. } => assert_ne!(error, Value::Nil),
        other => panic!("expected a response, got {other:?}"),
    }
    Ok(())
}

#[test]
fn attach_pty_with_unknown_session_is_rejected() -> anyhow::Result<()> {
    let daemon = DaemonProc::spawn()?;
    let mut client = daemon.connect()?;

    let resp = client.request("attach_pty", Value::Array(vec![Value::from(99_999u64)]))?;
    match resp {
        Message::Response { error, .. } => assert_ne!(error, Value::Nil),
        other => panic!("expected a response, got {other:?}"),
    }
    Ok(())
}
