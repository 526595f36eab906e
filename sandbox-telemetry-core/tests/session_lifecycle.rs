//! Session persistence round-trip and state-machine shape (spec.md §8
//! invariant 5, §4.5 state machine). Exercises `PersistentStore` through the
//! `session` module without touching Docker/the queue.

use sandbox_telemetry_core::session::{Session, SessionConfiguration, SessionState};
use serial_test::serial;

fn isolated_state_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("SANDBOX_STATE_DIR", dir.path());
    dir
}

#[test]
#[serial]
fn session_round_trips_field_by_field_through_json() {
    let mut args = serde_json::Map::new();
    args.insert("binary_file".into(), "task.bin".into());
    let session = Session::new("roundtrip", "deadbeef", args, true, SessionConfiguration::default());

    let raw = serde_json::to_string(&session).unwrap();
    let back: Session = serde_json::from_str(&raw).unwrap();

    assert_eq!(session.id, back.id);
    assert_eq!(session.name, back.name);
    assert_eq!(session.sha256, back.sha256);
    assert_eq!(session.build_args, back.build_args);
    assert_eq!(session.process_monitor_flag, back.process_monitor_flag);
    assert_eq!(session.created_at, back.created_at);
    assert_eq!(session.executed_at, back.executed_at);
    assert_eq!(session.reports, back.reports);
    assert_eq!(session.state, back.state);
}

#[test]
#[serial]
fn created_at_precedes_or_equals_executed_at_when_both_present() {
    let mut args = serde_json::Map::new();
    args.insert("binary_file".into(), "task.bin".into());
    let mut session = Session::new("ordering", "deadbeef", args, false, SessionConfiguration::default());
    session.executed_at = Some(session.created_at + 50);

    assert!(session.created_at <= session.executed_at.unwrap());
}

#[test]
#[serial]
fn reports_grow_monotonically_as_strings_are_appended() {
    let mut args = serde_json::Map::new();
    args.insert("binary_file".into(), "task.bin".into());
    let mut session = Session::new("reports", "deadbeef", args, false, SessionConfiguration::default());

    assert!(session.reports.is_empty());
    session.reports.push(format!("{}-benchmarker", session.id));
    session.reports.push(format!("{}-container-stats", session.id));
    assert_eq!(session.reports.len(), 2);
}

#[test]
#[serial]
fn persist_then_load_returns_same_session() {
    let _dir = isolated_state_dir();

    let mut args = serde_json::Map::new();
    args.insert("binary_file".into(), "task.bin".into());
    let session = Session::new("persisted", "deadbeef", args, true, SessionConfiguration::default());

    sandbox_telemetry_core::session::persist_session(&session).unwrap();
    let loaded = sandbox_telemetry_core::session::load_session(&session.id).unwrap();

    assert_eq!(loaded.id, session.id);
    assert_eq!(loaded.name, session.name);
    assert_eq!(loaded.state, SessionState::Created);
}

#[test]
#[serial]
fn load_session_not_found_is_a_user_facing_not_found_error() {
    let _dir = isolated_state_dir();

    let err = sandbox_telemetry_core::session::load_session("does-not-exist").unwrap_err();
    assert!(matches!(err, sandbox_telemetry_core::error::SandboxError::NotFound(_)));
}
