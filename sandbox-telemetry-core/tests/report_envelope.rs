//! Report envelope schema validation (spec.md §8 invariant 7): every
//! published message must parse back into the documented shape.

use sandbox_telemetry_core::report_emitter::ReportEnvelope;

#[test]
fn benchmarker_envelope_round_trips() {
    let envelope = ReportEnvelope {
        session_id: "6da28d7cb2b74f00b3cc23b1f224f743".to_string(),
        report_type: "benchmarker".to_string(),
        metadata: serde_json::json!({ "target_pid": 4242 }),
        result: serde_json::json!({ "sample_ms": [0, 100, 200] }),
        statistics: serde_json::json!({ "mean_cpu_percent_norm": 12.5 }),
    };

    let raw = serde_json::to_string(&envelope).unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();

    assert_eq!(value["session_id"], "6da28d7cb2b74f00b3cc23b1f224f743");
    assert_eq!(value["report_type"], "benchmarker");
    assert!(value["metadata"].is_object());
    assert!(value["result"].is_object());
    assert!(value["statistics"].is_object());

    let back: ReportEnvelope = serde_json::from_str(&raw).unwrap();
    assert_eq!(back.session_id, envelope.session_id);
    assert_eq!(back.report_type, envelope.report_type);
}

#[test]
fn container_stats_envelope_accepts_empty_statistics() {
    let envelope = ReportEnvelope {
        session_id: "abc123".to_string(),
        report_type: "container-stats".to_string(),
        metadata: serde_json::json!({ "session_id": "abc123" }),
        result: serde_json::json!({ "timestamps_s": [] }),
        statistics: serde_json::Value::Null,
    };

    let raw = serde_json::to_string(&envelope).unwrap();
    let back: ReportEnvelope = serde_json::from_str(&raw).unwrap();
    assert!(back.statistics.is_null());
}

#[test]
fn report_type_is_one_of_the_documented_three() {
    for report_type in ["benchmarker", "container-stats", "scraper"] {
        let envelope = ReportEnvelope {
            session_id: "abc123".to_string(),
            report_type: report_type.to_string(),
            metadata: serde_json::json!({}),
            result: serde_json::json!({}),
            statistics: serde_json::json!({}),
        };
        let raw = serde_json::to_string(&envelope).unwrap();
        assert!(raw.contains(report_type));
    }
}
