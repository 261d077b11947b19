use ktune_logging::{
    init_logging, set_runtime_log_hook, set_span_hook, LoggingOptions, RuntimeLogRecord,
    SpanRecord,
};
use std::sync::{Arc, Mutex};

#[test]
fn hooks_receive_log_records_and_closed_spans() {
    let logs: Arc<Mutex<Vec<RuntimeLogRecord>>> = Arc::new(Mutex::new(Vec::new()));
    let spans: Arc<Mutex<Vec<SpanRecord>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let logs = logs.clone();
        set_runtime_log_hook(move |rec| logs.lock().unwrap().push(rec.clone()));
    }
    {
        let spans = spans.clone();
        set_span_hook(move |rec| spans.lock().unwrap().push(rec.clone()));
    }
    let _guard = init_logging(LoggingOptions::default());

    log::info!(target: "ktune::hooks", "bridged from log {}", 7);
    tracing::info_span!("ktune.tune", key = "custom_add_kernel_1_2_3_4").in_scope(|| {
        tracing::info!(candidates = 3u64, "searching");
    });

    let logs = logs.lock().unwrap();
    let bridged = logs
        .iter()
        .find(|r| r.message == "bridged from log 7")
        .expect("log record bridged");
    assert_eq!(bridged.target, "ktune::hooks");
    assert_eq!(bridged.level, "INFO");

    let inside = logs
        .iter()
        .find(|r| r.message == "searching")
        .expect("tracing event");
    assert_eq!(inside.span.as_deref(), Some("ktune.tune"));
    assert_eq!(inside.fields, Some(serde_json::json!({ "candidates": 3 })));

    let spans = spans.lock().unwrap();
    let tune = spans
        .iter()
        .find(|s| s.name == "ktune.tune")
        .expect("span closed");
    assert!(tune.elapsed_micros >= 0);
    assert_eq!(
        tune.fields,
        Some(serde_json::json!({ "key": "custom_add_kernel_1_2_3_4" }))
    );
}
