// ============================================================================
// Supervisor Tests
// ============================================================================

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{Supervisor, TranscodeEvent};
use crate::bus::{MediaBus, SourceEvent};
use crate::config::ConfigStore;

/// Long-running stand-in for the encoder binary; ignores its arguments.
fn sleeper_bin(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("transcode-hub-sup-{}-{}", name, std::process::id()));
    std::fs::write(&path, "#!/bin/sh\nsleep 30\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn base_store(bin: &str) -> ConfigStore {
    let mut store = ConfigStore::new();
    store.set("transcode.enable", "1");
    store.set("transcode.ffmpeg_bin", bin);
    store.set("transcode.temp_dir", "/tmp/transcode-hub-test");
    store.set("templates.sd", "-vcodec libx264 -b:v 500k -vf scale=640:360");
    store.set("templates.hd", "-vcodec libx264 -b:v 2000k");
    store
}

fn collect_events(supervisor: &Supervisor) -> Arc<Mutex<Vec<TranscodeEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let events_clone = Arc::clone(&events);
    supervisor.set_event_callback(Arc::new(move |event| {
        events_clone.lock().unwrap().push(event.clone());
    }));
    events
}

async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..50 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

// ------------------------------------------------------------------------
// Lifecycle
// ------------------------------------------------------------------------

#[tokio::test]
async fn test_start_disabled_returns_false() {
    let supervisor = Supervisor::new();
    let bus = MediaBus::new();
    let mut store = ConfigStore::new();
    store.set("transcode.enable", "0");
    assert!(!supervisor.start(&store, &bus));
    assert!(!supervisor.is_running());
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let bin = sleeper_bin("idem");
    let supervisor = Supervisor::new();
    let bus = MediaBus::new();
    let store = base_store(bin.to_str().unwrap());

    assert!(supervisor.start(&store, &bus));
    assert!(supervisor.start(&store, &bus));
    assert!(supervisor.is_running());

    supervisor.stop().await;
    supervisor.stop().await;
    assert!(!supervisor.is_running());
    std::fs::remove_file(&bin).ok();
}

#[tokio::test]
async fn test_start_transcode_rejected_when_not_running() {
    let supervisor = Supervisor::new();
    assert!(supervisor.start_transcode("live", "cam1", &["sd".to_string()], None).is_err());
}

// ------------------------------------------------------------------------
// Start / stop / dedup
// ------------------------------------------------------------------------

#[tokio::test]
async fn test_start_and_stop_roundtrip() {
    let bin = sleeper_bin("roundtrip");
    let supervisor = Supervisor::new();
    let bus = MediaBus::new();
    supervisor.start(&base_store(bin.to_str().unwrap()), &bus);
    let events = collect_events(&supervisor);

    let task_id = supervisor.start_transcode("live", "cam1", &["sd".to_string()], None).unwrap();
    assert!(task_id.starts_with("live_cam1_"));
    assert!(supervisor.has_task("live", "cam1"));
    assert_eq!(supervisor.running_task_count(), 1);
    assert_eq!(supervisor.running_session_count(), 1);

    let task = supervisor.task("live", "cam1").unwrap();
    assert_eq!(task.task_id, task_id);
    assert_eq!(task.input_url, "rtmp://127.0.0.1:1935/live/cam1");
    assert_eq!(task.templates, vec!["sd".to_string()]);
    assert!(!task.auto_started);
    assert_eq!(supervisor.task_by_id(&task_id).unwrap().task_id, task_id);

    let sessions = supervisor.running_sessions_info();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].output_url, "rtmp://127.0.0.1:1935/live/cam1_sd");

    assert!(supervisor.stop_transcode("live", "cam1").await);
    assert!(!supervisor.has_task("live", "cam1"));
    assert_eq!(supervisor.running_task_count(), 0);
    assert_eq!(supervisor.running_session_count(), 0);
    assert!(supervisor.running_sessions_info().is_empty());
    // Monotonic totals survive the stop.
    assert_eq!(supervisor.total_task_count(), 1);
    assert_eq!(supervisor.total_session_count(), 1);

    let events = events.lock().unwrap();
    assert!(matches!(&events[0], TranscodeEvent::Start { app, stream } if app == "live" && stream == "cam1"));
    assert!(matches!(events.last().unwrap(), TranscodeEvent::Stop { .. }));

    supervisor.stop().await;
    std::fs::remove_file(&bin).ok();
}

#[tokio::test]
async fn test_duplicate_task_rejected() {
    let bin = sleeper_bin("dup");
    let supervisor = Supervisor::new();
    let bus = MediaBus::new();
    supervisor.start(&base_store(bin.to_str().unwrap()), &bus);

    assert!(supervisor.start_transcode("app", "s", &["sd".to_string()], None).is_ok());
    assert!(supervisor.start_transcode("app", "s", &["sd".to_string()], None).is_err());
    assert_eq!(supervisor.tasks().len(), 1);

    supervisor.stop().await;
    std::fs::remove_file(&bin).ok();
}

#[tokio::test]
async fn test_stop_by_task_id() {
    let bin = sleeper_bin("byid");
    let supervisor = Supervisor::new();
    let bus = MediaBus::new();
    supervisor.start(&base_store(bin.to_str().unwrap()), &bus);

    let task_id = supervisor.start_transcode("live", "cam1", &["sd".to_string()], None).unwrap();
    assert!(supervisor.stop_transcode_by_id(&task_id).await);
    assert!(!supervisor.stop_transcode_by_id(&task_id).await);
    assert!(!supervisor.has_task("live", "cam1"));

    supervisor.stop().await;
    std::fs::remove_file(&bin).ok();
}

#[tokio::test]
async fn test_stop_unknown_returns_false_and_queries_empty() {
    let bin = sleeper_bin("unknown");
    let supervisor = Supervisor::new();
    let bus = MediaBus::new();
    supervisor.start(&base_store(bin.to_str().unwrap()), &bus);

    assert!(!supervisor.stop_transcode("nope", "nothing").await);
    assert!(supervisor.task("nope", "nothing").is_none());
    assert!(supervisor.task_by_id("bogus").is_none());

    supervisor.stop().await;
    std::fs::remove_file(&bin).ok();
}

#[tokio::test]
async fn test_multiple_templates_one_task() {
    let bin = sleeper_bin("multi");
    let supervisor = Supervisor::new();
    let bus = MediaBus::new();
    supervisor.start(&base_store(bin.to_str().unwrap()), &bus);

    supervisor
        .start_transcode("live", "cam1", &["sd".to_string(), "hd".to_string()], None)
        .unwrap();
    assert_eq!(supervisor.running_session_count(), 2);
    let task = supervisor.task("live", "cam1").unwrap();
    assert_eq!(task.total_sessions, 2);
    assert_eq!(task.running_sessions, 2);

    let mut outputs: Vec<String> =
        supervisor.running_sessions_info().into_iter().map(|s| s.output_url).collect();
    outputs.sort();
    assert_eq!(
        outputs,
        vec![
            "rtmp://127.0.0.1:1935/live/cam1_hd".to_string(),
            "rtmp://127.0.0.1:1935/live/cam1_sd".to_string(),
        ]
    );

    supervisor.stop().await;
    std::fs::remove_file(&bin).ok();
}

#[tokio::test]
async fn test_explicit_input_url_override() {
    let bin = sleeper_bin("override");
    let supervisor = Supervisor::new();
    let bus = MediaBus::new();
    supervisor.start(&base_store(bin.to_str().unwrap()), &bus);

    supervisor
        .start_transcode("live", "cam1", &["sd".to_string()], Some("rtsp://10.0.0.2/door"))
        .unwrap();
    assert_eq!(supervisor.task("live", "cam1").unwrap().input_url, "rtsp://10.0.0.2/door");

    supervisor.stop().await;
    std::fs::remove_file(&bin).ok();
}

// ------------------------------------------------------------------------
// Admission
// ------------------------------------------------------------------------

#[tokio::test]
async fn test_admission_limit() {
    let bin = sleeper_bin("admission");
    let supervisor = Supervisor::new();
    let bus = MediaBus::new();
    let mut store = base_store(bin.to_str().unwrap());
    store.set("transcode.max_concurrent", "2");
    supervisor.start(&store, &bus);
    let events = collect_events(&supervisor);

    assert!(supervisor.start_transcode("live", "a", &["sd".to_string()], None).is_ok());
    assert!(supervisor.start_transcode("live", "b", &["sd".to_string()], None).is_ok());
    assert!(supervisor.start_transcode("live", "c", &["sd".to_string()], None).is_err());
    assert_eq!(supervisor.tasks().len(), 2);

    // The rejected start fires no event.
    let starts = events.lock().unwrap().iter().filter(|e| matches!(e, TranscodeEvent::Start { .. })).count();
    assert_eq!(starts, 2);

    supervisor.stop().await;
    std::fs::remove_file(&bin).ok();
}

#[tokio::test]
async fn test_max_concurrent_zero_admits_nothing() {
    let bin = sleeper_bin("zero");
    let supervisor = Supervisor::new();
    let bus = MediaBus::new();
    let mut store = base_store(bin.to_str().unwrap());
    store.set("transcode.max_concurrent", "0");
    supervisor.start(&store, &bus);

    assert!(supervisor.start_transcode("live", "cam1", &["sd".to_string()], None).is_err());
    assert!(supervisor.tasks().is_empty());

    supervisor.stop().await;
    std::fs::remove_file(&bin).ok();
}

#[tokio::test]
async fn test_no_rules_no_templates_rejects() {
    let bin = sleeper_bin("norules");
    let supervisor = Supervisor::new();
    let bus = MediaBus::new();
    supervisor.start(&base_store(bin.to_str().unwrap()), &bus);

    assert!(supervisor.start_transcode("live", "cam1", &[], None).is_err());

    supervisor.stop().await;
    std::fs::remove_file(&bin).ok();
}

// ------------------------------------------------------------------------
// Session results and sweep
// ------------------------------------------------------------------------

#[tokio::test]
async fn test_session_success_event_and_sweep() {
    // /bin/true exits 0 immediately: one session_success, then the sweep
    // collects the task.
    let supervisor = Supervisor::new();
    let bus = MediaBus::new();
    supervisor.start(&base_store("/bin/true"), &bus);
    let events = collect_events(&supervisor);

    supervisor.start_transcode("live", "cam1", &["sd".to_string()], None).unwrap();

    assert!(
        wait_for(|| {
            events
                .lock()
                .unwrap()
                .iter()
                .any(|e| matches!(e, TranscodeEvent::SessionSuccess { template, .. } if template == "sd"))
        })
        .await
    );
    let successes = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, TranscodeEvent::SessionSuccess { .. }))
        .count();
    assert_eq!(successes, 1);

    supervisor.cleanup_finished_tasks();
    assert!(!supervisor.has_task("live", "cam1"));
    assert_eq!(supervisor.running_task_count(), 0);
    assert_eq!(supervisor.running_session_count(), 0);

    supervisor.stop().await;
}

#[tokio::test]
async fn test_session_error_event_carries_status() {
    let supervisor = Supervisor::new();
    let bus = MediaBus::new();
    supervisor.start(&base_store("/bin/false"), &bus);
    let events = collect_events(&supervisor);

    supervisor.start_transcode("live", "cam1", &["sd".to_string()], None).unwrap();

    assert!(
        wait_for(|| {
            events
                .lock()
                .unwrap()
                .iter()
                .any(|e| matches!(e, TranscodeEvent::SessionError { error, .. } if error.contains("status: 1")))
        })
        .await
    );
    let errors = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, TranscodeEvent::SessionError { .. }))
        .count();
    assert_eq!(errors, 1);

    supervisor.stop().await;
}

#[tokio::test]
async fn test_sweep_updates_error_counters() {
    let supervisor = Supervisor::new();
    let bus = MediaBus::new();
    supervisor.start(&base_store("/bin/false"), &bus);

    supervisor.start_transcode("live", "cam1", &["sd".to_string()], None).unwrap();
    assert!(wait_for(|| supervisor.running_sessions_info().is_empty()).await);

    supervisor.cleanup_finished_tasks();
    // All sessions errored out, so the task is gone and the gauge is zero.
    assert!(!supervisor.has_task("live", "cam1"));
    assert_eq!(supervisor.running_session_count(), 0);

    supervisor.stop().await;
}

// ------------------------------------------------------------------------
// Media-source events
// ------------------------------------------------------------------------

#[tokio::test]
async fn test_rule_driven_auto_start() {
    let bin = sleeper_bin("autostart");
    let supervisor = Supervisor::new();
    let bus = MediaBus::new();
    let mut store = base_store(bin.to_str().unwrap());
    store.set("rules.live/*", "sd");
    supervisor.start(&store, &bus);
    let events = collect_events(&supervisor);

    bus.publish(SourceEvent::Changed {
        app: "live".to_string(),
        stream: "cam1".to_string(),
        registered: true,
    });

    assert!(wait_for(|| supervisor.has_task("live", "cam1")).await);
    let task = supervisor.task("live", "cam1").unwrap();
    assert!(task.auto_started);
    assert_eq!(task.templates, vec!["sd".to_string()]);
    let sessions = supervisor.running_sessions_info();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].output_url, "rtmp://127.0.0.1:1935/live/cam1_sd");
    assert!(events.lock().unwrap().iter().any(|e| matches!(e, TranscodeEvent::Start { .. })));

    // A non-matching app stays ignored.
    bus.publish(SourceEvent::Changed {
        app: "vod".to_string(),
        stream: "cam2".to_string(),
        registered: true,
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!supervisor.has_task("vod", "cam2"));

    supervisor.stop().await;
    std::fs::remove_file(&bin).ok();
}

#[tokio::test]
async fn test_auto_stop_on_unregister() {
    let bin = sleeper_bin("autostop");
    let supervisor = Supervisor::new();
    let bus = MediaBus::new();
    let mut store = base_store(bin.to_str().unwrap());
    store.set("rules.live/*", "sd");
    supervisor.start(&store, &bus);
    let events = collect_events(&supervisor);

    bus.publish(SourceEvent::Changed {
        app: "live".to_string(),
        stream: "cam1".to_string(),
        registered: true,
    });
    assert!(wait_for(|| supervisor.has_task("live", "cam1")).await);

    bus.publish(SourceEvent::Changed {
        app: "live".to_string(),
        stream: "cam1".to_string(),
        registered: false,
    });
    assert!(wait_for(|| !supervisor.has_task("live", "cam1")).await);

    let stops = events.lock().unwrap().iter().filter(|e| matches!(e, TranscodeEvent::Stop { .. })).count();
    assert_eq!(stops, 1);

    supervisor.stop().await;
    std::fs::remove_file(&bin).ok();
}

#[tokio::test]
async fn test_no_readers_keeps_task() {
    let bin = sleeper_bin("noreaders");
    let supervisor = Supervisor::new();
    let bus = MediaBus::new();
    supervisor.start(&base_store(bin.to_str().unwrap()), &bus);

    supervisor.start_transcode("live", "cam1", &["sd".to_string()], None).unwrap();
    bus.publish(SourceEvent::NoReaders { app: "live".to_string(), stream: "cam1".to_string() });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(supervisor.has_task("live", "cam1"));

    supervisor.stop().await;
    std::fs::remove_file(&bin).ok();
}

#[tokio::test]
async fn test_events_after_stop_are_dropped() {
    let bin = sleeper_bin("afterstop");
    let supervisor = Supervisor::new();
    let bus = MediaBus::new();
    let mut store = base_store(bin.to_str().unwrap());
    store.set("rules.live/*", "sd");
    supervisor.start(&store, &bus);
    supervisor.stop().await;

    bus.publish(SourceEvent::Changed {
        app: "live".to_string(),
        stream: "cam1".to_string(),
        registered: true,
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!supervisor.has_task("live", "cam1"));
    std::fs::remove_file(&bin).ok();
}

// ------------------------------------------------------------------------
// Invariants
// ------------------------------------------------------------------------

#[tokio::test]
async fn test_secondary_index_resolves_back() {
    let bin = sleeper_bin("index");
    let supervisor = Supervisor::new();
    let bus = MediaBus::new();
    supervisor.start(&base_store(bin.to_str().unwrap()), &bus);

    supervisor.start_transcode("live", "a", &["sd".to_string()], None).unwrap();
    supervisor.start_transcode("live", "b", &["sd".to_string()], None).unwrap();

    for task in supervisor.tasks() {
        let resolved = supervisor.task(&task.app, &task.stream).unwrap();
        assert_eq!(resolved.task_id, task.task_id);
    }

    supervisor.stop().await;
    std::fs::remove_file(&bin).ok();
}

#[tokio::test]
async fn test_supervisor_stop_leaves_no_running_sessions() {
    let bin = sleeper_bin("shutdown");
    let supervisor = Supervisor::new();
    let bus = MediaBus::new();
    supervisor.start(&base_store(bin.to_str().unwrap()), &bus);

    supervisor.start_transcode("live", "a", &["sd".to_string(), "hd".to_string()], None).unwrap();
    supervisor.start_transcode("live", "b", &["sd".to_string()], None).unwrap();
    assert_eq!(supervisor.running_session_count(), 3);

    supervisor.stop().await;
    assert_eq!(supervisor.running_session_count(), 0);
    assert_eq!(supervisor.running_task_count(), 0);
    assert!(supervisor.tasks().is_empty());
    assert!(supervisor.running_sessions_info().is_empty());

    std::fs::remove_file(&bin).ok();
}
