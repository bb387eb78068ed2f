use std::sync::atomic::AtomicUsize;
use std::thread;

use indexmap::IndexMap;

use super::*;
use crate::task::TaskOutcome;

fn memory_app(name: &str, config: Config) -> (App, MemoryBroker) {
    let broker = MemoryBroker::new();
    let app = App::builder()
        .name(name)
        .config(config)
        .broker(broker.clone())
        .build();
    (app, broker)
}

fn with_results() -> Config {
    Config {
        result_backend: Some("memory://".into()),
        ..Config::default()
    }
}

#[test]
fn builtin_cleanup_task_is_registered() {
    let (app, _) = memory_app("builtin", Config::default());
    assert!(app.registry().contains(BACKEND_CLEANUP_TASK));
    let desc = app.get_task(BACKEND_CLEANUP_TASK).unwrap();
    assert_eq!(desc.resolved_options().ignore_result, Some(true));
}

#[test]
fn finalize_binds_annotations_over_declared_options() {
    let mut annotations = IndexMap::new();
    annotations.insert(
        "mail.*".to_string(),
        TaskOptions {
            max_retries: Some(7),
            ..TaskOptions::default()
        },
    );
    let config = Config {
        task_annotations: vec![annotations],
        task_track_started: true,
        ..Config::default()
    };
    let (app, _) = memory_app("annotated", config);
    app.register(
        TaskDescriptor::new("mail.send", sync_task_fn(|_| TaskOutcome::ok(true))).with_options(
            TaskOptions {
                max_retries: Some(2),
                ..TaskOptions::default()
            },
        ),
    );
    assert!(!app.is_finalized());

    let desc = app.get_task("mail.send").unwrap();
    assert!(app.is_finalized());
    assert!(desc.is_bound());
    assert_eq!(desc.max_retries(), 7);
    assert_eq!(desc.resolved_options().track_started, Some(true));
    assert_eq!(desc.options().max_retries, Some(2));
}

#[test]
fn finalize_runs_once() {
    let (app, _) = memory_app("once", Config::default());
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    app.signals().app_finalized.connect_fn(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Null)
    });
    app.finalize().unwrap();
    app.finalize().unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn tasks_registered_after_finalize_are_bound() {
    let (app, _) = memory_app("late", Config::default());
    app.finalize().unwrap();
    app.task_sync("late.task", |_| TaskOutcome::ok(1));
    assert!(app.get_task("late.task").unwrap().is_bound());
}

#[test]
fn concurrent_registration_and_finalize_bind_everything() {
    let (app, _) = memory_app("concurrent", Config::default());
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let app = app.clone();
            thread::spawn(move || {
                for j in 0..25 {
                    app.task_sync(&format!("t.{i}.{j}"), |_| TaskOutcome::ok(0));
                    if j == 10 {
                        app.finalize().unwrap();
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    for i in 0..8 {
        for j in 0..25 {
            let desc = app.get_task(&format!("t.{i}.{j}")).unwrap();
            assert!(desc.is_bound(), "t.{i}.{j} unbound");
        }
    }
    assert_eq!(app.registry().pending_count(), 0);
}

#[test]
fn backend_follows_config() {
    let (app, _) = memory_app("no-results", Config::default());
    assert!(!app.backend().unwrap().supports_cleanup());

    let (app, _) = memory_app("results", with_results());
    assert!(app.backend().unwrap().supports_cleanup());

    let config = Config {
        result_backend: Some("redis://localhost".into()),
        ..Config::default()
    };
    let (app, _) = memory_app("bad-results", config);
    assert!(matches!(
        app.backend(),
        Err(FahrplanError::ImproperlyConfigured(_))
    ));
}

#[test]
fn lazy_config_errors_surface_on_use() {
    let app = App::builder()
        .name("lazy")
        .config_builder(ConfigBuilder::new().without_env())
        .preconf("broker_pool_limit", "many")
        .build();
    assert!(matches!(app.conf(), Err(FahrplanError::ConfigParse(_)) | Err(FahrplanError::ImproperlyConfigured(_))));
}

#[test]
fn preconf_overrides_defaults() {
    let app = App::builder()
        .name("preconf")
        .config_builder(ConfigBuilder::new().without_env())
        .preconf("task_default_queue", "urgent")
        .build();
    assert_eq!(app.conf().unwrap().task_default_queue, "urgent");
}

#[tokio::test]
async fn send_task_rejects_malformed_arguments() {
    let (app, broker) = memory_app("shape", Config::default());
    let err = app
        .send_task("x", Value::from(1), Value::Null, PublishOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, FahrplanError::InvalidTask(_)));
    let err = app
        .send_task("x", Value::Null, json!([1]), PublishOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, FahrplanError::InvalidTask(_)));
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn declarations_happen_once_until_fork() {
    let (app, broker) = memory_app("declare", Config::default());
    let declared = Arc::new(AtomicUsize::new(0));
    let counter = declared.clone();
    app.signals().after_fork.connect_fn(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Null)
    });

    for _ in 0..3 {
        app.send_task("t", json!([]), json!({}), PublishOptions::new().queue("q"))
            .await
            .unwrap();
    }
    assert_eq!(broker.queue_len("q"), 3);
    assert_eq!(lock(&app.connections().declared).len(), 1);

    app.after_fork();
    assert!(lock(&app.connections().declared).is_empty());
    assert_eq!(declared.load(Ordering::SeqCst), 1);
    assert_eq!(app.pool().unwrap().idle_count(), 0);
}

#[tokio::test]
async fn own_connections_leave_the_primary_pool_alone() {
    let (app, broker) = memory_app("own-conns", Config::default());
    app.send_task("t", json!([]), json!({}), PublishOptions::new().queue("q"))
        .await
        .unwrap();
    let primary = app.pool().unwrap();
    assert_eq!(primary.idle_count(), 1);

    let side = app.with_own_connections();
    assert_eq!(side.name(), app.name());
    assert!(!Arc::ptr_eq(&primary, &side.pool().unwrap()));

    side.after_fork();
    assert_eq!(primary.idle_count(), 1);
    assert_eq!(lock(&app.connections().declared).len(), 1);

    side.send_task("t", json!([]), json!({}), PublishOptions::new().queue("q"))
        .await
        .unwrap();
    assert_eq!(broker.queue_len("q"), 2);
    assert_eq!(side.pool().unwrap().idle_count(), 1);
}

#[tokio::test]
async fn cleanup_task_purges_expired_results() {
    use chrono::TimeZone;
    use fahrplan_core::{ManualClock, TaskState};

    use crate::result::TaskMeta;

    let clock = Arc::new(ManualClock::new(
        chrono::Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    ));
    let config = Config {
        result_expires: Some(60),
        ..with_results()
    };
    let app = App::builder()
        .name("cleanup")
        .config(config)
        .clock(clock.clone())
        .broker(MemoryBroker::new())
        .build();
    let backend = app.backend().unwrap();
    backend
        .store(TaskMeta::new("old", TaskState::Success, json!(1)))
        .await
        .unwrap();
    clock.advance(std::time::Duration::from_secs(120));

    let out = app
        .apply(BACKEND_CLEANUP_TASK, Value::Null, Value::Null, PublishOptions::new())
        .await
        .unwrap();
    assert_eq!(out.get().unwrap(), json!(1));
    assert_eq!(backend.fetch("old").await.unwrap().state, TaskState::Pending);
}
