use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use fahrplan_core::{
    Config, Expires, FahrplanError, ManualClock, PublishOptions, Signature, TaskMessage,
    TaskOptions, TaskState,
};
use fahrplan_dispatch::{
    current_app, current_task, App, MemoryBroker, RetryRequest, Runtime, TaskDescriptor,
    TaskOutcome,
};
use fahrplan_dispatch::task::{sync_task_fn, task_fn};
use serde_json::{json, Value};

fn start() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

fn build(name: &str) -> (App, MemoryBroker, Arc<ManualClock>) {
    let broker = MemoryBroker::new();
    let clock = Arc::new(ManualClock::new(start()));
    let config = Config {
        result_backend: Some("memory://".into()),
        ..Config::default()
    };
    let app = App::builder()
        .name(name)
        .config(config)
        .clock(clock.clone())
        .broker(broker.clone())
        .build();
    (app, broker, clock)
}

fn last_message(broker: &MemoryBroker) -> TaskMessage {
    let published = broker.published();
    let last = published.last().expect("nothing published");
    TaskMessage::from_json(&last.body).unwrap()
}

#[tokio::test]
async fn execution_stores_result_and_children() {
    let (app, broker, _) = build("exec-success");
    app.task("parent", |req| async move {
        let child = current_app()
            .send_task("child", json!([req.args[0].clone()]), json!({}), PublishOptions::new())
            .await;
        match child {
            Ok(child) => {
                assert_eq!(child.parent().map(|p| p.id().to_string()), Some(req.id.clone()));
                TaskOutcome::ok(json!({"child": child.id()}))
            }
            Err(e) => TaskOutcome::fail(e.to_string()),
        }
    });

    let handle = app
        .send_task("parent", json!([7]), json!({}), PublishOptions::new())
        .await
        .unwrap();
    let message = last_message(&broker);
    let report = app.execute_message(&message).await.unwrap();
    assert_eq!(report.state, TaskState::Success);

    let meta = handle.meta().await.unwrap();
    assert_eq!(meta.state, TaskState::Success);
    assert_eq!(meta.children.len(), 1);
    assert_eq!(report.result["child"], meta.children[0].as_str());

    let child_message = last_message(&broker);
    assert_eq!(child_message.task, "child");
    assert_eq!(child_message.args, vec![json!(7)]);

    let value = handle
        .get(Duration::from_secs(1), Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(value["child"], child_message.id.as_str());
}

#[tokio::test]
async fn retry_resends_with_same_id_until_exhausted() {
    let (app, broker, _) = build("exec-retry");
    app.register(
        TaskDescriptor::new(
            "flaky",
            sync_task_fn(|req| {
                req.retry()
                    .countdown(10.0)
                    .reason(format!("attempt {}", req.retries))
                    .into()
            }),
        )
        .with_options(TaskOptions {
            max_retries: Some(1),
            ..TaskOptions::default()
        }),
    );

    let handle = app
        .send_task("flaky", json!([]), json!({}), PublishOptions::new())
        .await
        .unwrap();
    let first = last_message(&broker);
    let report = app.execute_message(&first).await.unwrap();
    assert_eq!(report.state, TaskState::Retry);
    let retry = report.retry.expect("retry handle");
    assert_eq!(retry.id(), handle.id());

    let second = last_message(&broker);
    assert_eq!(second.id, first.id);
    assert_eq!(second.retries, 1);
    assert_eq!(second.eta.as_deref(), Some("2024-01-01T00:00:10+00:00"));
    assert_eq!(handle.state().await.unwrap(), TaskState::Retry);

    let err = app.execute_message(&second).await.unwrap_err();
    assert!(matches!(
        err,
        FahrplanError::TaskRetriesExhausted { max_retries: 1, .. }
    ));
    let meta = handle.meta().await.unwrap();
    assert_eq!(meta.state, TaskState::Failure);
    assert!(meta.traceback.unwrap().contains("max retries"));
}

#[tokio::test]
async fn retry_without_countdown_uses_default_delay() {
    let (app, broker, _) = build("exec-default-delay");
    app.register(
        TaskDescriptor::new("slow", sync_task_fn(|_| RetryRequest::default().into())).with_options(
            TaskOptions {
                default_retry_delay: Some(5.0),
                ..TaskOptions::default()
            },
        ),
    );
    app.send_task("slow", json!([]), json!({}), PublishOptions::new())
        .await
        .unwrap();
    app.execute_message(&last_message(&broker)).await.unwrap();
    assert_eq!(
        last_message(&broker).eta.as_deref(),
        Some("2024-01-01T00:00:05+00:00")
    );
}

#[tokio::test]
async fn callbacks_receive_result_and_errbacks_the_task_id() {
    let (app, broker, _) = build("exec-links");
    app.task_sync("double", |req| {
        let x = req.args.first().and_then(Value::as_i64).unwrap_or(0);
        TaskOutcome::ok(x * 2)
    });
    app.task_sync("explode", |_| TaskOutcome::fail("kaboom"));

    let opts = PublishOptions::new()
        .link(Signature::new("collect").with_args(vec![json!("tag")]))
        .link(Signature::new("audit").with_args(vec![json!("fixed")]).immutable());
    app.send_task("double", json!([21]), json!({}), opts)
        .await
        .unwrap();
    app.execute_message(&last_message(&broker)).await.unwrap();

    let published = broker.published();
    let collect = TaskMessage::from_json(&published[published.len() - 2].body).unwrap();
    let audit = TaskMessage::from_json(&published[published.len() - 1].body).unwrap();
    assert_eq!(collect.task, "collect");
    assert_eq!(collect.args, vec![json!(42), json!("tag")]);
    assert_eq!(audit.args, vec![json!("fixed")]);

    let handle = app
        .send_task(
            "explode",
            json!([]),
            json!({}),
            PublishOptions::new().link_error(Signature::new("on_error")),
        )
        .await
        .unwrap();
    let report = app.execute_message(&last_message(&broker)).await.unwrap();
    assert_eq!(report.state, TaskState::Failure);
    let errback = last_message(&broker);
    assert_eq!(errback.task, "on_error");
    assert_eq!(errback.args, vec![json!(handle.id())]);

    let err = handle
        .get(Duration::from_millis(50), Duration::from_millis(10))
        .await
        .unwrap_err();
    assert!(matches!(err, FahrplanError::TaskFailed(ref e) if e.contains("kaboom")));
}

#[tokio::test]
async fn expired_messages_are_revoked() {
    let (app, broker, clock) = build("exec-expired");
    let ran = Arc::new(AtomicU32::new(0));
    let counter = ran.clone();
    app.task_sync("late", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        TaskOutcome::ok(true)
    });
    let handle = app
        .send_task(
            "late",
            json!([]),
            json!({}),
            PublishOptions::new().expires(Expires::In(Duration::from_secs(30))),
        )
        .await
        .unwrap();
    clock.advance(Duration::from_secs(31));

    let report = app.execute_message(&last_message(&broker)).await.unwrap();
    assert_eq!(report.state, TaskState::Revoked);
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(handle.state().await.unwrap(), TaskState::Revoked);
}

#[tokio::test]
async fn ignored_results_are_not_stored_unless_errors_are_kept() {
    let (app, broker, _) = build("exec-ignore");
    app.register(
        TaskDescriptor::new("quiet", sync_task_fn(|_| TaskOutcome::ok(1))).with_options(
            TaskOptions {
                ignore_result: Some(true),
                ..TaskOptions::default()
            },
        ),
    );
    app.register(
        TaskDescriptor::new("loud_failure", sync_task_fn(|_| TaskOutcome::fail("no"))).with_options(
            TaskOptions {
                ignore_result: Some(true),
                store_errors_even_if_ignored: Some(true),
                ..TaskOptions::default()
            },
        ),
    );

    let quiet = app
        .send_task("quiet", json!([]), json!({}), PublishOptions::new())
        .await
        .unwrap();
    app.execute_message(&last_message(&broker)).await.unwrap();
    assert_eq!(quiet.state().await.unwrap(), TaskState::Pending);

    let loud = app
        .send_task("loud_failure", json!([]), json!({}), PublishOptions::new())
        .await
        .unwrap();
    app.execute_message(&last_message(&broker)).await.unwrap();
    assert_eq!(loud.state().await.unwrap(), TaskState::Failure);
}

#[tokio::test]
async fn track_started_and_signals_fire_in_order() {
    let broker = MemoryBroker::new();
    let config = Config {
        result_backend: Some("memory://".into()),
        task_track_started: true,
        ..Config::default()
    };
    let app = App::builder()
        .name("exec-signals")
        .config(config)
        .broker(broker.clone())
        .build();

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let handle_for_body = Arc::new(std::sync::Mutex::new(None));
    {
        let handle_for_body = handle_for_body.clone();
        app.task("observe", move |req| {
            let handle_for_body = handle_for_body.clone();
            async move {
                let app = current_app();
                let state = app.backend().unwrap().fetch(&req.id).await.unwrap().state;
                *handle_for_body.lock().unwrap() = Some(state);
                assert_eq!(current_task().map(|t| t.id), Some(req.id.clone()));
                TaskOutcome::ok(Value::Null)
            }
        });
    }
    for (name, signal) in [("prerun", 0), ("postrun", 1), ("success", 2)] {
        let seen = seen.clone();
        match signal {
            0 => app.signals().task_prerun.connect_fn(move |_, _| {
                seen.lock().unwrap().push(name);
                Ok(Value::Null)
            }),
            1 => app.signals().task_postrun.connect_fn(move |_, a| {
                assert_eq!(a.state, TaskState::Success);
                seen.lock().unwrap().push(name);
                Ok(Value::Null)
            }),
            _ => app.signals().task_success.connect_fn(move |_, _| {
                seen.lock().unwrap().push(name);
                Ok(Value::Null)
            }),
        };
    }

    app.send_task("observe", json!([]), json!({}), PublishOptions::new())
        .await
        .unwrap();
    app.execute_message(&last_message(&broker)).await.unwrap();
    assert_eq!(*handle_for_body.lock().unwrap(), Some(TaskState::Started));
    assert_eq!(*seen.lock().unwrap(), ["prerun", "postrun", "success"]);
}

#[tokio::test]
async fn panicking_body_is_a_failure() {
    let (app, broker, _) = build("exec-panic");
    app.task_sync("bad", |_| panic!("divide by zero"));
    let handle = app
        .send_task("bad", json!([]), json!({}), PublishOptions::new())
        .await
        .unwrap();
    let report = app.execute_message(&last_message(&broker)).await.unwrap();
    assert_eq!(report.state, TaskState::Failure);
    assert!(report.result.as_str().unwrap().contains("divide by zero"));
    assert_eq!(handle.state().await.unwrap(), TaskState::Failure);
}

#[tokio::test]
async fn apply_retries_eagerly() {
    let (app, broker, _) = build("eager");
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    app.task_sync("eventually", move |req| {
        counter.fetch_add(1, Ordering::SeqCst);
        if req.retries < 2 {
            req.retry().countdown(60.0).into()
        } else {
            TaskOutcome::ok(json!({"retries": req.retries, "eager": req.is_eager}))
        }
    });
    let out = app
        .apply("eventually", json!([]), json!({}), PublishOptions::new())
        .await
        .unwrap();
    assert!(out.successful());
    assert_eq!(out.retries, 2);
    assert_eq!(out.get().unwrap(), json!({"retries": 2, "eager": true}));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(broker.published().is_empty());

    app.task_sync("never", |req| req.retry().max_retries(1).into());
    let out = app
        .apply("never", json!([]), json!({}), PublishOptions::new())
        .await
        .unwrap();
    assert_eq!(out.state, TaskState::Failure);
    assert_eq!(out.retries, 1);
    assert!(out.get().is_err());

    let err = app
        .apply("unknown", json!([]), json!({}), PublishOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, FahrplanError::NotRegistered(_)));
}

#[tokio::test]
async fn shared_tasks_reach_every_app() {
    let (before, _, _) = build("shared-before");
    before.finalize().unwrap();
    let (pending, _, _) = build("shared-pending");

    Runtime::global().shared_task(|app: &App| {
        let name = app.name().to_string();
        TaskDescriptor::new(
            "shared.whoami",
            task_fn(move |_| {
                let name = name.clone();
                async move { TaskOutcome::ok(name) }
            }),
        )
    });

    assert!(before.registry().contains("shared.whoami"));
    assert!(!pending.registry().contains("shared.whoami"));
    let out = pending
        .apply("shared.whoami", Value::Null, Value::Null, PublishOptions::new())
        .await
        .unwrap();
    assert_eq!(out.get().unwrap(), json!("shared-pending"));
}
