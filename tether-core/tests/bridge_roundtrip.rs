use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tether_core::{
    BridgeConfig, ChannelRegistry, ChannelSpec, Controller, ControllerConfig, HandlerError,
    RequestContext, Shape, TetherError,
};
use tokio::sync::Notify;

fn registry() -> ChannelRegistry {
    let mut reg = ChannelRegistry::new();
    reg.register(
        ChannelSpec::invoke("add")
            .param("a", Shape::Number)
            .param("b", Shape::Number)
            .returns(Shape::Number),
    )
    .expect("add");
    reg.register(ChannelSpec::invoke("hang")).expect("hang");
    reg.register(ChannelSpec::invoke("gate")).expect("gate");
    reg.register(ChannelSpec::invoke("quick")).expect("quick");
    reg.register(ChannelSpec::invoke("explode")).expect("explode");
    reg.register(ChannelSpec::send("log-message").param("message", Shape::String))
        .expect("log-message");
    reg.register(ChannelSpec::event(
        "tick",
        Shape::object([("n", Shape::Integer)]),
    ))
    .expect("tick");
    reg
}

fn controller_with(config: ControllerConfig) -> Controller {
    let c = Controller::new(registry(), config).expect("controller");
    c.handle("add", |_req: RequestContext, args: Value| async move {
        let a = args["a"].as_f64().unwrap_or_default();
        let b = args["b"].as_f64().unwrap_or_default();
        Ok::<_, HandlerError>(json!(a + b))
    })
    .expect("add handler");
    c.handle("hang", |_req: RequestContext, _args: Value| async {
        std::future::pending::<()>().await;
        Ok::<_, HandlerError>(Value::Null)
    })
    .expect("hang handler");
    c.handle("quick", |_req: RequestContext, _args: Value| async {
        Ok::<_, HandlerError>(json!("quick"))
    })
    .expect("quick handler");
    c
}

fn controller() -> Controller {
    controller_with(ControllerConfig::default())
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 1s");
}

async fn explode(_req: RequestContext, _args: Value) -> Result<Value, HandlerError> {
    panic!("native fault");
}

#[tokio::test]
async fn add_resolves_rejects_bad_shape_and_unknown_channel() {
    let c = controller();
    let bridge = c.attach().expect("attach");

    let sum = bridge.invoke("add", vec![json!(2), json!(3)]).await.expect("add");
    assert_eq!(sum.as_f64(), Some(5.0));

    let err = bridge
        .invoke("add", vec![json!("x"), json!(3)])
        .await
        .unwrap_err();
    assert!(matches!(err, TetherError::ShapeMismatch { .. }), "{err:?}");
    assert_eq!(err.code(), "SHAPE_MISMATCH");

    let err = bridge.invoke("missing", vec![]).await.unwrap_err();
    assert!(matches!(err, TetherError::UnknownChannel { ref channel } if channel == "missing"));
}

#[tokio::test]
async fn shape_violations_never_reach_the_handler() {
    let c = Controller::new(registry(), ControllerConfig::default()).expect("controller");
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    c.handle("add", move |_req: RequestContext, _args: Value| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok::<_, HandlerError>(json!(0)) }
    })
    .expect("handler");
    let bridge = c.attach().expect("attach");

    for args in [
        vec![json!("x"), json!(3)],
        vec![json!(1)],
        vec![json!(1), json!(2), json!(3)],
        vec![json!({"a": 1}), json!(2)],
    ] {
        let err = bridge.invoke("add", args).await.unwrap_err();
        assert!(matches!(err, TetherError::ShapeMismatch { .. }), "{err:?}");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unknown_channels_leave_the_handler_table_untouched() {
    let c = controller();
    let bridge = c.attach().expect("attach");
    let before = c.dispatcher().handler_count();

    for name in ["missing", "log-message", "tick", "gate", ""] {
        let err = bridge.invoke(name, vec![]).await.unwrap_err();
        assert!(matches!(err, TetherError::UnknownChannel { .. }), "{name}: {err:?}");
    }
    assert_eq!(c.dispatcher().handler_count(), before);
    assert!(!c.dispatcher().has_handler("missing"));
}

#[tokio::test]
async fn broadcast_reaches_each_listener_once_and_skips_idle_contexts() {
    let c = controller();
    let first = c.attach().expect("first");
    let second = c.attach().expect("second");
    let idle = c.attach().expect("idle");

    let hits_a = Arc::new(AtomicUsize::new(0));
    let hits_b = Arc::new(AtomicUsize::new(0));
    let (ha, hb) = (Arc::clone(&hits_a), Arc::clone(&hits_b));
    let _sa = first.on("tick", move |payload| {
        assert_eq!(payload, &json!({"n": 1}));
        ha.fetch_add(1, Ordering::SeqCst);
    });
    let _sb = second.on("tick", move |_| {
        hb.fetch_add(1, Ordering::SeqCst);
    });
    wait_until(|| {
        c.is_subscribed(first.context_id(), "tick") && c.is_subscribed(second.context_id(), "tick")
    })
    .await;
    assert!(!c.is_subscribed(idle.context_id(), "tick"));

    assert_eq!(c.broadcast("tick", json!({"n": 1})).expect("broadcast"), 2);
    wait_until(|| hits_a.load(Ordering::SeqCst) == 1 && hits_b.load(Ordering::SeqCst) == 1).await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(hits_a.load(Ordering::SeqCst), 1);
    assert_eq!(hits_b.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn invoke_times_out_at_the_configured_deadline() {
    let config = ControllerConfig {
        bridge: BridgeConfig::with_timeout(Duration::from_millis(50)),
        ..ControllerConfig::default()
    };
    let c = controller_with(config);
    let bridge = c.attach().expect("attach");

    let start = Instant::now();
    let err = bridge.invoke("hang", vec![]).await.unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(err, TetherError::Timeout { ref channel, .. } if channel == "hang"));
    assert!(elapsed >= Duration::from_millis(50), "too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(1), "too late: {elapsed:?}");

    // The bridge keeps working after a timeout.
    assert_eq!(bridge.invoke("quick", vec![]).await.expect("quick"), json!("quick"));
}

#[tokio::test]
async fn concurrent_invokes_complete_independently() {
    let c = controller();
    let gate = Arc::new(Notify::new());
    let release = Arc::clone(&gate);
    c.handle("gate", move |_req: RequestContext, _args: Value| {
        let gate = Arc::clone(&gate);
        async move {
            gate.notified().await;
            Ok::<_, HandlerError>(json!("gate"))
        }
    })
    .expect("gate handler");

    let bridge = Arc::new(c.attach().expect("attach"));
    let slow = {
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move { bridge.invoke("gate", vec![]).await })
    };
    wait_until(|| c.in_flight() == 1).await;

    // The gated call is still pending while this one completes.
    assert_eq!(bridge.invoke("quick", vec![]).await.expect("quick"), json!("quick"));
    assert!(!slow.is_finished());

    release.notify_one();
    assert_eq!(slow.await.expect("join").expect("gate"), json!("gate"));
}

#[tokio::test]
async fn unsubscribe_is_idempotent_end_to_end() {
    let c = controller();
    let bridge = c.attach().expect("attach");
    let id = bridge.context_id();

    let sub = bridge.on("tick", |_| {});
    wait_until(|| c.is_subscribed(id, "tick")).await;

    sub.unsubscribe();
    sub.unsubscribe();
    wait_until(|| !c.is_subscribed(id, "tick")).await;
    assert_eq!(c.broadcast("tick", json!({"n": 2})).expect("broadcast"), 0);
}

#[tokio::test]
async fn panicking_handler_leaves_dispatcher_serving() {
    let c = controller();
    c.handle("explode", explode).expect("explode handler");
    let bridge = c.attach().expect("attach");

    for _ in 0..3 {
        let err = bridge.invoke("explode", vec![]).await.unwrap_err();
        assert!(matches!(err, TetherError::HandlerFailure { .. }), "{err:?}");
        assert_eq!(err.code(), "HANDLER_FAILURE");
    }
    let sum = bridge.invoke("add", vec![json!(1), json!(1)]).await.expect("add");
    assert_eq!(sum.as_f64(), Some(2.0));
    assert!(c.dispatcher().has_handler("explode"));
}

#[tokio::test]
async fn handler_failure_keeps_its_code_and_message() {
    let c = controller();
    c.handle("gate", |_req: RequestContext, _args: Value| async {
        Err::<Value, _>(HandlerError::new("NOT_READY", "window not created"))
    })
    .expect("handler");
    let bridge = c.attach().expect("attach");

    match bridge.invoke("gate", vec![]).await {
        Err(TetherError::HandlerFailure { code, message }) => {
            assert_eq!(code, "NOT_READY");
            assert_eq!(message, "window not created");
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn send_reaches_the_listener_and_bad_sends_are_dropped() {
    let c = controller();
    let seen = Arc::new(parking_lot::Mutex::new(Vec::<String>::new()));
    let sink = Arc::clone(&seen);
    c.listen("log-message", move |_req: RequestContext, args: Value| {
        if let Some(msg) = args["message"].as_str() {
            sink.lock().push(msg.to_string());
        }
    })
    .expect("listener");
    let bridge = c.attach().expect("attach");

    bridge.send("log-message", vec![json!(7)]);
    bridge.send("add", vec![json!(1), json!(2)]);
    bridge.send("log-message", vec![json!("hello")]);

    wait_until(|| !seen.lock().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(*seen.lock(), vec!["hello".to_string()]);
}

#[tokio::test]
async fn teardown_force_unsubscribes_every_listener() {
    let c = controller();
    let bridge = c.attach().expect("attach");
    let id = bridge.context_id();
    let a = bridge.on("tick", |_| {});
    let b = bridge.on("tick", |_| {});
    wait_until(|| c.is_subscribed(id, "tick")).await;

    drop(bridge);
    assert!(!a.is_active());
    assert!(!b.is_active());
    wait_until(|| c.contexts().is_empty()).await;
    assert_eq!(c.broadcast("tick", json!({"n": 3})).expect("broadcast"), 0);

    // Late unsubscribe on a torn-down context is still harmless.
    a.unsubscribe();
}

#[cfg(feature = "stream")]
#[tokio::test]
async fn stream_transport_carries_the_full_protocol() {
    use tether_core::{Bridge, ContextId};

    let c = controller();
    let (ui_io, controller_io) = tokio::io::duplex(64 * 1024);
    let (cr, cw) = tokio::io::split(controller_io);
    let id = c.attach_stream(cr, cw).expect("attach stream");

    let (ur, uw) = tokio::io::split(ui_io);
    let bridge = Bridge::connect_stream(
        ContextId(99),
        ur,
        uw,
        Arc::new(registry()),
        BridgeConfig::default(),
    )
    .expect("connect");

    let sum = bridge.invoke("add", vec![json!(20), json!(22)]).await.expect("add");
    assert_eq!(sum.as_f64(), Some(42.0));
    let err = bridge.invoke("missing", vec![]).await.unwrap_err();
    assert!(matches!(err, TetherError::UnknownChannel { .. }));

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let _sub = bridge.on("tick", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    wait_until(|| c.is_subscribed(id, "tick")).await;
    c.unicast(id, "tick", json!({"n": 1})).expect("unicast");
    wait_until(|| hits.load(Ordering::SeqCst) == 1).await;

    assert_eq!(c.shutdown(), 0);
}
