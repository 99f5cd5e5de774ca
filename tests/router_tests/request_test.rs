use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use busline::config::RouterConfig;
use busline::event::{
    handler_fn, sync_handler, AddressRouter, DeliveryOptions, Message, RouterError,
};
use busline::Value;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;

fn quick() -> DeliveryOptions {
    DeliveryOptions::new().timeout(Duration::from_millis(200))
}

fn echo_router() -> AddressRouter {
    let router = AddressRouter::default();
    router.subscribe(
        "example.address",
        sync_handler(|message: Message| {
            let body = message.body().as_str().unwrap_or_default();
            message.reply(format!("{} is processed", body));
            Ok(())
        }),
    );
    router
}

#[tokio::test]
async fn test_request_reply() {
    let router = echo_router();
    let reply = router.request("example.address", "hello").await.unwrap();
    assert_eq!(reply, Value::from("hello is processed"));
    assert_eq!(router.pending_requests(), 0);
}

#[tokio::test]
async fn test_request_reply_with_structured_body() {
    let router = AddressRouter::default();
    router.subscribe(
        "calc.add",
        sync_handler(|message: Message| {
            let a = message.body()["a"].as_i64().unwrap_or(0);
            let b = message.body()["b"].as_i64().unwrap_or(0);
            message.reply(json!({ "sum": a + b }));
            Ok(())
        }),
    );

    let reply = router.request("calc.add", json!({ "a": 2, "b": 40 })).await.unwrap();
    assert_eq!(reply, json!({ "sum": 42 }));
}

#[tokio::test]
async fn test_request_without_handler() {
    let router = AddressRouter::default();
    let result = router.request("missing", "x").await;
    assert_eq!(
        result,
        Err(RouterError::NoHandlerRegistered {
            address: "missing".to_string()
        })
    );
    assert_eq!(router.pending_requests(), 0);
}

#[tokio::test]
async fn test_only_first_reply_counts() {
    let router = AddressRouter::default();
    let (tx, mut rx) = mpsc::unbounded_channel();
    router.subscribe(
        "a",
        sync_handler(move |message: Message| {
            let first = message.reply("first");
            let second = message.reply("second");
            let failed = message.fail(500, "too late");
            tx.send((first, second, failed))?;
            Ok(())
        }),
    );

    let reply = router.request_with_options("a", "x", quick()).await.unwrap();
    assert_eq!(reply, Value::from("first"));
    assert_eq!(rx.recv().await.unwrap(), (true, false, false));
}

#[tokio::test]
async fn test_request_with_unbounded_timeout() {
    let router = echo_router();
    let reply = router
        .request_with_options(
            "example.address",
            "hello",
            DeliveryOptions::new().timeout(Duration::MAX),
        )
        .await
        .unwrap();
    assert_eq!(reply, Value::from("hello is processed"));
    assert_eq!(router.pending_requests(), 0);
}

#[tokio::test]
async fn test_configured_unbounded_timeout() {
    let config = RouterConfig::from_str(r#"{"default_request_timeout": 18446744073709551615}"#)
        .unwrap();
    let router = AddressRouter::new(config);
    router.subscribe(
        "a",
        sync_handler(|message: Message| {
            message.reply("ok");
            Ok(())
        }),
    );
    assert_eq!(router.request("a", "x").await, Ok(Value::from("ok")));
}

#[tokio::test(start_paused = true)]
async fn test_request_times_out_without_reply() {
    let router = AddressRouter::default();
    router.subscribe("silent", sync_handler(|_| Ok(())));

    let started = tokio::time::Instant::now();
    let result = router
        .request_with_options(
            "silent",
            "anyone?",
            DeliveryOptions::new().timeout(Duration::from_secs(3)),
        )
        .await;

    assert!(matches!(
        result,
        Err(RouterError::Timeout { ref address, timeout_ms: 3000, .. }) if address == "silent"
    ));
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(router.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_default_timeout_from_config() {
    let config = RouterConfig::default().with_request_timeout(Duration::from_millis(750));
    let router = AddressRouter::new(config);
    router.subscribe("silent", sync_handler(|_| Ok(())));

    let result = router.request("silent", "x").await;
    assert!(matches!(result, Err(RouterError::Timeout { timeout_ms: 750, .. })));
}

#[tokio::test(start_paused = true)]
async fn test_late_reply_is_noop() {
    let router = AddressRouter::default();
    let (held_tx, held_rx) = oneshot::channel::<Message>();
    let held_tx = std::sync::Mutex::new(Some(held_tx));
    router.subscribe(
        "slow",
        sync_handler(move |message: Message| {
            if let Some(tx) = held_tx.lock().unwrap().take() {
                let _ = tx.send(message);
            }
            Ok(())
        }),
    );

    let result = router.request_with_options("slow", "x", quick()).await;
    assert!(matches!(result, Err(RouterError::Timeout { .. })));

    let message = held_rx.await.unwrap();
    assert!(!message.reply_channel().unwrap().is_pending());
    assert!(!message.reply("too late"));
}

#[tokio::test]
async fn test_reply_from_another_task() {
    let router = AddressRouter::default();
    router.subscribe(
        "deferred",
        sync_handler(|message: Message| {
            let reply = message.reply_channel().cloned();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                if let Some(reply) = reply {
                    reply.reply("done later");
                }
            });
            Ok(())
        }),
    );

    let reply = router.request("deferred", "x").await.unwrap();
    assert_eq!(reply, Value::from("done later"));
}

#[tokio::test]
async fn test_recipient_failure() {
    let router = AddressRouter::default();
    router.subscribe(
        "strict",
        sync_handler(|message: Message| {
            message.fail(400, "body must be a number");
            Ok(())
        }),
    );

    let result = router.request("strict", "not a number").await;
    assert_eq!(
        result,
        Err(RouterError::RecipientFailure {
            address: "strict".to_string(),
            code: 400,
            message: "body must be a number".to_string(),
        })
    );
}

#[tokio::test]
async fn test_handler_error_after_reply_keeps_reply() {
    let router = AddressRouter::default();
    router.subscribe(
        "a",
        sync_handler(|message: Message| {
            message.reply("ok");
            Err(anyhow::anyhow!("cleanup failed"))
        }),
    );

    let reply = router.request_with_options("a", "x", quick()).await.unwrap();
    assert_eq!(reply, Value::from("ok"));
}

#[tokio::test]
async fn test_handler_panic_fails_request() {
    let router = AddressRouter::default();
    router.subscribe("a", sync_handler(|_| panic!("cannot cope")));

    let result = router.request_with_options("a", "x", quick()).await;
    assert_eq!(
        result,
        Err(RouterError::HandlerFailed {
            address: "a".to_string(),
            message: "cannot cope".to_string(),
        })
    );
}

#[tokio::test]
async fn test_requests_rotate_between_handlers() {
    let router = AddressRouter::default();
    for name in ["r1", "r2"] {
        router.subscribe(
            "svc",
            sync_handler(move |message: Message| {
                message.reply(name);
                Ok(())
            }),
        );
    }

    let first = router.request("svc", "x").await.unwrap();
    let second = router.request("svc", "x").await.unwrap();
    let third = router.request("svc", "x").await.unwrap();
    assert_eq!(first, Value::from("r1"));
    assert_eq!(second, Value::from("r2"));
    assert_eq!(third, Value::from("r1"));
}

#[tokio::test]
async fn test_concurrent_requests_are_correlated() {
    let router = AddressRouter::default();
    let handled = Arc::new(AtomicUsize::new(0));
    let counter = handled.clone();
    router.subscribe(
        "double",
        handler_fn(move |message: Message| {
            let counter = counter.clone();
            async move {
                let n = message.body().as_i64().unwrap_or(0);
                // later requests finish first
                tokio::time::sleep(Duration::from_millis(50 - n as u64)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                message.reply(n * 2);
                Ok(())
            }
        }),
    );

    let requests = (0..10).map(|n| {
        let router = router.clone();
        tokio::spawn(async move { (n, router.request("double", n).await) })
    });
    for task in futures::future::join_all(requests).await {
        let (n, result) = task.unwrap();
        assert_eq!(result.unwrap(), Value::from(n * 2));
    }
    assert_eq!(handled.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn test_close_fails_pending_requests() {
    let router = AddressRouter::default();
    router.subscribe("silent", sync_handler(|_| Ok(())));

    let pending = tokio::spawn({
        let router = router.clone();
        async move { router.request("silent", "x").await }
    });
    while router.pending_requests() == 0 {
        tokio::task::yield_now().await;
    }

    router.close();

    assert_eq!(pending.await.unwrap(), Err(RouterError::RouterClosed));
    assert_eq!(router.request("silent", "x").await, Err(RouterError::RouterClosed));
}

#[tokio::test]
async fn test_abandoned_request_is_cleaned_up() {
    let router = AddressRouter::default();
    router.subscribe("silent", sync_handler(|_| Ok(())));

    let task = tokio::spawn({
        let router = router.clone();
        async move { router.request("silent", "x").await }
    });
    while router.pending_requests() == 0 {
        tokio::task::yield_now().await;
    }

    task.abort();
    let _ = task.await;
    assert_eq!(router.pending_requests(), 0);
}
