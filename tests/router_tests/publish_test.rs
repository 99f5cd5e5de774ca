use std::sync::Arc;

use busline::config::RouterConfig;
use busline::event::{
    sync_handler, AddressRouter, ChannelErrorSink, DeliveryKind, DeliveryOptions, FailureKind,
    Message,
};
use pretty_assertions::assert_eq;

use super::{assert_quiet, channel, collect, recorder};

#[tokio::test]
async fn test_publish_reaches_every_handler_once() {
    let router = AddressRouter::default();
    let (tx, mut rx) = channel();
    let names = ["h1", "h2", "h3", "h4"];
    for name in names {
        router.subscribe("example.address", recorder(tx.clone(), name));
    }

    let reached = router.publish("example.address", "hello").unwrap();
    assert_eq!(reached, 4);

    let mut received = collect(&mut rx, 4).await;
    received.sort();
    assert_eq!(
        received,
        vec!["h1:hello", "h2:hello", "h3:hello", "h4:hello"]
    );
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn test_publish_without_handlers_is_not_an_error() {
    let router = AddressRouter::default();
    assert_eq!(router.publish("nobody.listens", "hello"), Ok(0));
}

#[tokio::test]
async fn test_publish_only_reaches_its_address() {
    let router = AddressRouter::default();
    let (tx, mut rx) = channel();
    router.subscribe("a", recorder(tx.clone(), "a"));
    router.subscribe("b", recorder(tx, "b"));

    router.publish("a", "only a").unwrap();

    assert_eq!(collect(&mut rx, 1).await, vec!["a:only a"]);
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn test_late_subscriber_misses_earlier_publish() {
    let router = AddressRouter::default();
    let (tx, mut rx) = channel();
    router.subscribe("a", recorder(tx.clone(), "early"));

    router.publish("a", "first").unwrap();
    router.subscribe("a", recorder(tx, "late"));
    router.publish("a", "second").unwrap();

    let mut received = collect(&mut rx, 3).await;
    received.sort();
    assert_eq!(received, vec!["early:first", "early:second", "late:second"]);
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn test_failing_handler_does_not_block_siblings() {
    let sink = Arc::new(ChannelErrorSink::new(16));
    let mut errors = sink.subscribe();
    let router = AddressRouter::with_error_sink(RouterConfig::default(), sink);
    let (tx, mut rx) = channel();

    router.subscribe("a", sync_handler(|_| Err(anyhow::anyhow!("rejecting everything"))));
    router.subscribe(
        "a",
        sync_handler(|message: Message| {
            if message.body() == "panic" {
                panic!("handler exploded");
            }
            Ok(())
        }),
    );
    router.subscribe("a", recorder(tx, "healthy"));

    router.publish("a", "panic").unwrap();
    router.publish("a", "after").unwrap();

    // the healthy handler sees both, in order
    assert_eq!(collect(&mut rx, 2).await, vec!["healthy:panic", "healthy:after"]);

    let mut kinds = vec![];
    for _ in 0..3 {
        let failure = errors.recv().await.unwrap();
        assert_eq!(failure.address, "a");
        assert_eq!(failure.delivery, DeliveryKind::Publish);
        kinds.push(failure.kind);
    }
    assert_eq!(kinds.iter().filter(|k| **k == FailureKind::Error).count(), 2);
    assert_eq!(kinds.iter().filter(|k| **k == FailureKind::Panic).count(), 1);
}

#[tokio::test]
async fn test_panicking_handler_keeps_handling() {
    let router = AddressRouter::default();
    let (tx, mut rx) = channel();
    router.subscribe(
        "a",
        sync_handler(move |message: Message| {
            if message.body() == "panic" {
                panic!("handler exploded");
            }
            tx.send(message.body().to_string())?;
            Ok(())
        }),
    );

    router.publish("a", "panic").unwrap();
    router.publish("a", "still alive").unwrap();

    assert_eq!(collect(&mut rx, 1).await, vec!["\"still alive\""]);
}

#[tokio::test]
async fn test_headers_are_delivered() {
    let router = AddressRouter::default();
    let (tx, mut rx) = channel();
    router.subscribe(
        "a",
        sync_handler(move |message: Message| {
            tx.send(format!(
                "{}:{}",
                message.kind(),
                message.header("trace-id").unwrap_or("none")
            ))?;
            Ok(())
        }),
    );

    router
        .publish_with_options("a", "x", DeliveryOptions::new().header("trace-id", "t-42"))
        .unwrap();
    router.publish("a", "y").unwrap();

    assert_eq!(collect(&mut rx, 2).await, vec!["publish:t-42", "publish:none"]);
}

#[tokio::test]
async fn test_unsubscribe_stops_future_publishes() {
    let router = AddressRouter::default();
    let (tx, mut rx) = channel();
    let h1 = router.subscribe("a", recorder(tx.clone(), "h1"));
    router.subscribe("a", recorder(tx, "h2"));

    router.publish("a", "before").unwrap();
    assert!(h1.unsubscribe());
    router.publish("a", "after").unwrap();

    let mut received = collect(&mut rx, 3).await;
    received.sort();
    assert_eq!(received, vec!["h1:before", "h2:after", "h2:before"]);
    assert_quiet(&mut rx).await;
}
