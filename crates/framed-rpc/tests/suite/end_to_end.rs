use std::sync::Arc;

use anyhow::Context as _;
use framed_rpc::{
    AppError, CallError, CallOptions, Connection, ConnectionConfig, MemoryInstrumentationStorage,
    Method, Position, Protocol, RemoteError, TransportError,
};
use tokio::time::timeout;

use super::support::{
    echo_protocol, math_protocol, pair, pair_with, read_raw, registry, tags,
    wait_for_count, AddArgs, MATH_ID, TIMEOUT,
};

#[tokio::test]
async fn math_add_returns_seven() -> anyhow::Result<()> {
    let (client, _server) = pair(Connection::builder().registry(registry([math_protocol()])));

    let sum: i64 = timeout(
        TIMEOUT,
        client.client().call("math.add", &AddArgs { a: 3, b: 4 }),
    )
    .await??;
    assert_eq!(sum, 7);
    assert_eq!(client.pending_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn v2_identity_reaches_the_same_handler() -> anyhow::Result<()> {
    let (client, _server) = pair(Connection::builder().registry(registry([math_protocol()])));

    let sum: i64 = timeout(
        TIMEOUT,
        client
            .client()
            .call(Method::v2(MATH_ID, Position(0)), &AddArgs { a: 40, b: 2 }),
    )
    .await??;
    assert_eq!(sum, 42);

    let quotient: i64 = timeout(
        TIMEOUT,
        client
            .client()
            .call(Method::v2(MATH_ID, Position(1)), &AddArgs { a: 9, b: 3 }),
    )
    .await??;
    assert_eq!(quotient, 3);
    Ok(())
}

#[tokio::test]
async fn both_ends_serve_and_call() -> anyhow::Result<()> {
    let (a, b) = pair_with(
        Connection::builder().registry(registry([echo_protocol()])),
        Connection::builder().registry(registry([math_protocol()])),
    );

    let sum: i64 = timeout(TIMEOUT, a.client().call("math.add", &AddArgs { a: 1, b: 1 })).await??;
    assert_eq!(sum, 2);
    let echoed: String = timeout(TIMEOUT, b.client().call("echo.bigblob", "ping")).await??;
    assert_eq!(echoed, "ping");
    Ok(())
}

#[tokio::test]
async fn handler_error_is_returned_as_remote_error() -> anyhow::Result<()> {
    let (client, _server) = pair(Connection::builder().registry(registry([math_protocol()])));

    let res: Result<i64, CallError> = timeout(
        TIMEOUT,
        client.client().call("math.div", &AddArgs { a: 1, b: 0 }),
    )
    .await?;
    match res {
        Err(CallError::Remote(err)) => {
            assert_eq!(err.to_string(), "division by zero");
            assert!(err.downcast_ref::<RemoteError>().is_some());
        }
        other => panic!("expected remote error, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn unknown_method_is_answered_not_dropped() -> anyhow::Result<()> {
    let (client, server) = pair(Connection::builder().registry(registry([math_protocol()])));

    for method in ["math.mul", "trig.sin", "nodots"] {
        let res: Result<i64, CallError> =
            timeout(TIMEOUT, client.client().call(method, &AddArgs { a: 1, b: 1 })).await?;
        match res {
            Err(CallError::Remote(err)) => {
                let text = err.to_string();
                assert!(text.contains(method), "{text}");
            }
            other => panic!("expected remote error for {method}, got {other:?}"),
        }
    }
    assert!(!server.is_closed());
    Ok(())
}

#[tokio::test]
async fn argument_type_mismatch_is_answered() -> anyhow::Result<()> {
    let (client, _server) = pair(Connection::builder().registry(registry([math_protocol()])));

    let res: Result<i64, CallError> =
        timeout(TIMEOUT, client.client().call("math.add", "not args")).await?;
    match res {
        Err(CallError::Remote(err)) => assert!(err.to_string().contains("field 3"), "{err}"),
        other => panic!("expected remote error, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn result_type_mismatch_is_a_decode_error() -> anyhow::Result<()> {
    let (client, _server) = pair(Connection::builder().registry(registry([math_protocol()])));

    let res: Result<String, CallError> = timeout(
        TIMEOUT,
        client.client().call("math.add", &AddArgs { a: 1, b: 2 }),
    )
    .await?;
    assert!(matches!(res, Err(CallError::Decode(_))), "{res:?}");
    Ok(())
}

#[tokio::test]
async fn concurrent_calls_are_matched_by_seqno() -> anyhow::Result<()> {
    let (client, _server) = pair(Connection::builder().registry(registry([math_protocol()])));
    let client = client.client();

    let mut tasks = Vec::new();
    for i in 0..32i64 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let sum: i64 = client.call("math.add", &AddArgs { a: i, b: i }).await?;
            Ok::<_, CallError>((i, sum))
        }));
    }
    for task in tasks {
        let (i, sum) = timeout(TIMEOUT, task).await???;
        assert_eq!(sum, 2 * i);
    }
    Ok(())
}

#[tokio::test]
async fn notify_runs_the_handler_without_a_reply() -> anyhow::Result<()> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let protocol = Protocol::new("events").method("push", move |_ctx, event: String| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(event);
            Ok::<_, AppError>(())
        }
    });
    let (client, server) = pair(Connection::builder().registry(registry([protocol])));

    client.client().notify("events.push", "hello").await?;
    let event = timeout(TIMEOUT, rx.recv())
        .await?
        .context("handler dropped the sender")?;
    assert_eq!(event, "hello");
    assert_eq!(client.pending_calls(), 0);
    assert_eq!(server.in_flight_requests(), 0);
    Ok(())
}

#[tokio::test]
async fn call_tags_reach_the_handler_context() -> anyhow::Result<()> {
    let (client, _server) = pair(Connection::builder().registry(registry([echo_protocol()])));

    let options = CallOptions::new().tag("trace", "t-1").tag("user", "ada");
    let seen: framed_rpc::LogTags =
        timeout(TIMEOUT, client.client().call_with("echo.tags", &(), options)).await??;
    assert_eq!(seen, tags(&[("trace", "t-1"), ("user", "ada")]));

    let untagged: framed_rpc::LogTags =
        timeout(TIMEOUT, client.client().call("echo.tags", &())).await??;
    assert!(untagged.is_empty());
    Ok(())
}

#[tokio::test]
async fn call_discard_waits_for_completion() -> anyhow::Result<()> {
    let (client, _server) = pair(Connection::builder().registry(registry([math_protocol()])));

    timeout(
        TIMEOUT,
        client
            .client()
            .call_discard("math.add", &AddArgs { a: 1, b: 2 }, CallOptions::new()),
    )
    .await??;

    let res = timeout(
        TIMEOUT,
        client
            .client()
            .call_discard("math.div", &AddArgs { a: 1, b: 0 }, CallOptions::new()),
    )
    .await?;
    assert!(matches!(res, Err(CallError::Remote(_))));
    Ok(())
}

#[tokio::test]
async fn oversized_reply_becomes_an_error_reply() -> anyhow::Result<()> {
    let protocol = Protocol::new("blob").method("repeat", |_ctx, n: usize| async move {
        Ok::<_, AppError>("x".repeat(n))
    });
    let config = ConnectionConfig {
        max_frame_len: 1024,
        ..ConnectionConfig::default()
    };
    let (client, server) = pair(
        Connection::builder()
            .config(config)
            .registry(registry([protocol])),
    );

    let small: String = timeout(TIMEOUT, client.client().call("blob.repeat", &16usize)).await??;
    assert_eq!(small.len(), 16);

    let res: Result<String, CallError> =
        timeout(TIMEOUT, client.client().call("blob.repeat", &4096usize)).await?;
    match res {
        Err(CallError::Remote(err)) => {
            assert!(err.to_string().contains("frame too large"), "{err}")
        }
        other => panic!("expected remote error, got {other:?}"),
    }
    assert!(!server.is_closed());
    Ok(())
}

#[tokio::test]
async fn oversized_request_tears_down_the_receiver() -> anyhow::Result<()> {
    let config = ConnectionConfig {
        max_frame_len: 1024,
        ..ConnectionConfig::default()
    };
    let (client, server) = pair(
        Connection::builder()
            .config(config)
            .registry(registry([echo_protocol()])),
    );

    let huge = "x".repeat(4096);
    let res: Result<String, CallError> =
        timeout(TIMEOUT, client.client().call("echo.bigblob", &huge)).await?;
    assert!(
        matches!(
            res,
            Err(CallError::Transport(TransportError::ConnectionClosed))
        ),
        "{res:?}"
    );

    timeout(TIMEOUT, server.closed()).await?;
    assert!(matches!(
        server.close_reason(),
        Some(TransportError::FrameTooLarge { max: 1024, .. })
    ));
    timeout(TIMEOUT, client.closed()).await?;
    Ok(())
}

#[tokio::test]
async fn instrumentation_records_each_message_once() -> anyhow::Result<()> {
    let storage = Arc::new(MemoryInstrumentationStorage::new());
    let (client, _server) = pair(
        Connection::builder()
            .registry(registry([math_protocol()]))
            .instrumentation(storage.clone()),
    );

    for _ in 0..3 {
        let _: i64 = timeout(
            TIMEOUT,
            client.client().call("math.add", &AddArgs { a: 1, b: 2 }),
        )
        .await??;
    }
    let _ = timeout(
        TIMEOUT,
        client.client().call::<_, i64>("math.mul", &AddArgs { a: 1, b: 2 }),
    )
    .await?;

    // Replies are recorded after their write is acknowledged, which can trail the caller.
    let add = wait_for_count(&storage, "Call math.add", 3).await?;
    assert!(add.total_bytes > 0);
    let mul = wait_for_count(&storage, "Call math.mul", 1).await?;
    assert_eq!(mul.count, 1);

    let json = serde_json::to_value(storage.snapshot())?;
    assert_eq!(json["tags"]["Call math.add"]["count"], 3);
    Ok(())
}

fn boom_protocol() -> Protocol {
    Protocol::new("boom").method("now", |_ctx, code: u32| async move {
        if code > 0 {
            panic!("boom {code}");
        }
        Ok::<_, AppError>(code)
    })
}

#[tokio::test]
async fn handler_panic_becomes_a_remote_error() -> anyhow::Result<()> {
    let (client, server) = pair(
        Connection::builder().registry(registry([boom_protocol(), math_protocol()])),
    );

    let res: Result<u32, CallError> =
        timeout(TIMEOUT, client.client().call("boom.now", &7u32)).await?;
    match res {
        Err(CallError::Remote(err)) => {
            let text = err.to_string();
            assert!(text.contains("panicked") && text.contains("boom 7"), "{text}");
        }
        other => panic!("expected remote error, got {other:?}"),
    }
    assert_eq!(server.in_flight_requests(), 0);
    assert_eq!(client.pending_calls(), 0);

    // Neither end is torn down by the panic.
    let sum: i64 = timeout(
        TIMEOUT,
        client.client().call("math.add", &AddArgs { a: 5, b: 6 }),
    )
    .await??;
    assert_eq!(sum, 11);
    assert!(!server.is_closed());
    Ok(())
}

#[tokio::test]
async fn panicking_notify_leaves_the_server_serving() -> anyhow::Result<()> {
    let (client, server) = pair(
        Connection::builder().registry(registry([boom_protocol(), math_protocol()])),
    );

    timeout(TIMEOUT, client.client().notify("boom.now", &1u32)).await??;
    let sum: i64 = timeout(
        TIMEOUT,
        client.client().call("math.add", &AddArgs { a: 1, b: 1 }),
    )
    .await??;
    assert_eq!(sum, 2);
    assert!(!server.is_closed());
    Ok(())
}

#[tokio::test]
async fn client_records_its_outbound_calls() -> anyhow::Result<()> {
    let storage = Arc::new(MemoryInstrumentationStorage::new());
    let (client, _server) = pair_with(
        Connection::builder().instrumentation(storage.clone()),
        Connection::builder().registry(registry([math_protocol()])),
    );

    let sum: i64 = timeout(
        TIMEOUT,
        client.client().call("math.add", &AddArgs { a: 2, b: 3 }),
    )
    .await??;
    assert_eq!(sum, 5);
    let res: Result<i64, CallError> = timeout(
        TIMEOUT,
        client.client().call("math.div", &AddArgs { a: 1, b: 0 }),
    )
    .await?;
    assert!(matches!(res, Err(CallError::Remote(_))), "{res:?}");

    // Recorded before the caller wakes up.
    let snapshot = storage.snapshot();
    let add = &snapshot.tags["Call math.add"];
    assert_eq!(add.count, 1);
    // At least the Call frame plus a Response frame.
    assert!(add.total_bytes > 10, "{add:?}");
    assert_eq!(snapshot.tags["Call math.div"].count, 1);
    Ok(())
}

#[tokio::test]
async fn abandoned_calls_are_still_recorded() -> anyhow::Result<()> {
    let storage = Arc::new(MemoryInstrumentationStorage::new());
    let (a, mut io) = tokio::io::duplex(1 << 16);
    let conn = Connection::builder()
        .instrumentation(storage.clone())
        .start(a);

    let res: Result<i64, CallError> = timeout(
        TIMEOUT,
        conn.client().call_with(
            "remote.x",
            &(),
            CallOptions::new().timeout(std::time::Duration::from_millis(20)),
        ),
    )
    .await?;
    assert!(matches!(res, Err(CallError::Timeout)), "{res:?}");

    let call = timeout(TIMEOUT, read_raw(&mut io)).await??;
    let stats = &storage.snapshot().tags["Call remote.x"];
    assert_eq!(stats.count, 1);
    assert_eq!(stats.total_bytes, call.len() as u64);
    Ok(())
}
