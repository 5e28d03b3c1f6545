use std::collections::BTreeMap;

use framed_rpc::{CallError, Compressor, TransportError};
use framed_rpc_proto::compression::Gzip;
use serde_cbor::Value;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

use super::support::{capture_logs, raw_peer, read_raw, write_raw, AddArgs, TIMEOUT};

type ResponseFrame = (u8, i64, Option<String>, Value);

fn add_call(seqno: i64, a: i64, b: i64) -> anyhow::Result<Vec<u8>> {
    Ok(serde_cbor::to_vec(&(0u8, seqno, "math.add", AddArgs { a, b }))?)
}

#[tokio::test]
async fn call_seven_gets_response_seven() -> anyhow::Result<()> {
    let (_conn, mut io) = raw_peer();

    write_raw(&mut io, &add_call(7, 3, 4)?).await?;
    let frame = timeout(TIMEOUT, read_raw(&mut io)).await??;
    let (typ, seqno, err, result): ResponseFrame = serde_cbor::from_slice(&frame)?;
    assert_eq!((typ, seqno, err), (1, 7, None));
    assert_eq!(result, Value::Integer(7));
    Ok(())
}

#[tokio::test]
async fn trailing_tags_are_accepted() -> anyhow::Result<()> {
    let (_conn, mut io) = raw_peer();

    let mut tags = BTreeMap::new();
    tags.insert("trace", "abc");
    let frame = serde_cbor::to_vec(&(0u8, 1i64, "echo.tags", (), &tags))?;
    write_raw(&mut io, &frame).await?;

    let frame = timeout(TIMEOUT, read_raw(&mut io)).await??;
    let (_, seqno, err, result): (u8, i64, Option<String>, BTreeMap<String, String>) =
        serde_cbor::from_slice(&frame)?;
    assert_eq!((seqno, err), (1, None));
    assert_eq!(result.get("trace").map(String::as_str), Some("abc"));
    Ok(())
}

#[tokio::test]
async fn short_frame_is_dropped_and_connection_survives() -> anyhow::Result<()> {
    let (logs, _guard) = capture_logs();
    let (conn, mut io) = raw_peer();

    // Header declares five items, three follow.
    let mut bad = vec![0x85];
    bad.extend(serde_cbor::to_vec(&0u8)?);
    bad.extend(serde_cbor::to_vec(&7u8)?);
    bad.extend(serde_cbor::to_vec(&"math.add")?);
    write_raw(&mut io, &bad).await?;

    write_raw(&mut io, &add_call(8, 1, 1)?).await?;
    let frame = timeout(TIMEOUT, read_raw(&mut io)).await??;
    let (_, seqno, err, result): ResponseFrame = serde_cbor::from_slice(&frame)?;
    assert_eq!((seqno, err), (8, None));
    assert_eq!(result, Value::Integer(2));

    assert!(!conn.is_closed());
    let text = logs.as_string();
    assert!(text.contains("wrong message length"), "{text}");
    Ok(())
}

#[tokio::test]
async fn invalid_type_tag_is_dropped() -> anyhow::Result<()> {
    let (logs, _guard) = capture_logs();
    let (conn, mut io) = raw_peer();

    write_raw(&mut io, &serde_cbor::to_vec(&(42u8, 1i64, "math.add"))?).await?;
    write_raw(&mut io, &[0x40]).await?;
    write_raw(&mut io, &add_call(9, 2, 2)?).await?;

    let frame = timeout(TIMEOUT, read_raw(&mut io)).await??;
    let (_, seqno, _, _): ResponseFrame = serde_cbor::from_slice(&frame)?;
    assert_eq!(seqno, 9);
    assert!(!conn.is_closed());
    assert!(logs.as_string().contains("invalid message type tag 42"));
    Ok(())
}

#[tokio::test]
async fn resolution_failure_is_answered_with_error_response() -> anyhow::Result<()> {
    let (_conn, mut io) = raw_peer();

    let frame = serde_cbor::to_vec(&(0u8, 3i64, "math.mul", AddArgs { a: 1, b: 1 }))?;
    write_raw(&mut io, &frame).await?;
    let frame = timeout(TIMEOUT, read_raw(&mut io)).await??;
    let (typ, seqno, err, result): ResponseFrame = serde_cbor::from_slice(&frame)?;
    assert_eq!((typ, seqno), (1, 3));
    let err = err.unwrap_or_default();
    assert!(err.contains("method \"mul\" not found"), "{err}");
    assert_eq!(result, Value::Null);
    Ok(())
}

#[tokio::test]
async fn cancel_for_unknown_seqno_is_a_no_op() -> anyhow::Result<()> {
    let (conn, mut io) = raw_peer();

    write_raw(&mut io, &serde_cbor::to_vec(&(3u8, 99i64, "math.add"))?).await?;
    write_raw(&mut io, &add_call(10, 5, 5)?).await?;

    let frame = timeout(TIMEOUT, read_raw(&mut io)).await??;
    let (_, seqno, err, _): ResponseFrame = serde_cbor::from_slice(&frame)?;
    assert_eq!((seqno, err), (10, None));
    assert!(!conn.is_closed());
    Ok(())
}

#[tokio::test]
async fn gzip_call_is_decompressed_and_reply_compressed() -> anyhow::Result<()> {
    let (_conn, mut io) = raw_peer();

    let text = "lorem ipsum ".repeat(1024);
    let compressed = Gzip.compress(&serde_cbor::to_vec(&text)?)?;
    let frame = serde_cbor::to_vec(&(
        4u8,
        2i64,
        1u8,
        "echo.bigblob",
        Value::Bytes(compressed),
    ))?;
    write_raw(&mut io, &frame).await?;

    let frame = timeout(TIMEOUT, read_raw(&mut io)).await??;
    let (typ, seqno, err, result): ResponseFrame = serde_cbor::from_slice(&frame)?;
    assert_eq!((typ, seqno, err), (1, 2, None));
    let Value::Bytes(reply) = result else {
        panic!("expected a compressed result, got {result:?}");
    };
    assert!(reply.len() < text.len() / 4);
    let plain = Gzip.decompress(&reply, usize::MAX)?;
    let echoed: String = serde_cbor::from_slice(&plain)?;
    assert_eq!(echoed, text);
    Ok(())
}

#[tokio::test]
async fn unknown_compression_falls_back_to_plain() -> anyhow::Result<()> {
    let (_conn, mut io) = raw_peer();

    let frame = serde_cbor::to_vec(&(4u8, 5i64, 99u8, "math.add", AddArgs { a: 1, b: 2 }))?;
    write_raw(&mut io, &frame).await?;
    let frame = timeout(TIMEOUT, read_raw(&mut io)).await??;
    let (_, seqno, err, result): ResponseFrame = serde_cbor::from_slice(&frame)?;
    assert_eq!((seqno, err), (5, None));
    assert_eq!(result, Value::Integer(3));
    Ok(())
}

#[tokio::test]
async fn corrupt_compressed_argument_is_answered() -> anyhow::Result<()> {
    let (conn, mut io) = raw_peer();

    let frame = serde_cbor::to_vec(&(
        4u8,
        6i64,
        1u8,
        "echo.bigblob",
        Value::Bytes(b"not gzip at all".to_vec()),
    ))?;
    write_raw(&mut io, &frame).await?;
    let frame = timeout(TIMEOUT, read_raw(&mut io)).await??;
    let (_, seqno, err, _): ResponseFrame = serde_cbor::from_slice(&frame)?;
    assert_eq!(seqno, 6);
    assert!(err.unwrap_or_default().contains("gzip compression failed"));
    assert!(!conn.is_closed());
    Ok(())
}

#[tokio::test]
async fn duplicate_response_is_not_delivered_twice() -> anyhow::Result<()> {
    let (logs, _guard) = capture_logs();
    let (conn, mut io) = raw_peer();
    let client = conn.client();

    let call = tokio::spawn(async move {
        client
            .call::<_, i64>("remote.add", &AddArgs { a: 1, b: 2 })
            .await
    });

    let frame = timeout(TIMEOUT, read_raw(&mut io)).await??;
    let (typ, seqno, method, _): (u8, i64, String, Value) = serde_cbor::from_slice(&frame)?;
    assert_eq!((typ, seqno, method.as_str()), (0, 0, "remote.add"));

    let response = serde_cbor::to_vec(&(1u8, seqno, (), 3i64))?;
    write_raw(&mut io, &response).await?;
    write_raw(&mut io, &response).await?;

    assert_eq!(timeout(TIMEOUT, call).await???, 3);

    // A follow-up call proves the second response was consumed, not stuck in the stream.
    write_raw(&mut io, &add_call(11, 1, 1)?).await?;
    let frame = timeout(TIMEOUT, read_raw(&mut io)).await??;
    let (_, seqno, _, _): ResponseFrame = serde_cbor::from_slice(&frame)?;
    assert_eq!(seqno, 11);

    assert_eq!(conn.pending_calls(), 0);
    let text = logs.as_string();
    assert!(text.contains("response for unknown call"), "{text}");
    Ok(())
}

#[tokio::test]
async fn sequence_numbers_start_at_zero_and_increase() -> anyhow::Result<()> {
    let (conn, mut io) = raw_peer();
    let client = conn.client();

    for expected in 0..3i64 {
        let client = client.clone();
        let call = tokio::spawn(async move { client.call::<_, ()>("remote.ping", &()).await });
        let frame = timeout(TIMEOUT, read_raw(&mut io)).await??;
        let (_, seqno, _, _): (u8, i64, String, Value) = serde_cbor::from_slice(&frame)?;
        assert_eq!(seqno, expected);
        write_raw(&mut io, &serde_cbor::to_vec(&(1u8, seqno, (), ()))?).await?;
        timeout(TIMEOUT, call).await???;
    }
    Ok(())
}

#[tokio::test]
async fn oversized_length_prefix_tears_the_connection_down() -> anyhow::Result<()> {
    let (conn, mut io) = raw_peer();
    let client = conn.client();
    let pending =
        tokio::spawn(async move { client.call::<_, i64>("remote.add", &AddArgs { a: 1, b: 2 }).await });
    let _ = timeout(TIMEOUT, read_raw(&mut io)).await??;

    io.write_u32_le(u32::MAX).await?;
    timeout(TIMEOUT, conn.closed()).await?;
    assert!(matches!(
        conn.close_reason(),
        Some(TransportError::FrameTooLarge { .. })
    ));
    assert!(matches!(
        timeout(TIMEOUT, pending).await??,
        Err(CallError::Transport(TransportError::ConnectionClosed))
    ));
    Ok(())
}
