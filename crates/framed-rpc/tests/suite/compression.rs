use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use framed_rpc::{
    CallOptions, CodecError, CompressionType, Compressor, Connection, ConnectionConfig,
    MemoryInstrumentationStorage, Method, Position,
};
use tokio::time::timeout;

use super::support::{
    echo_protocol, math_protocol, pair, pair_with, registry, wait_for_count, AddArgs, MATH_ID,
    TIMEOUT,
};

fn instrumented_server(storage: &Arc<MemoryInstrumentationStorage>) -> framed_rpc::ConnectionBuilder {
    Connection::builder()
        .registry(registry([math_protocol(), echo_protocol()]))
        .instrumentation(storage.clone())
}

#[tokio::test]
async fn gzip_shrinks_a_large_echo() -> anyhow::Result<()> {
    let storage = Arc::new(MemoryInstrumentationStorage::new());
    let (client, _server) = pair(instrumented_server(&storage));

    let blob = "abcdefgh".repeat(10 * 1024 / 8);
    let options = CallOptions::new().compression(CompressionType::Gzip);
    let echoed: String = timeout(
        TIMEOUT,
        client.client().call_with("echo.bigblob", &blob, options),
    )
    .await??;
    assert_eq!(echoed, blob);

    let stats = wait_for_count(&storage, "CallCompressed echo.bigblob", 1).await?;
    assert!(stats.total_bytes < 2 * 1024, "{stats:?}");
    assert!(!storage.snapshot().tags.contains_key("Call echo.bigblob"));
    Ok(())
}

#[tokio::test]
async fn zlib_round_trips_a_null_result() -> anyhow::Result<()> {
    let protocol = framed_rpc::Protocol::new("sink").method("drop", |_ctx, _blob: String| async move {
        Ok::<_, framed_rpc::AppError>(())
    });
    let (client, _server) = pair(Connection::builder().registry(registry([protocol])));

    let options = CallOptions::new().compression(CompressionType::Zlib);
    let () = timeout(
        TIMEOUT,
        client.client().call_with("sink.drop", "payload", options),
    )
    .await??;
    Ok(())
}

#[cfg(feature = "zstd")]
#[tokio::test]
async fn zstd_round_trips() -> anyhow::Result<()> {
    let (client, _server) = pair(Connection::builder().registry(registry([echo_protocol()])));

    let blob = "zstd ".repeat(4096);
    let options = CallOptions::new().compression(CompressionType::Zstd);
    let echoed: String = timeout(
        TIMEOUT,
        client.client().call_with("echo.bigblob", &blob, options),
    )
    .await??;
    assert_eq!(echoed, blob);
    Ok(())
}

#[tokio::test]
async fn v2_identity_is_never_compressed() -> anyhow::Result<()> {
    let storage = Arc::new(MemoryInstrumentationStorage::new());
    let (client, _server) = pair(instrumented_server(&storage));

    let options = CallOptions::new().compression(CompressionType::Gzip);
    let sum: i64 = timeout(
        TIMEOUT,
        client.client().call_with(
            Method::v2(MATH_ID, Position(0)),
            &AddArgs { a: 2, b: 3 },
            options,
        ),
    )
    .await??;
    assert_eq!(sum, 5);

    let recorded = async {
        loop {
            let snapshot = storage.snapshot();
            if !snapshot.tags.is_empty() {
                return snapshot;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    };
    let snapshot = timeout(TIMEOUT, recorded).await?;
    assert!(snapshot.tags.keys().all(|tag| tag.starts_with("CallV2 ")), "{snapshot:?}");
    Ok(())
}

#[tokio::test]
async fn disabled_compression_falls_back_to_plain_call() -> anyhow::Result<()> {
    let storage = Arc::new(MemoryInstrumentationStorage::new());
    let client_config = ConnectionConfig {
        compression: Vec::new(),
        ..ConnectionConfig::default()
    };
    let (client, _server) = pair_with(
        Connection::builder().config(client_config),
        instrumented_server(&storage),
    );

    let options = CallOptions::new().compression(CompressionType::Gzip);
    let echoed: String = timeout(
        TIMEOUT,
        client.client().call_with("echo.bigblob", "plain", options),
    )
    .await??;
    assert_eq!(echoed, "plain");

    let stats = wait_for_count(&storage, "Call echo.bigblob", 1).await?;
    assert_eq!(stats.count, 1);
    assert!(!storage
        .snapshot()
        .tags
        .contains_key("CallCompressed echo.bigblob"));
    Ok(())
}

/// Reverses the payload. Enough to prove both ends went through the same codec.
#[derive(Default)]
struct Reverse {
    calls: AtomicUsize,
}

impl Compressor for Reverse {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(data.iter().rev().copied().collect())
    }

    fn decompress(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, CodecError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if data.len() > limit {
            return Err(CodecError::DecompressedTooLarge {
                len: data.len(),
                max: limit,
            });
        }
        Ok(data.iter().rev().copied().collect())
    }
}

#[tokio::test]
async fn custom_compressor_is_used_for_its_type() -> anyhow::Result<()> {
    let ctype = CompressionType::Unknown(42);
    let client_side = Arc::new(Reverse::default());
    let server_side = Arc::new(Reverse::default());
    let (client, _server) = pair_with(
        Connection::builder().compressor(ctype, client_side.clone()),
        Connection::builder()
            .registry(registry([echo_protocol()]))
            .compressor(ctype, server_side.clone()),
    );

    let options = CallOptions::new().compression(ctype);
    let echoed: String = timeout(
        TIMEOUT,
        client.client().call_with("echo.bigblob", "backwards", options),
    )
    .await??;
    assert_eq!(echoed, "backwards");

    // Argument out and result back on each side.
    assert_eq!(client_side.calls.load(Ordering::SeqCst), 2);
    assert_eq!(server_side.calls.load(Ordering::SeqCst), 2);
    Ok(())
}
