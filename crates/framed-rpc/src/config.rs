use framed_rpc_proto::{CompressionType, MAX_FRAME_BYTES};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024; // 16 MiB
pub const DEFAULT_WRITE_QUEUE_LEN: usize = 256;

/// Per-connection limits and negotiated features.
///
/// Missing keys take their defaults, so `{}` is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Largest frame payload accepted or sent. Checked before allocating.
    pub max_frame_len: usize,
    /// Frames queued for the writer before senders wait.
    pub write_queue_len: usize,
    /// Compression types this side is willing to use. Accepts tags or names.
    pub compression: Vec<CompressionType>,
    /// Upper bound on a single decompressed argument or result.
    pub max_decompressed_len: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            write_queue_len: DEFAULT_WRITE_QUEUE_LEN,
            compression: vec![
                CompressionType::Gzip,
                CompressionType::Zlib,
                CompressionType::Zstd,
            ],
            max_decompressed_len: DEFAULT_MAX_FRAME_LEN.saturating_mul(4).min(MAX_FRAME_BYTES),
        }
    }
}

impl ConnectionConfig {
    /// Clamps values into the ranges the transport can honor.
    pub(crate) fn sanitize(&mut self) {
        self.max_frame_len = self.max_frame_len.clamp(1, u32::MAX as usize);
        self.write_queue_len = self.write_queue_len.max(1);
        self.max_decompressed_len = self.max_decompressed_len.max(1);
        self.compression.retain(|ctype| !ctype.is_none());
        self.compression.dedup();
    }
}
