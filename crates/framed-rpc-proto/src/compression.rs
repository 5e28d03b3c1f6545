//! Payload compression for argument and result fields.
//!
//! A compressed field holds the CBOR encoding of the value, compressed, as a byte string. A type
//! with no available compressor is not an error: the field is then read and written as plain
//! CBOR, which is what a peer without that compressor does as well.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::{CodecError, CompressionType, DynValue, FieldDecoder, FieldEncoder, Prototype};

pub trait Compressor: Send + Sync + 'static {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// Fails with [`CodecError::DecompressedTooLarge`] once the output would exceed `limit`.
    fn decompress(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, CodecError>;
}

pub struct Gzip;
pub struct Zlib;
#[cfg(feature = "zstd")]
pub struct Zstd;

fn compression_error(ctype: CompressionType, err: impl std::fmt::Display) -> CodecError {
    CodecError::Compression {
        ctype,
        message: err.to_string(),
    }
}

fn read_with_limit<R: Read>(
    mut reader: R,
    ctype: CompressionType,
    limit: usize,
) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|err| compression_error(ctype, format!("read stream: {err}")))?;
        if n == 0 {
            break;
        }
        if out.len() + n > limit {
            return Err(CodecError::DecompressedTooLarge {
                len: out.len() + n,
                max: limit,
            });
        }
        out.try_reserve(n).map_err(|err| {
            compression_error(
                ctype,
                format!("allocate decompression buffer ({} bytes): {err}", out.len() + n),
            )
        })?;
        out.extend_from_slice(&buf[..n]);
    }
    Ok(out)
}

impl Compressor for Gzip {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder
            .write_all(data)
            .map_err(|err| compression_error(CompressionType::Gzip, err))?;
        encoder
            .finish()
            .map_err(|err| compression_error(CompressionType::Gzip, err))
    }

    fn decompress(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, CodecError> {
        read_with_limit(flate2::read::GzDecoder::new(data), CompressionType::Gzip, limit)
    }
}

impl Compressor for Zlib {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder
            .write_all(data)
            .map_err(|err| compression_error(CompressionType::Zlib, err))?;
        encoder
            .finish()
            .map_err(|err| compression_error(CompressionType::Zlib, err))
    }

    fn decompress(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, CodecError> {
        read_with_limit(flate2::read::ZlibDecoder::new(data), CompressionType::Zlib, limit)
    }
}

#[cfg(feature = "zstd")]
impl Compressor for Zstd {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        zstd::bulk::compress(data, 3).map_err(|err| compression_error(CompressionType::Zstd, err))
    }

    fn decompress(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, CodecError> {
        let decoder = zstd::stream::read::Decoder::new(data).map_err(|err| {
            compression_error(CompressionType::Zstd, format!("create zstd decoder: {err}"))
        })?;
        read_with_limit(decoder, CompressionType::Zstd, limit)
    }
}

fn builtin(ctype: CompressionType) -> Option<Arc<dyn Compressor>> {
    match ctype {
        CompressionType::Gzip => Some(Arc::new(Gzip)),
        CompressionType::Zlib => Some(Arc::new(Zlib)),
        #[cfg(feature = "zstd")]
        CompressionType::Zstd => Some(Arc::new(Zstd)),
        _ => None,
    }
}

/// Compressors available on one connection, keyed by compression type.
///
/// Built-in compressors for enabled types are created on first use. [`CompressorCache::register`]
/// installs a custom compressor for any type and enables it.
pub struct CompressorCache {
    enabled: Vec<CompressionType>,
    max_decompressed_len: usize,
    compressors: RwLock<HashMap<CompressionType, Arc<dyn Compressor>>>,
}

impl std::fmt::Debug for CompressorCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressorCache")
            .field("enabled", &self.enabled)
            .field("max_decompressed_len", &self.max_decompressed_len)
            .finish_non_exhaustive()
    }
}

impl Default for CompressorCache {
    fn default() -> Self {
        Self::new(
            vec![
                CompressionType::Gzip,
                CompressionType::Zlib,
                CompressionType::Zstd,
            ],
            crate::MAX_FRAME_BYTES,
        )
    }
}

impl CompressorCache {
    pub fn new(enabled: Vec<CompressionType>, max_decompressed_len: usize) -> Self {
        Self {
            enabled,
            max_decompressed_len,
            compressors: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, ctype: CompressionType, compressor: Arc<dyn Compressor>) {
        self.compressors.write().insert(ctype, compressor);
    }

    pub fn max_decompressed_len(&self) -> usize {
        self.max_decompressed_len
    }

    /// The compressor for `ctype`, or `None` if values of that type travel uncompressed.
    pub fn get(&self, ctype: CompressionType) -> Option<Arc<dyn Compressor>> {
        if ctype.is_none() {
            return None;
        }
        if let Some(compressor) = self.compressors.read().get(&ctype) {
            return Some(compressor.clone());
        }
        if !self.enabled.contains(&ctype) {
            return None;
        }
        let compressor = builtin(ctype)?;
        Some(
            self.compressors
                .write()
                .entry(ctype)
                .or_insert(compressor)
                .clone(),
        )
    }

    pub fn supports(&self, ctype: CompressionType) -> bool {
        self.get(ctype).is_some()
    }

    /// Decodes the next field with `proto`, decompressing it first when `ctype` has a compressor.
    pub fn decode_field(
        &self,
        ctype: CompressionType,
        d: &mut FieldDecoder<'_>,
        proto: Prototype,
    ) -> Result<DynValue, CodecError> {
        let Some(compressor) = self.get(ctype) else {
            return proto(d);
        };
        let field = d.field_number();
        let compressed = d.decode_bytes()?;
        if compressed.is_empty() {
            return proto(&mut FieldDecoder::null(field));
        }
        let plain = compressor.decompress(&compressed, self.max_decompressed_len)?;
        proto(&mut FieldDecoder::uncompressed(plain, field)?)
    }

    /// Appends `value` as the next field, compressed when `ctype` has a compressor.
    pub fn encode_field<T: Serialize + ?Sized>(
        &self,
        ctype: CompressionType,
        e: &mut FieldEncoder,
        value: &T,
    ) -> Result<(), CodecError> {
        let Some(compressor) = self.get(ctype) else {
            return e.push(value);
        };
        let plain = serde_cbor::to_vec(&value).map_err(CodecError::encode)?;
        if plain == [0xf6] {
            e.push_bytes(&[]);
            return Ok(());
        }
        e.push_bytes(&compressor.compress(&plain)?);
        Ok(())
    }
}
