//! Allocation-free structural walk over CBOR items.
//!
//! `serde_cbor::from_slice` may size `Vec`/`String` buffers from attacker-controlled length
//! prefixes before checking that the input actually contains that many bytes. The frame decoder
//! walks every declared field with this reader first, so each field is only handed to serde once
//! its extent is known to lie inside the frame.

use anyhow::{bail, ensure, Context};

const MAX_CBOR_NESTING: usize = 64;

pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.offset)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.offset >= self.bytes.len()
    }

    fn peek_u8(&self) -> anyhow::Result<u8> {
        ensure!(self.remaining() >= 1, "unexpected EOF");
        Ok(self.bytes[self.offset])
    }

    fn read_u8(&mut self) -> anyhow::Result<u8> {
        let b = self.peek_u8()?;
        self.offset += 1;
        Ok(b)
    }

    fn read_exact(&mut self, len: usize) -> anyhow::Result<&'a [u8]> {
        ensure!(
            self.remaining() >= len,
            "unexpected EOF: need {len} bytes, have {}",
            self.remaining()
        );
        let start = self.offset;
        self.offset += len;
        Ok(&self.bytes[start..start + len])
    }

    fn skip(&mut self, len: usize) -> anyhow::Result<()> {
        let _ = self.read_exact(len)?;
        Ok(())
    }

    fn read_uint(&mut self, ai: u8) -> anyhow::Result<u64> {
        match ai {
            0..=23 => Ok(ai as u64),
            24 => Ok(self.read_u8()? as u64),
            25 => {
                let b = self.read_exact(2)?;
                Ok(u16::from_be_bytes([b[0], b[1]]) as u64)
            }
            26 => {
                let b = self.read_exact(4)?;
                Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as u64)
            }
            27 => {
                let b = self.read_exact(8)?;
                Ok(u64::from_be_bytes([
                    b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
                ]))
            }
            31 => bail!("indefinite length is not valid here"),
            other => bail!("invalid CBOR additional info: {other}"),
        }
    }

    fn read_len(&mut self, ai: u8, what: &'static str) -> anyhow::Result<usize> {
        let len_u64 = self
            .read_uint(ai)
            .with_context(|| format!("read {what} length"))?;
        usize::try_from(len_u64)
            .map_err(|_| anyhow::anyhow!("{what} length does not fit in usize: {len_u64}"))
    }

    /// Reads the definite-length array header that opens every frame.
    pub(crate) fn read_array_header(&mut self) -> anyhow::Result<usize> {
        let head = self.read_u8().context("read frame header")?;
        let major = head >> 5;
        let ai = head & 0x1f;
        ensure!(major == 4, "frame must be a CBOR array (major type {major})");
        ensure!(ai != 31, "frame array must have a definite length");
        self.read_len(ai, "frame array")
    }

    /// Advances past one complete item, returning the byte range it occupied.
    pub(crate) fn skip_item(&mut self) -> anyhow::Result<std::ops::Range<usize>> {
        let start = self.offset;
        skip_item(self, 0)?;
        Ok(start..self.offset)
    }
}

fn skip_item(r: &mut Reader<'_>, depth: usize) -> anyhow::Result<()> {
    ensure!(depth <= MAX_CBOR_NESTING, "CBOR nesting too deep");
    let head = r.read_u8().context("read CBOR head")?;
    let major = head >> 5;
    let ai = head & 0x1f;

    match major {
        // unsigned int / negative int
        0 | 1 => {
            let _ = r.read_uint(ai)?;
            Ok(())
        }
        // byte string / text string
        2 | 3 => {
            if ai == 31 {
                return skip_indefinite_string(r, major);
            }
            let len = r.read_len(ai, "string")?;
            ensure!(
                len <= r.remaining(),
                "string length {len} exceeds remaining bytes ({})",
                r.remaining()
            );
            r.skip(len)
        }
        // array
        4 => {
            if ai == 31 {
                return skip_until_break(r, depth + 1, 1);
            }
            let len = r.read_len(ai, "array")?;
            ensure!(
                len <= r.remaining(),
                "array length {len} exceeds remaining bytes ({})",
                r.remaining()
            );
            for _ in 0..len {
                skip_item(r, depth + 1)?;
            }
            Ok(())
        }
        // map
        5 => {
            if ai == 31 {
                return skip_until_break(r, depth + 1, 2);
            }
            let len = r.read_len(ai, "map")?;
            ensure!(
                len.saturating_mul(2) <= r.remaining(),
                "map length {len} exceeds remaining bytes ({})",
                r.remaining()
            );
            for _ in 0..len {
                skip_item(r, depth + 1).context("skip map key")?;
                skip_item(r, depth + 1).context("skip map value")?;
            }
            Ok(())
        }
        // tag
        6 => {
            let _ = r.read_uint(ai)?;
            skip_item(r, depth + 1).context("skip tagged item")
        }
        // simple / float
        7 => match ai {
            0..=23 => Ok(()),
            24 => r.skip(1),
            25 => r.skip(2),
            26 => r.skip(4),
            27 => r.skip(8),
            31 => bail!("unexpected CBOR break"),
            other => bail!("invalid CBOR additional info for major type 7: {other}"),
        },
        other => bail!("unknown CBOR major type: {other}"),
    }
}

fn skip_until_break(r: &mut Reader<'_>, depth: usize, items_per_entry: usize) -> anyhow::Result<()> {
    loop {
        if r.peek_u8().context("peek indefinite container")? == 0xff {
            r.read_u8()?;
            return Ok(());
        }
        for _ in 0..items_per_entry {
            skip_item(r, depth)?;
        }
    }
}

fn skip_indefinite_string(r: &mut Reader<'_>, major: u8) -> anyhow::Result<()> {
    // A sequence of definite-length chunks of the same major type, terminated by `break`.
    loop {
        let head = r.read_u8().context("read string chunk head")?;
        if head == 0xff {
            return Ok(());
        }
        ensure!(
            head >> 5 == major,
            "indefinite string chunk has major type {} (expected {major})",
            head >> 5
        );
        let ai = head & 0x1f;
        ensure!(ai != 31, "nested indefinite string chunk");
        let len = r.read_len(ai, "string chunk")?;
        r.skip(len)?;
    }
}

/// Appends a CBOR head with the given major type and argument.
pub(crate) fn encode_head(major: u8, n: u64, out: &mut Vec<u8>) {
    fn push_be<const N: usize>(v: u64, out: &mut Vec<u8>) {
        let bytes = v.to_be_bytes();
        out.extend_from_slice(&bytes[8 - N..]);
    }

    let major_bits = major << 5;
    match n {
        0..=23 => out.push(major_bits | (n as u8)),
        24..=0xFF => {
            out.push(major_bits | 24);
            out.push(n as u8);
        }
        0x100..=0xFFFF => {
            out.push(major_bits | 25);
            push_be::<2>(n, out);
        }
        0x1_0000..=0xFFFF_FFFF => {
            out.push(major_bits | 26);
            push_be::<4>(n, out);
        }
        _ => {
            out.push(major_bits | 27);
            push_be::<8>(n, out);
        }
    }
}
