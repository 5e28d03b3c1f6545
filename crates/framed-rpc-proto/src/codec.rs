//! Field-level frame codec.
//!
//! A frame payload is a definite-length CBOR array. [`FieldDecoder`] walks the declared items
//! once up front (without allocating per item) and then hands them out strictly left to right;
//! [`FieldEncoder`] builds the same shape.

use std::any::Any;
use std::borrow::Cow;
use std::ops::Range;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::cbor::{encode_head, Reader};
use crate::CodecError;

const CBOR_NULL: &[u8] = &[0xf6];

/// A decoded value whose concrete type is only known to whoever built the [`Prototype`].
pub type DynValue = Box<dyn Any + Send>;

/// Decodes the next field into a type-erased value.
pub type Prototype = fn(&mut FieldDecoder<'_>) -> Result<DynValue, CodecError>;

/// Returns the [`Prototype`] that decodes a `T`.
pub fn prototype<T>() -> Prototype
where
    T: DeserializeOwned + Send + 'static,
{
    fn decode_as<T>(d: &mut FieldDecoder<'_>) -> Result<DynValue, CodecError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        Ok(Box::new(d.decode::<T>()?))
    }
    decode_as::<T>
}

/// Reads the fields of one frame in order.
///
/// Field numbers are 0-based and every decode error carries the number of the field that failed.
#[derive(Debug)]
pub struct FieldDecoder<'a> {
    data: Cow<'a, [u8]>,
    fields: Vec<Range<usize>>,
    declared: usize,
    // Set when the structural walk stopped early on a malformed item.
    fault: Option<(usize, String)>,
    // Items found after the declared end.
    surplus: usize,
    next: usize,
    base: usize,
}

impl<'a> FieldDecoder<'a> {
    /// Reads the frame header and walks the declared items.
    ///
    /// Only a missing or malformed header fails here. Missing, malformed or surplus items are
    /// reported by [`FieldDecoder::check_length`] or by the decode of the affected field, so the
    /// message type can still be read from a damaged frame.
    pub fn new(frame: &'a [u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(frame);
        let declared = r
            .read_array_header()
            .map_err(|err| CodecError::field(0, format!("{err:#}")))?;

        // No `with_capacity(declared)`: the count comes off the wire.
        let mut fields = Vec::new();
        let mut fault = None;
        while fields.len() < declared && !r.is_empty() {
            match r.skip_item() {
                Ok(range) => fields.push(range),
                Err(err) => {
                    fault = Some((fields.len(), format!("{err:#}")));
                    break;
                }
            }
        }

        let mut surplus = 0usize;
        if fault.is_none() {
            while !r.is_empty() {
                surplus += 1;
                if r.skip_item().is_err() {
                    break;
                }
            }
        }

        Ok(Self {
            data: Cow::Borrowed(frame),
            fields,
            declared,
            fault,
            surplus,
            next: 0,
            base: 0,
        })
    }

    /// A decoder over a single already-decompressed value, numbering it as `field_number`.
    pub fn uncompressed(data: Vec<u8>, field_number: usize) -> Result<FieldDecoder<'static>, CodecError> {
        let mut r = Reader::new(&data);
        let range = r
            .skip_item()
            .map_err(|err| CodecError::field(field_number, format!("{err:#}")))?;
        if !r.is_empty() {
            return Err(CodecError::field(
                field_number,
                format!("{} trailing bytes after decompressed value", r.remaining()),
            ));
        }
        Ok(FieldDecoder {
            data: Cow::Owned(data),
            fields: vec![range],
            declared: 1,
            fault: None,
            surplus: 0,
            next: 0,
            base: field_number,
        })
    }

    /// A decoder whose only field is CBOR `null`.
    pub fn null(field_number: usize) -> FieldDecoder<'static> {
        FieldDecoder {
            data: Cow::Borrowed(CBOR_NULL),
            fields: vec![0..CBOR_NULL.len()],
            declared: 1,
            fault: None,
            surplus: 0,
            next: 0,
            base: field_number,
        }
    }

    /// Field count declared by the frame header.
    pub fn declared(&self) -> usize {
        self.declared
    }

    /// Number of complete items actually present, including any past the declared count.
    pub fn present(&self) -> usize {
        self.fields.len() + self.surplus
    }

    /// Total encoded size of the frame payload in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Number of the next field to be decoded.
    pub fn field_number(&self) -> usize {
        self.base + self.next
    }

    /// Declared fields not yet decoded.
    pub fn remaining(&self) -> usize {
        self.declared.saturating_sub(self.next)
    }

    /// Validates the frame's length against the minimum total field count of its message type
    /// and returns how many optional trailing fields follow the required ones.
    pub fn check_length(&self, minimum: usize) -> Result<usize, CodecError> {
        let present = self.present();
        if self.declared >= minimum && present == self.declared {
            return Ok(self.declared - minimum);
        }
        match &self.fault {
            Some((at, message)) => Err(CodecError::field(self.base + at, message)),
            None => Err(CodecError::WrongMessageLength {
                declared: self.declared,
                minimum,
                present,
            }),
        }
    }

    fn next_field(&mut self) -> Result<(usize, Range<usize>), CodecError> {
        let field = self.field_number();
        let Some(range) = self.fields.get(self.next).cloned() else {
            return Err(match &self.fault {
                Some((at, message)) if *at == self.next => CodecError::field(field, message),
                _ => CodecError::field(field, "field not present in frame"),
            });
        };
        self.next += 1;
        Ok((field, range))
    }

    /// Decodes the next field as a `T`.
    pub fn decode<T: DeserializeOwned>(&mut self) -> Result<T, CodecError> {
        let (field, range) = self.next_field()?;
        serde_cbor::from_slice(&self.data[range]).map_err(|err| CodecError::field(field, err))
    }

    /// Decodes the next field as a CBOR byte string.
    pub fn decode_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        Ok(self.decode::<WireBytes>()?.0)
    }

    /// Skips the next field without interpreting it.
    pub fn skip(&mut self) -> Result<(), CodecError> {
        self.next_field().map(|_| ())
    }
}

/// Builds one frame payload.
#[derive(Debug, Default)]
pub struct FieldEncoder {
    fields: u64,
    body: Vec<u8>,
}

impl FieldEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> u64 {
        self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields == 0
    }

    pub fn push<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CodecError> {
        let mark = self.body.len();
        if let Err(err) = serde_cbor::to_writer(&mut self.body, &value) {
            self.body.truncate(mark);
            return Err(CodecError::encode(err));
        }
        self.fields += 1;
        Ok(())
    }

    /// Appends a CBOR byte string field.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        encode_head(2, bytes.len() as u64, &mut self.body);
        self.body.extend_from_slice(bytes);
        self.fields += 1;
    }

    pub fn finish(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 9);
        encode_head(4, self.fields, &mut out);
        out.extend_from_slice(&self.body);
        out
    }
}

/// CBOR byte string that also accepts an array-of-u8 encoding when decoding.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WireBytes(pub Vec<u8>);

impl Serialize for WireBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for WireBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::{Error, SeqAccess, Visitor};

        struct BytesVisitor;

        impl<'de> Visitor<'de> for BytesVisitor {
            type Value = WireBytes;

            fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                formatter.write_str("a CBOR byte string (or a sequence of u8)")
            }

            fn visit_bytes<E: Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                Ok(WireBytes(v.to_vec()))
            }

            fn visit_byte_buf<E: Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                Ok(WireBytes(v))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut out = Vec::new();
                while let Some(b) = seq.next_element::<u8>()? {
                    out.push(b);
                }
                Ok(WireBytes(out))
            }
        }

        deserializer.deserialize_bytes(BytesVisitor)
    }
}
