//! Message kinds and their frame shapes.
//!
//! Every frame starts with a [`MessageType`] tag. The tag selects an entry in [`SHAPES`], which
//! fixes the minimum field count and the decode function for that kind. Fields past the minimum
//! are optional trailing fields; the first one, when present, carries log tags.

use std::sync::Arc;

use framed_rpc_proto::{
    CodecError, CompressionType, CompressorCache, DynValue, FieldDecoder, FieldEncoder, LogTags,
    MessageType, Method, MethodVersion, SeqNumber,
};
use serde::Serialize;

use crate::call::{CallContainer, CallResult, PendingCall};
use crate::instrument::{InstrumentationStorage, NetworkInstrumenter};
use crate::registry::{MethodHandler, Registry};
use crate::{CallError, DecodeError, MessageError};

/// A decoded Call or Notify, resolved to its handler.
pub(crate) struct Inbound {
    /// `None` for notifications.
    pub(crate) seqno: Option<SeqNumber>,
    pub(crate) method: Method,
    pub(crate) handler: Arc<MethodHandler>,
    pub(crate) arg: DynValue,
    pub(crate) compression: CompressionType,
    pub(crate) tags: LogTags,
    pub(crate) instrumenter: NetworkInstrumenter,
}

pub(crate) enum Message {
    Call(Inbound),
    Notify(Inbound),
    Cancel { seqno: SeqNumber, method: Method },
    /// Already delivered to the waiting caller during decode.
    Response,
}

/// What decoding needs from the connection.
pub(crate) struct DecodeEnv<'a> {
    pub(crate) registry: &'a Registry,
    pub(crate) compressors: &'a CompressorCache,
    pub(crate) calls: &'a CallContainer,
    pub(crate) instrumentation: &'a Arc<dyn InstrumentationStorage>,
}

type DecodeFn = fn(&mut FrameState<'_, '_>) -> Result<Message, MessageError>;

struct MessageShape {
    typ: MessageType,
    /// Required fields after the type tag, not counting the method identity.
    base_len: usize,
    method: Option<MethodVersion>,
    decode: DecodeFn,
}

impl MessageShape {
    fn min_len(&self) -> usize {
        1 + self.base_len + self.method.map_or(0, Method::num_fields)
    }
}

static SHAPES: [MessageShape; 8] = [
    MessageShape {
        typ: MessageType::Call,
        base_len: 2,
        method: Some(MethodVersion::V1),
        decode: decode_call,
    },
    MessageShape {
        typ: MessageType::Response,
        base_len: 3,
        method: None,
        decode: decode_response,
    },
    MessageShape {
        typ: MessageType::Notify,
        base_len: 1,
        method: Some(MethodVersion::V1),
        decode: decode_notify,
    },
    MessageShape {
        typ: MessageType::Cancel,
        base_len: 1,
        method: Some(MethodVersion::V1),
        decode: decode_cancel,
    },
    MessageShape {
        typ: MessageType::CallCompressed,
        base_len: 3,
        method: Some(MethodVersion::V1),
        decode: decode_call_compressed,
    },
    MessageShape {
        typ: MessageType::CallV2,
        base_len: 2,
        method: Some(MethodVersion::V2),
        decode: decode_call,
    },
    MessageShape {
        typ: MessageType::NotifyV2,
        base_len: 1,
        method: Some(MethodVersion::V2),
        decode: decode_notify,
    },
    MessageShape {
        typ: MessageType::CancelV2,
        base_len: 1,
        method: Some(MethodVersion::V2),
        decode: decode_cancel,
    },
];

fn shape_of(typ: MessageType) -> Option<&'static MessageShape> {
    SHAPES.iter().find(|shape| shape.typ == typ)
}

struct FrameState<'f, 'e> {
    d: FieldDecoder<'f>,
    env: &'e DecodeEnv<'e>,
    typ: MessageType,
    version: MethodVersion,
    trailing: usize,
    // Learned so far; reported with any failure.
    method: Option<String>,
    compression: CompressionType,
    seqno: Option<SeqNumber>,
}

/// Decodes one frame payload.
///
/// A Response is matched against the pending calls and delivered here; the caller only sees
/// [`Message::Response`].
pub(crate) fn decode_rpc(frame: &[u8], env: &DecodeEnv<'_>) -> Result<Message, DecodeError> {
    let mut d = FieldDecoder::new(frame).map_err(DecodeError::new)?;
    let declared = d.declared();

    let fail = |typ: Option<MessageType>, source: MessageError| DecodeError {
        typ,
        len: declared,
        ..DecodeError::new(source)
    };

    let tag: i64 = d.decode().map_err(|err| fail(None, err.into()))?;
    let typ = MessageType::from_tag(tag)
        .ok_or_else(|| fail(None, CodecError::InvalidMessageType { tag }.into()))?;
    let shape = shape_of(typ)
        .ok_or_else(|| fail(None, CodecError::InvalidMessageType { tag }.into()))?;
    let trailing = d
        .check_length(shape.min_len())
        .map_err(|err| fail(Some(typ), err.into()))?;

    let mut state = FrameState {
        d,
        env,
        typ,
        version: shape.method.unwrap_or(MethodVersion::V1),
        trailing,
        method: None,
        compression: CompressionType::None,
        seqno: None,
    };
    (shape.decode)(&mut state).map_err(|source| DecodeError {
        typ: Some(typ),
        method: state.method.take(),
        len: declared,
        compression: state.compression,
        seqno: state.seqno,
        source,
    })
}

fn decode_call(s: &mut FrameState<'_, '_>) -> Result<Message, MessageError> {
    let seqno: SeqNumber = s.d.decode()?;
    s.seqno = Some(seqno);
    decode_inbound(s).map(Message::Call)
}

fn decode_call_compressed(s: &mut FrameState<'_, '_>) -> Result<Message, MessageError> {
    let seqno: SeqNumber = s.d.decode()?;
    s.seqno = Some(seqno);
    s.compression = s.d.decode()?;
    decode_inbound(s).map(Message::Call)
}

fn decode_notify(s: &mut FrameState<'_, '_>) -> Result<Message, MessageError> {
    decode_inbound(s).map(Message::Notify)
}

fn decode_cancel(s: &mut FrameState<'_, '_>) -> Result<Message, MessageError> {
    let seqno: SeqNumber = s.d.decode()?;
    s.seqno = Some(seqno);
    let method = Method::decode(s.version, &mut s.d)?;
    s.method = Some(method.to_string());
    Ok(Message::Cancel { seqno, method })
}

fn decode_inbound(s: &mut FrameState<'_, '_>) -> Result<Inbound, MessageError> {
    let mut method = Method::decode(s.version, &mut s.d)?;
    let name = method.to_string();
    let mut instrumenter = NetworkInstrumenter::new(s.env.instrumentation.clone(), s.typ, &name);
    instrumenter.increment_size(s.d.size());
    s.method = Some(name);

    match decode_inbound_body(s, &mut method) {
        Ok((handler, arg, tags)) => Ok(Inbound {
            seqno: s.seqno,
            method,
            handler,
            arg,
            compression: s.compression,
            tags,
            instrumenter,
        }),
        Err(err) => {
            instrumenter.record_and_finish(0);
            Err(err)
        }
    }
}

type InboundBody = (Arc<MethodHandler>, DynValue, LogTags);

fn decode_inbound_body(
    s: &mut FrameState<'_, '_>,
    method: &mut Method,
) -> Result<InboundBody, MessageError> {
    let handler = method.resolve(s.env.registry)?;
    s.method = Some(method.to_string());
    let arg = s
        .env
        .compressors
        .decode_field(s.compression, &mut s.d, handler.arg_prototype())?;
    let tags = decode_tags(&mut s.d, s.trailing)?;
    Ok((handler, arg, tags))
}

fn decode_tags(d: &mut FieldDecoder<'_>, trailing: usize) -> Result<LogTags, CodecError> {
    if trailing == 0 {
        return Ok(LogTags::new());
    }
    let tags: Option<LogTags> = d.decode()?;
    // Fields past the tags are reserved.
    for _ in 1..trailing {
        d.skip()?;
    }
    Ok(tags.unwrap_or_default())
}

fn decode_response(s: &mut FrameState<'_, '_>) -> Result<Message, MessageError> {
    let seqno: SeqNumber = s.d.decode()?;
    s.seqno = Some(seqno);
    let mut call = s
        .env
        .calls
        .retrieve_and_remove(seqno)
        .ok_or(MessageError::CallNotFound { seqno })?;
    s.method = Some(call.method.clone());
    s.compression = call.compression;
    call.instrumenter.increment_size(s.d.size());

    let outcome = response_outcome(&mut s.d, s.env.compressors, &call);
    call.complete(outcome);
    Ok(Message::Response)
}

fn response_outcome(
    d: &mut FieldDecoder<'_>,
    compressors: &CompressorCache,
    call: &PendingCall,
) -> CallResult {
    let wire = (call.unwrapper.prototype())(d).map_err(CallError::Decode)?;
    match call.unwrapper.unwrap_dyn(wire) {
        Err(err) => return Err(CallError::Dispatch(err)),
        Ok(Some(err)) => return Err(CallError::Remote(err)),
        Ok(None) => {}
    }
    let Some(result) = call.result else {
        return Ok(None);
    };
    compressors
        .decode_field(call.compression, d, result)
        .map(Some)
        .map_err(CallError::Decode)
}

/// The message type [`encode_call`] picks for `method` and `compression`.
pub(crate) fn call_type(method: &Method, compression: CompressionType) -> MessageType {
    match method.version() {
        MethodVersion::V2 => MessageType::CallV2,
        MethodVersion::V1 if compression.is_none() => MessageType::Call,
        MethodVersion::V1 => MessageType::CallCompressed,
    }
}

/// Encodes a Call. A compression type other than `None` selects CallCompressed, which only
/// exists for V1 identities.
pub(crate) fn encode_call<A: Serialize + ?Sized>(
    seqno: SeqNumber,
    method: &Method,
    compression: CompressionType,
    compressors: &CompressorCache,
    arg: &A,
    tags: &LogTags,
) -> Result<Vec<u8>, CodecError> {
    let mut e = FieldEncoder::new();
    let typ = call_type(method, compression);
    if typ != MessageType::CallCompressed {
        e.push(&typ)?;
        e.push(&seqno)?;
        method.encode(&mut e)?;
        e.push(arg)?;
    } else {
        e.push(&MessageType::CallCompressed)?;
        e.push(&seqno)?;
        e.push(&compression)?;
        method.encode(&mut e)?;
        compressors.encode_field(compression, &mut e, arg)?;
    }
    if !tags.is_empty() {
        e.push(tags)?;
    }
    Ok(e.finish())
}

pub(crate) fn encode_notify<A: Serialize + ?Sized>(
    method: &Method,
    arg: &A,
    tags: &LogTags,
) -> Result<Vec<u8>, CodecError> {
    let typ = match method.version() {
        MethodVersion::V1 => MessageType::Notify,
        MethodVersion::V2 => MessageType::NotifyV2,
    };
    let mut e = FieldEncoder::new();
    e.push(&typ)?;
    method.encode(&mut e)?;
    e.push(arg)?;
    if !tags.is_empty() {
        e.push(tags)?;
    }
    Ok(e.finish())
}

pub(crate) fn encode_cancel(seqno: SeqNumber, method: &Method) -> Result<Vec<u8>, CodecError> {
    let typ = match method.version() {
        MethodVersion::V1 => MessageType::Cancel,
        MethodVersion::V2 => MessageType::CancelV2,
    };
    let mut e = FieldEncoder::new();
    e.push(&typ)?;
    e.push(&seqno)?;
    method.encode(&mut e)?;
    Ok(e.finish())
}

/// Encodes a Response. The result is compressed when the call arrived compressed.
pub(crate) fn encode_response(
    seqno: SeqNumber,
    error: &serde_cbor::Value,
    result: &serde_cbor::Value,
    compression: CompressionType,
    compressors: &CompressorCache,
) -> Result<Vec<u8>, CodecError> {
    let mut e = FieldEncoder::new();
    e.push(&MessageType::Response)?;
    e.push(&seqno)?;
    e.push(error)?;
    compressors.encode_field(compression, &mut e, result)?;
    Ok(e.finish())
}
