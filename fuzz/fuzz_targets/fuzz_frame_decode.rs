#![no_main]

use framed_rpc_proto::{
    prototype, CompressionType, CompressorCache, FieldDecoder, MessageType, Method, MethodVersion,
};
use libfuzzer_sys::fuzz_target;

const MAX_INPUT_SIZE: usize = 256 * 1024;

fn run_one(input: &[u8]) {
    let input = &input[..input.len().min(MAX_INPUT_SIZE)];

    // Goal: never panic, never allocate from an untrusted count, never read past the declared
    // fields, whatever the payload says about itself.
    let Ok(mut d) = FieldDecoder::new(input) else {
        return;
    };
    let _ = d.check_length(1);
    let Ok(tag) = d.decode::<i64>() else {
        return;
    };
    let version = match MessageType::from_tag(tag) {
        Some(MessageType::CallV2 | MessageType::NotifyV2 | MessageType::CancelV2) => {
            MethodVersion::V2
        }
        _ => MethodVersion::V1,
    };
    let _ = Method::decode(version, &mut d);

    let compressors = CompressorCache::new(
        vec![CompressionType::Gzip, CompressionType::Zlib],
        1024 * 1024,
    );
    while d.remaining() > 0 {
        let before = d.remaining();
        let _ = compressors.decode_field(
            CompressionType::Gzip,
            &mut d,
            prototype::<serde_cbor::Value>(),
        );
        if d.remaining() == before && d.skip().is_err() {
            break;
        }
    }
}

fuzz_target!(|data: &[u8]| {
    run_one(data);
});
