//! Purpose: Coverage for field-error keys, client messages and the error limit.
//! Exports: Integration tests only.
//! Role: Verify what a host sees in its sink after a tolerant decode.
//! Invariants: Parser text reaches clients only when internal messages are allowed.
use std::io;

use bodybind::api::{
    DecodeOptions, DecodeRequest, DecodeResult, DecodingPipeline, ErrorKind, FieldError,
    GENERIC_CLIENT_MESSAGE, PipelineConfig, field_key,
};
use bodybind::decode_object;
use bytes::Bytes;
use serde_json::json;

#[derive(Debug, Default)]
struct Line {
    sku: String,
    qty: u16,
}

decode_object!(Line { sku, qty as "quantity" });

#[derive(Debug, Default)]
struct Cart {
    owner: String,
    lines: Vec<Line>,
    total: f64,
}

decode_object!(Cart { owner, lines, total });

fn body(text: &str) -> impl tokio_stream::Stream<Item = io::Result<Bytes>> {
    tokio_stream::iter(vec![Ok(Bytes::copy_from_slice(text.as_bytes()))])
}

fn pipeline(allow_messages: bool, max_errors: usize) -> DecodingPipeline {
    DecodingPipeline::new(PipelineConfig {
        max_errors,
        options: DecodeOptions {
            allow_internal_error_messages: allow_messages,
            ..DecodeOptions::default()
        },
        ..PipelineConfig::default()
    })
    .expect("pipeline")
}

#[test]
fn keys_join_prefix_and_path() {
    assert_eq!(field_key("cart", "lines[0].quantity"), "cart.lines[0].quantity");
    assert_eq!(field_key("cart", "[2]"), "cart[2]");
    assert_eq!(field_key("cart", ""), "cart");
    assert_eq!(field_key("", "owner"), "owner");
}

#[tokio::test]
async fn nested_failures_are_keyed_by_path() {
    let pipeline = pipeline(false, 200);
    let mut sink = pipeline.new_sink();
    let result: DecodeResult<Cart> = pipeline
        .decode(
            DecodeRequest::new(body(
                r#"{"owner": "o", "lines": [{"sku": "a", "quantity": 70000}, {"sku": "b", "quantity": 2}], "total": "x"}"#,
            )),
            "cart",
            &mut sink,
        )
        .await
        .expect("decode");
    let cart = result.into_value().expect("value");
    assert_eq!(cart.owner, "o");
    assert_eq!(cart.lines.len(), 2);
    assert_eq!(cart.lines[0].qty, 0);
    assert_eq!(cart.lines[1].qty, 2);
    assert_eq!(sink.keys(), vec!["cart.lines[0].quantity", "cart.total"]);

    let entry = sink.get("cart.lines[0].quantity").next().expect("entry");
    assert_eq!(entry.member_type, "u16");
    assert_eq!(entry.detail.error().kind(), ErrorKind::Conversion);
    assert!(!entry.detail.is_safe());
    assert_eq!(entry.detail.client_message(), GENERIC_CLIENT_MESSAGE);
}

#[tokio::test]
async fn allowed_messages_carry_path_and_location() {
    let pipeline = pipeline(true, 200);
    let mut sink = pipeline.new_sink();
    let _: DecodeResult<Cart> = pipeline
        .decode(DecodeRequest::new(body("{\"owner\": \"o\",\n \"total\": [1]}")), "cart", &mut sink)
        .await
        .expect("decode");
    let entry = sink.get("cart.total").next().expect("entry");
    assert!(entry.detail.is_safe());
    let message = entry.detail.client_message();
    assert!(message.contains("Path 'total'"), "{message}");
    assert!(message.contains("line 2"), "{message}");
}

#[tokio::test]
async fn error_limit_drops_extra_failures() {
    let pipeline = pipeline(false, 2);
    let mut sink = pipeline.new_sink();
    let result: DecodeResult<Vec<u8>> = pipeline
        .decode(DecodeRequest::new(body(r#"[1, "a", 2, "b", "c", 300, 3]"#)), "bytes", &mut sink)
        .await
        .expect("decode");
    assert_eq!(result, DecodeResult::Success(Some(vec![1, 2, 3])));
    assert_eq!(sink.len(), 2);
    assert!(sink.has_overflowed());
    assert_eq!(
        sink.to_json(),
        json!({
            "bytes[1]": [GENERIC_CLIENT_MESSAGE],
            "bytes[3]": [GENERIC_CLIENT_MESSAGE],
        })
    );
}

#[tokio::test]
async fn plain_vec_sink_collects_everything() {
    let pipeline = pipeline(false, 1);
    let mut sink: Vec<FieldError> = Vec::new();
    let _: DecodeResult<Vec<bool>> = pipeline
        .decode(DecodeRequest::new(body(r#"[0, 1, true]"#)), "flags", &mut sink)
        .await
        .expect("decode");
    let keys: Vec<&str> = sink.iter().map(|entry| entry.key.as_str()).collect();
    assert_eq!(keys, vec!["flags[0]", "flags[1]"]);
    assert!(sink.iter().all(|entry| entry.parameter == "flags"));
}
