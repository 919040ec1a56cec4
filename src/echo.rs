//! Purpose: Sample model and the shared echo routine used by `serve` and `decode`.
//! Exports: `EchoRequest`, `EchoItem`, `decode_echo`, `ECHO_PARAMETER`.
//! Role: End-to-end exercise of the pipeline: negotiate, decode, report field errors.
//! Invariants: Field errors never fail the echo; only fatal pipeline errors do.
use std::error::Error as StdError;

use bytes::Bytes;
use serde::Serialize;
use serde_json::{Value, json};
use tokio_stream::Stream;

use bodybind::api::{
    DecodeRequest, DecodeResult, DecodingPipeline, Error, ErrorKind, FieldErrors,
    SUPPORTED_MEDIA_TYPES, is_json_media_type, negotiate_encoding,
};
use bodybind::decode_object;

pub const ECHO_PARAMETER: &str = "echoRequest";

#[derive(Debug, Default, PartialEq, Serialize)]
pub struct EchoItem {
    pub sku: String,
    pub quantity: i32,
    pub price: f64,
}

decode_object!(EchoItem { sku, quantity, price });

#[derive(Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EchoRequest {
    pub id: i64,
    pub name: String,
    pub count: i32,
    pub active: bool,
    pub rating: Option<f64>,
    pub tags: Vec<String>,
    pub items: Vec<EchoItem>,
    pub attributes: std::collections::BTreeMap<String, String>,
    pub nickname: Option<String>,
    pub extra: Value,
}

decode_object!(EchoRequest {
    id,
    name,
    count,
    active,
    rating,
    tags,
    items,
    attributes,
    nickname,
    extra,
});

/// Decode an echo body and render `{ "model", "noValue", "errors" }`.
pub async fn decode_echo<S, E>(
    pipeline: &DecodingPipeline,
    content_type: Option<&str>,
    content_length: Option<u64>,
    body: S,
) -> Result<Value, Error>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: StdError + Send + Sync + 'static,
{
    let Some(content_type) = content_type else {
        return Err(unsupported_media_type("missing content type"));
    };
    if !is_json_media_type(content_type) {
        return Err(unsupported_media_type(&format!(
            "unsupported content type: {content_type}"
        )));
    }
    let encoding = negotiate_encoding(Some(content_type))?;
    let request = DecodeRequest::new(body)
        .with_content_length(content_length)
        .with_encoding(encoding);

    let mut errors = pipeline.new_sink();
    let result: DecodeResult<EchoRequest> =
        pipeline.decode(request, ECHO_PARAMETER, &mut errors).await?;
    if !errors.is_empty() {
        tracing::info!(errors = errors.len(), "echo request bound with field errors");
    }
    Ok(echo_json(result, &errors))
}

fn echo_json(result: DecodeResult<EchoRequest>, errors: &FieldErrors) -> Value {
    let no_value = matches!(result, DecodeResult::NoValue);
    json!({
        "model": result.into_value(),
        "noValue": no_value,
        "errors": errors.to_json(),
    })
}

fn unsupported_media_type(message: &str) -> Error {
    Error::new(ErrorKind::Unsupported)
        .with_message(message.to_string())
        .with_hint(format!("Send one of: {}.", SUPPORTED_MEDIA_TYPES.join(", ")))
}
