//! Purpose: End-to-end coverage for the decoding pipeline through the public API.
//! Exports: Integration tests only.
//! Role: Exercise drain, spill, decode, interception and pool release together.
//! Invariants: Every decode leaves no outstanding decoders or scratch buffers.
//! Invariants: Spilled bodies leave no temp file behind.
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bodybind::api::{
    BodyBuffer, DecodeOptions, DecodeRequest, DecodeResult, DecodingPipeline, ErrorKind,
    PipelineConfig, ReaderFactory, StreamTextReader, TextEncoding, TextRead,
};
use bodybind::decode_object;
use bytes::Bytes;
use serde_json::{Value, json};

#[derive(Debug, Default, PartialEq)]
struct Profile {
    name: String,
    count: i32,
    active: bool,
    tags: Vec<String>,
    score: Option<f64>,
    labels: BTreeMap<String, i64>,
    note: Value,
}

decode_object!(Profile {
    name,
    count,
    active,
    tags,
    score,
    labels,
    note,
});

#[derive(Debug, Default, PartialEq)]
struct Wide {
    a: i32,
    b: i32,
    c: bool,
    d: i32,
    e: String,
}

decode_object!(Wide { a, b, c, d, e });

fn body(text: &str) -> impl tokio_stream::Stream<Item = io::Result<Bytes>> {
    tokio_stream::iter(vec![Ok(Bytes::copy_from_slice(text.as_bytes()))])
}

fn chunked_body(data: Vec<u8>, chunk: usize) -> impl tokio_stream::Stream<Item = io::Result<Bytes>> {
    let data = Bytes::from(data);
    let chunks: Vec<io::Result<Bytes>> = (0..data.len())
        .step_by(chunk)
        .map(|start| Ok(data.slice(start..(start + chunk).min(data.len()))))
        .collect();
    tokio_stream::iter(chunks)
}

fn pipeline() -> DecodingPipeline {
    DecodingPipeline::new(PipelineConfig::default()).expect("pipeline")
}

fn reader_factory<F>(factory: F) -> ReaderFactory
where
    F: for<'a> Fn(&'a mut BodyBuffer, TextEncoding) -> Box<dyn TextRead + 'a> + Send + Sync + 'static,
{
    Arc::new(factory)
}

#[tokio::test]
async fn null_for_value_type_keeps_default_without_error() {
    let pipeline = pipeline();
    let mut sink = pipeline.new_sink();
    let result: DecodeResult<Profile> = pipeline
        .decode(
            DecodeRequest::new(body(r#"{"count":null,"active":null,"name":"x"}"#)),
            "profile",
            &mut sink,
        )
        .await
        .expect("decode");
    let profile = result.into_value().expect("value");
    assert_eq!(profile.count, 0);
    assert!(!profile.active);
    assert_eq!(profile.name, "x");
    assert!(sink.is_empty());
}

#[tokio::test]
async fn spilled_and_in_memory_bodies_decode_identically() {
    let name: String = "näme-€-".repeat(700);
    let text = format!(
        r#"{{"name":"{name}","count":null,"active":null,"tags":["a",1,"b"],"labels":{{"k":3}},"note":[1,{{"x":null}}]}}"#
    );
    let mut outcomes = Vec::new();
    for threshold in [16, 1 << 20] {
        let seen: Arc<Mutex<Option<bool>>> = Arc::new(Mutex::new(None));
        let record = Arc::clone(&seen);
        let factory = reader_factory(move |buffer, encoding| {
            *record.lock().expect("lock") = Some(buffer.is_spilled());
            Box::new(StreamTextReader::new(buffer, encoding))
        });
        let pipeline = DecodingPipeline::new(PipelineConfig {
            options: DecodeOptions {
                memory_threshold_bytes: threshold,
                reader_factory: Some(factory),
                ..DecodeOptions::default()
            },
            ..PipelineConfig::default()
        })
        .expect("pipeline");
        let mut sink = pipeline.new_sink();
        let result: DecodeResult<Profile> = pipeline
            .decode(
                DecodeRequest::new(chunked_body(text.clone().into_bytes(), 7)),
                "m",
                &mut sink,
            )
            .await
            .expect("decode");
        let spilled = seen.lock().expect("lock").take().expect("factory ran");
        let keys: Vec<String> = sink.keys().into_iter().map(str::to_string).collect();
        outcomes.push((spilled, result, keys));
    }

    let (spilled_small, result_small, keys_small) = outcomes.remove(0);
    let (spilled_large, result_large, keys_large) = outcomes.remove(0);
    assert!(spilled_small);
    assert!(!spilled_large);
    assert_eq!(result_small, result_large);
    assert_eq!(keys_small, keys_large);
    assert_eq!(keys_small, vec!["m.tags[1]".to_string()]);
    let profile = result_small.into_value().expect("value");
    assert_eq!(profile.name, name);
    assert_eq!((profile.count, profile.active), (0, false));
    assert_eq!(profile.tags, vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test]
async fn empty_string_and_bad_element_are_tolerated() {
    let pipeline = pipeline();
    let mut sink = pipeline.new_sink();
    let result: DecodeResult<Profile> = pipeline
        .decode(
            DecodeRequest::new(body(r#"{"count":"","tags":["a",1,"b"]}"#)),
            "",
            &mut sink,
        )
        .await
        .expect("decode");
    let profile = result.into_value().expect("value");
    assert_eq!(profile.count, 0);
    assert_eq!(profile.tags, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(sink.len(), 1);
    assert_eq!(sink.keys(), vec!["tags[1]"]);
}

#[tokio::test]
async fn malformed_member_does_not_lose_valid_siblings() {
    let pipeline = pipeline();
    let mut sink = pipeline.new_sink();
    let result: DecodeResult<Wide> = pipeline
        .decode(
            DecodeRequest::new(body(r#"{"a": 1, "b": 2, "c": tru, "d": 4, "e": "five"}"#)),
            "wide",
            &mut sink,
        )
        .await
        .expect("decode");
    assert_eq!(
        result.into_value().expect("value"),
        Wide {
            a: 1,
            b: 2,
            c: false,
            d: 4,
            e: "five".to_string(),
        }
    );
    assert_eq!(sink.keys(), vec!["wide.c"]);
    let entry = sink.iter().next().expect("entry");
    assert_eq!(entry.detail.error().kind(), ErrorKind::Syntax);
    assert_eq!(entry.parameter, "wide");
}

#[tokio::test]
async fn nested_containers_and_dynamic_values_decode() {
    let pipeline = pipeline();
    let mut sink = pipeline.new_sink();
    let result: DecodeResult<Profile> = pipeline
        .decode(
            DecodeRequest::new(body(
                r#"{"NAME": "n", "score": 1.5, "labels": {"x": 1, "y": "bad"}, "note": {"k": [1, null]}}"#,
            )),
            "p",
            &mut sink,
        )
        .await
        .expect("decode");
    let profile = result.into_value().expect("value");
    assert_eq!(profile.name, "n");
    assert_eq!(profile.score, Some(1.5));
    assert_eq!(profile.labels.get("x"), Some(&1));
    assert_eq!(profile.note, json!({"k": [1, null]}));
    assert_eq!(sink.keys(), vec!["p.labels.y"]);
}

#[tokio::test]
async fn large_body_spills_and_temp_file_is_removed() {
    let seen: Arc<Mutex<Option<(bool, Option<PathBuf>, usize)>>> = Arc::new(Mutex::new(None));
    let record = Arc::clone(&seen);
    let factory = reader_factory(move |buffer, encoding| {
        *record.lock().expect("lock") = Some((
            buffer.is_spilled(),
            buffer.spill_path().map(|path| path.to_path_buf()),
            buffer.memory_threshold(),
        ));
        Box::new(StreamTextReader::new(buffer, encoding))
    });
    let pipeline = DecodingPipeline::new(PipelineConfig {
        options: DecodeOptions {
            memory_threshold_bytes: 1024 * 1024,
            reader_factory: Some(factory),
            ..DecodeOptions::default()
        },
        ..PipelineConfig::default()
    })
    .expect("pipeline");

    let name = "a".repeat(2 * 1024 * 1024);
    let text = format!(r#"{{"name":"{name}","count":3}}"#);
    let len = text.len() as u64;
    let mut sink = pipeline.new_sink();
    let result: DecodeResult<Profile> = pipeline
        .decode(
            DecodeRequest::new(chunked_body(text.into_bytes(), 64 * 1024)).with_content_length(Some(len)),
            "profile",
            &mut sink,
        )
        .await
        .expect("decode");
    let profile = result.into_value().expect("value");
    assert_eq!(profile.name.len(), 2 * 1024 * 1024);
    assert_eq!(profile.count, 3);
    assert!(sink.is_empty());

    let (spilled, path, threshold) = seen.lock().expect("lock").take().expect("factory ran");
    assert!(spilled);
    assert_eq!(threshold, 1024 * 1024);
    let path = path.expect("spill path");
    assert!(!path.exists(), "temp file left behind: {}", path.display());
}

#[tokio::test]
async fn small_body_stays_in_memory_with_declared_threshold() {
    let seen: Arc<Mutex<Option<(bool, usize)>>> = Arc::new(Mutex::new(None));
    let record = Arc::clone(&seen);
    let factory = reader_factory(move |buffer, encoding| {
        *record.lock().expect("lock") = Some((buffer.is_spilled(), buffer.memory_threshold()));
        Box::new(StreamTextReader::new(buffer, encoding))
    });
    let pipeline = DecodingPipeline::new(PipelineConfig {
        options: DecodeOptions {
            reader_factory: Some(factory),
            ..DecodeOptions::default()
        },
        ..PipelineConfig::default()
    })
    .expect("pipeline");

    let text = r#"{"count": 5}"#;
    let mut sink = pipeline.new_sink();
    let result: DecodeResult<Profile> = pipeline
        .decode(
            DecodeRequest::new(body(text)).with_content_length(Some(text.len() as u64)),
            "profile",
            &mut sink,
        )
        .await
        .expect("decode");
    assert_eq!(result.into_value().map(|profile| profile.count), Some(5));
    assert_eq!(seen.lock().expect("lock").take(), Some((false, text.len())));
}

#[tokio::test]
async fn empty_body_is_no_value_unless_treated_as_default() {
    let pipeline = pipeline();
    for input in ["", "   ", "null"] {
        let mut sink = pipeline.new_sink();
        let result: DecodeResult<Profile> = pipeline
            .decode(DecodeRequest::new(body(input)), "profile", &mut sink)
            .await
            .expect("decode");
        assert_eq!(result, DecodeResult::NoValue, "input {input:?}");
        assert!(sink.is_empty());
    }

    let options = DecodeOptions {
        treat_empty_body_as_default: true,
        ..DecodeOptions::default()
    };
    let mut sink = pipeline.new_sink();
    let result: DecodeResult<Profile> = pipeline
        .decode_with(DecodeRequest::new(body("")), "profile", &mut sink, &options)
        .await
        .expect("decode");
    assert_eq!(result, DecodeResult::Success(None));
}

#[tokio::test]
async fn repeated_decodes_do_not_grow_pools() {
    let pipeline = pipeline();
    let mut retained_after_first = None;
    for round in 0..25 {
        let mut sink = pipeline.new_sink();
        let input = if round % 2 == 0 {
            r#"{"name": "ok", "tags": ["a", "b"]}"#
        } else {
            r#"{"name": 7, "tags": ["a", {"x": 1}], "count": "nope", "labels": {"#
        };
        let _: DecodeResult<Profile> = pipeline
            .decode(DecodeRequest::new(body(input)), "profile", &mut sink)
            .await
            .expect("decode");
        assert_eq!(pipeline.decoder_pool().outstanding(), 0);
        assert_eq!(pipeline.scratch_pool().outstanding(), 0);
        let retained = pipeline.scratch_pool().chars().retained();
        match retained_after_first {
            None => retained_after_first = Some(retained),
            Some(first) => assert!(retained <= first + 1, "round {round}: {retained} > {first}"),
        }
    }
    assert_eq!(pipeline.decoder_pool().created(), 1);
    assert_eq!(pipeline.decoder_pool().idle(), 1);
}

#[tokio::test]
async fn utf16_body_decodes() {
    let pipeline = pipeline();
    let mut bytes = vec![0xFF, 0xFE];
    for unit in r#"{"name": "café é", "count": 2}"#.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    let mut sink = pipeline.new_sink();
    let result: DecodeResult<Profile> = pipeline
        .decode(
            DecodeRequest::new(chunked_body(bytes, 3)).with_encoding(TextEncoding::Utf16Le),
            "profile",
            &mut sink,
        )
        .await
        .expect("decode");
    let profile = result.into_value().expect("value");
    assert_eq!(profile.name, "café é");
    assert_eq!(profile.count, 2);
    assert!(sink.is_empty());
}

#[tokio::test]
async fn drain_timeout_is_fatal() {
    let pipeline = DecodingPipeline::new(PipelineConfig {
        options: DecodeOptions {
            drain_timeout: Some(Duration::from_millis(20)),
            ..DecodeOptions::default()
        },
        ..PipelineConfig::default()
    })
    .expect("pipeline");
    let mut sink = pipeline.new_sink();
    let stalled = tokio_stream::pending::<io::Result<Bytes>>();
    let err = pipeline
        .decode::<Profile, _, _, _>(DecodeRequest::new(stalled), "profile", &mut sink)
        .await
        .expect_err("timeout");
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(sink.is_empty());
}

#[tokio::test]
async fn stream_errors_are_fatal_io() {
    let pipeline = pipeline();
    let mut sink = pipeline.new_sink();
    let broken = tokio_stream::iter(vec![
        Ok(Bytes::from_static(b"{\"name\":")),
        Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
    ]);
    let err = pipeline
        .decode::<Profile, _, _, _>(DecodeRequest::new(broken), "profile", &mut sink)
        .await
        .expect_err("io error");
    assert_eq!(err.kind(), ErrorKind::Io);
    assert_eq!(pipeline.decoder_pool().outstanding(), 0);
}

#[tokio::test]
async fn truncated_body_reports_once_and_keeps_partial_model() {
    let pipeline = pipeline();
    let mut sink = pipeline.new_sink();
    let result: DecodeResult<Profile> = pipeline
        .decode(DecodeRequest::new(body(r#"{"name": "n", "count": 4, "tags": ["a""#)), "p", &mut sink)
        .await
        .expect("decode");
    let profile = result.into_value().expect("value");
    assert_eq!(profile.name, "n");
    assert_eq!(profile.count, 4);
    assert_eq!(sink.len(), 1);
}
