//! Purpose: Orchestrate one request-body decode from raw stream to typed value.
//! Exports: `DecodingPipeline`, `PipelineConfig`, `DecodeOptions`, `DecodeRequest`,
//! `DecodeResult`, `ReaderFactory`.
//! Role: Entry point for hosts; owns the shared pools and the decoder settings.
//! Invariants: Every exit path releases, in order: interceptor, decoder, reader, body buffer.
//! Invariants: Field-scoped failures land in the caller's sink; only fatal errors are returned.
//! Notes: Draining is async; decoding runs synchronously over the buffered body.
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_stream::Stream;

use crate::core::body::{BodyBuffer, DEFAULT_MEMORY_THRESHOLD};
use crate::core::convert::{ConverterChain, Culture};
use crate::core::decode::Decode;
use crate::core::decoder::{DecoderPolicy, DecoderPool, DecoderSettings};
use crate::core::error::{Error, ErrorKind};
use crate::core::intercept::{DEFAULT_MAX_ERRORS, ErrorSink, FieldErrorInterceptor, FieldErrors};
use crate::core::pool::ScratchBufferPool;
use crate::core::reader::{DEFAULT_MAX_DEPTH, JsonReader, MAX_SUPPORTED_DEPTH};
use crate::core::text::{StreamTextReader, TextEncoding, TextRead};

/// Builds the character source over a buffered body.
pub type ReaderFactory =
    Arc<dyn for<'a> Fn(&'a mut BodyBuffer, TextEncoding) -> Box<dyn TextRead + 'a> + Send + Sync>;

#[derive(Clone)]
pub struct DecodeOptions {
    pub memory_threshold_bytes: usize,
    pub allow_internal_error_messages: bool,
    pub treat_empty_body_as_default: bool,
    pub reader_factory: Option<ReaderFactory>,
    pub drain_timeout: Option<Duration>,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            memory_threshold_bytes: DEFAULT_MEMORY_THRESHOLD,
            allow_internal_error_messages: false,
            treat_empty_body_as_default: false,
            reader_factory: None,
            drain_timeout: None,
        }
    }
}

impl fmt::Debug for DecodeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodeOptions")
            .field("memory_threshold_bytes", &self.memory_threshold_bytes)
            .field("allow_internal_error_messages", &self.allow_internal_error_messages)
            .field("treat_empty_body_as_default", &self.treat_empty_body_as_default)
            .field("reader_factory", &self.reader_factory.as_ref().map(|_| "custom"))
            .field("drain_timeout", &self.drain_timeout)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub parsing_culture: Option<Culture>,
    /// Buffering cannot be turned off; setting this is rejected at construction.
    pub suppress_buffering: bool,
    pub max_depth: usize,
    pub max_errors: usize,
    pub options: DecodeOptions,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            parsing_culture: None,
            suppress_buffering: false,
            max_depth: DEFAULT_MAX_DEPTH,
            max_errors: DEFAULT_MAX_ERRORS,
            options: DecodeOptions::default(),
        }
    }
}

pub struct DecodeRequest<S> {
    pub body: S,
    pub content_length: Option<u64>,
    pub encoding: TextEncoding,
}

impl<S> DecodeRequest<S> {
    pub fn new(body: S) -> Self {
        Self {
            body,
            content_length: None,
            encoding: TextEncoding::Utf8,
        }
    }

    pub fn with_content_length(mut self, content_length: Option<u64>) -> Self {
        self.content_length = content_length;
        self
    }

    pub fn with_encoding(mut self, encoding: TextEncoding) -> Self {
        self.encoding = encoding;
        self
    }
}

#[derive(Debug, PartialEq)]
pub enum DecodeResult<T> {
    /// The body decoded; `None` is an explicit empty value.
    Success(Option<T>),
    /// The body carried no value and empty input is not treated as a default.
    NoValue,
}

impl<T> DecodeResult<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, DecodeResult::Success(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            DecodeResult::Success(value) => value.as_ref(),
            DecodeResult::NoValue => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            DecodeResult::Success(value) => value,
            DecodeResult::NoValue => None,
        }
    }
}

fn classify_outcome<T>(value: Option<T>, treat_empty_body_as_default: bool) -> DecodeResult<T> {
    match value {
        Some(value) => DecodeResult::Success(Some(value)),
        None if treat_empty_body_as_default => DecodeResult::Success(None),
        None => DecodeResult::NoValue,
    }
}

pub struct DecodingPipeline {
    settings: Arc<DecoderSettings>,
    decoders: DecoderPool,
    scratch: Arc<ScratchBufferPool>,
    options: DecodeOptions,
    max_errors: usize,
}

impl DecodingPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self, Error> {
        Self::with_scratch_pool(config, Arc::new(ScratchBufferPool::default()))
    }

    /// Build a pipeline that shares `scratch` with other pipelines.
    pub fn with_scratch_pool(config: PipelineConfig, scratch: Arc<ScratchBufferPool>) -> Result<Self, Error> {
        validate_config(&config)?;
        let culture = config.parsing_culture.unwrap_or_default();
        tracing::debug!(
            culture = culture.name(),
            max_depth = config.max_depth,
            memory_threshold_bytes = config.options.memory_threshold_bytes,
            "configured decoding pipeline"
        );
        let settings = Arc::new(DecoderSettings::new(
            ConverterChain::legacy(),
            culture,
            config.max_depth,
        ));
        Ok(Self {
            decoders: DecoderPool::new(DecoderPolicy::new(Arc::clone(&settings))),
            settings,
            scratch,
            options: config.options,
            max_errors: config.max_errors,
        })
    }

    pub fn options(&self) -> &DecodeOptions {
        &self.options
    }

    pub fn settings(&self) -> &DecoderSettings {
        &self.settings
    }

    pub fn decoder_pool(&self) -> &DecoderPool {
        &self.decoders
    }

    pub fn scratch_pool(&self) -> &ScratchBufferPool {
        &self.scratch
    }

    /// Empty sink sized by the configured error limit.
    pub fn new_sink(&self) -> FieldErrors {
        FieldErrors::with_max_errors(self.max_errors)
    }

    pub async fn decode<T, S, E, K>(
        &self,
        request: DecodeRequest<S>,
        parameter_name: &str,
        sink: &mut K,
    ) -> Result<DecodeResult<T>, Error>
    where
        T: Decode,
        S: Stream<Item = Result<Bytes, E>>,
        E: StdError + Send + Sync + 'static,
        K: ErrorSink,
    {
        self.decode_with(request, parameter_name, sink, &self.options).await
    }

    pub async fn decode_with<T, S, E, K>(
        &self,
        request: DecodeRequest<S>,
        parameter_name: &str,
        sink: &mut K,
        options: &DecodeOptions,
    ) -> Result<DecodeResult<T>, Error>
    where
        T: Decode,
        S: Stream<Item = Result<Bytes, E>>,
        E: StdError + Send + Sync + 'static,
        K: ErrorSink,
    {
        if options.memory_threshold_bytes == 0 {
            return Err(zero_threshold());
        }
        let mut body = BodyBuffer::drain(
            request.body,
            request.content_length,
            options.memory_threshold_bytes,
            options.drain_timeout,
        )
        .await?;
        let decoded = self.decode_buffered::<T>(&mut body, request.encoding, parameter_name, sink, options);
        body.dispose();
        let value = decoded?;
        let outcome = classify_outcome(value, options.treat_empty_body_as_default);
        tracing::debug!(
            parameter = parameter_name,
            no_value = matches!(outcome, DecodeResult::NoValue),
            "decoded request body"
        );
        Ok(outcome)
    }

    fn decode_buffered<T: Decode>(
        &self,
        body: &mut BodyBuffer,
        encoding: TextEncoding,
        parameter_name: &str,
        sink: &mut dyn ErrorSink,
        options: &DecodeOptions,
    ) -> Result<Option<T>, Error> {
        let text: Box<dyn TextRead + '_> = match &options.reader_factory {
            Some(factory) => factory(body, encoding),
            None => Box::new(StreamTextReader::new(body, encoding)),
        };
        let mut reader =
            JsonReader::new(text, Arc::clone(&self.scratch)).with_max_depth(self.settings.max_depth());
        let mut decoder = self.decoders.acquire();
        let decoded = {
            let mut interceptor =
                FieldErrorInterceptor::new(parameter_name, sink, options.allow_internal_error_messages);
            decoder.decode::<T>(&mut reader, &mut interceptor)
        };
        decoder.release();
        reader.close();
        decoded
    }
}

fn zero_threshold() -> Error {
    Error::new(ErrorKind::Usage)
        .with_message("memory threshold must be greater than zero")
        .with_hint("Use a positive value like 1048576.")
}

fn validate_config(config: &PipelineConfig) -> Result<(), Error> {
    if config.suppress_buffering {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("input buffering cannot be suppressed")
            .with_hint("Bodies are always buffered before decoding; unset suppress_buffering."));
    }
    if config.options.memory_threshold_bytes == 0 {
        return Err(zero_threshold());
    }
    if config.max_depth == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("max depth must be greater than zero")
            .with_hint("Use a positive value like 64."));
    }
    if config.max_depth > MAX_SUPPORTED_DEPTH {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!(
                "max depth {} exceeds the supported limit of {MAX_SUPPORTED_DEPTH}",
                config.max_depth
            ))
            .with_hint("Use a value between 1 and 128."));
    }
    Ok(())
}
