//! Purpose: Define the public Rust API boundary for bodybind.
//! Exports: The decoding pipeline plus the core types hosts and models need.
//! Role: Public, additive-only surface; hosts should not need `core` paths directly.
//! Invariants: Types re-exported here keep their names across releases.

mod pipeline;

pub use crate::core::body::{BodyBuffer, DEFAULT_MEMORY_THRESHOLD, effective_threshold};
pub use crate::core::convert::{Converted, Converter, ConverterChain, Culture, NullToDefault};
pub use crate::core::decode::{
    Decode, DecodeContext, ErrorHandler, FieldErrorEvent, Propagate, Shape, ShapeKind,
};
pub use crate::core::decoder::{Decoder, DecoderPolicy, DecoderPool, DecoderSettings};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::intercept::{
    DEFAULT_MAX_ERRORS, ErrorSink, FieldError, FieldErrorDetail, FieldErrorInterceptor, FieldErrors,
    GENERIC_CLIENT_MESSAGE, field_key,
};
pub use crate::core::pool::{CharArrayPool, ObjectPool, PoolPolicy, Pooled, ScratchBufferPool};
pub use crate::core::reader::{DEFAULT_MAX_DEPTH, JsonReader, MAX_SUPPORTED_DEPTH, Token};
pub use crate::core::text::{
    StreamTextReader, SUPPORTED_MEDIA_TYPES, TextEncoding, TextRead, is_json_media_type,
    negotiate_encoding,
};
pub use pipeline::{
    DecodeOptions, DecodeRequest, DecodeResult, DecodingPipeline, PipelineConfig, ReaderFactory,
};
