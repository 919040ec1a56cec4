//! Purpose: Poolable decoder instances and the settings they share.
//! Exports: `Decoder`, `DecoderSettings`, `DecoderPolicy`, `DecoderPool`.
//! Role: One decoder is borrowed per request; settings are built once per pipeline.
//! Invariants: A decoder carries no request state between borrows, so it is always recycled.
use std::sync::Arc;

use crate::core::convert::{ConverterChain, Culture};
use crate::core::decode::{Decode, DecodeContext, ErrorHandler};
use crate::core::error::Error;
use crate::core::pool::{ObjectPool, PoolPolicy};
use crate::core::reader::{DEFAULT_MAX_DEPTH, JsonReader};

pub struct DecoderSettings {
    converters: ConverterChain,
    culture: Culture,
    max_depth: usize,
}

impl DecoderSettings {
    pub fn new(converters: ConverterChain, culture: Culture, max_depth: usize) -> Self {
        Self {
            converters,
            culture,
            max_depth,
        }
    }

    pub fn with_culture(mut self, culture: Culture) -> Self {
        self.culture = culture;
        self
    }

    pub fn converters(&self) -> &ConverterChain {
        &self.converters
    }

    pub fn culture(&self) -> &Culture {
        &self.culture
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }
}

impl Default for DecoderSettings {
    fn default() -> Self {
        Self::new(ConverterChain::legacy(), Culture::invariant(), DEFAULT_MAX_DEPTH)
    }
}

pub struct Decoder {
    settings: Arc<DecoderSettings>,
    decodes: u64,
}

impl Decoder {
    pub fn new(settings: Arc<DecoderSettings>) -> Self {
        Self {
            settings,
            decodes: 0,
        }
    }

    pub fn settings(&self) -> &DecoderSettings {
        &self.settings
    }

    /// Documents decoded by this instance across all borrows.
    pub fn decodes(&self) -> u64 {
        self.decodes
    }

    pub fn decode<T: Decode>(
        &mut self,
        reader: &mut JsonReader<'_>,
        handler: &mut dyn ErrorHandler,
    ) -> Result<Option<T>, Error> {
        self.decodes += 1;
        let mut cx = DecodeContext::new(reader, &self.settings, handler);
        cx.decode_root::<T>()
    }
}

pub struct DecoderPolicy {
    settings: Arc<DecoderSettings>,
}

impl DecoderPolicy {
    pub fn new(settings: Arc<DecoderSettings>) -> Self {
        Self { settings }
    }
}

impl PoolPolicy<Decoder> for DecoderPolicy {
    fn create(&self) -> Decoder {
        Decoder::new(Arc::clone(&self.settings))
    }

    fn recycle(&self, _decoder: &mut Decoder) -> bool {
        true
    }
}

pub type DecoderPool = ObjectPool<Decoder, DecoderPolicy>;

#[cfg(test)]
mod tests {
    use super::{DecoderPolicy, DecoderPool, DecoderSettings};
    use crate::core::decode::Propagate;
    use crate::core::pool::ScratchBufferPool;
    use crate::core::reader::JsonReader;
    use crate::core::text::{StreamTextReader, TextEncoding};
    use std::sync::Arc;

    #[test]
    fn pooled_decoders_are_reused() {
        let settings = Arc::new(DecoderSettings::default());
        let pool = DecoderPool::new(DecoderPolicy::new(Arc::clone(&settings)));
        let scratch = Arc::new(ScratchBufferPool::default());

        for input in ["1", "2", "3"] {
            let text = StreamTextReader::new(input.as_bytes(), TextEncoding::Utf8);
            let mut reader = JsonReader::new(Box::new(text), Arc::clone(&scratch));
            let mut decoder = pool.acquire();
            let value: Option<i64> = decoder.decode(&mut reader, &mut Propagate).expect("decode");
            assert!(value.is_some());
        }

        assert_eq!(pool.created(), 1);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.acquire().decodes(), 3);
        assert_eq!(scratch.outstanding(), 0);
    }
}
