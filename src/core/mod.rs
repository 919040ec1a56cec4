// Core modules implementing buffering, tokenizing, binding, and error modeling.
pub mod body;
pub mod convert;
pub mod decode;
pub mod decoder;
pub mod error;
pub mod intercept;
pub mod pool;
pub mod reader;
pub mod text;
