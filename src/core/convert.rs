//! Purpose: Pluggable value conversion hooks and the parsing culture.
//! Exports: `Converter`, `ConverterChain`, `Converted`, `NullToDefault`, `Culture`.
//! Role: Consulted by the decoder before the built-in conversion of every member.
//! Invariants: The first converter that applies to a member shape wins.
//! Invariants: `NullToDefault` keeps the existing value for null, and for "" unless the
//! member is text. It never participates in writing.
use serde_json::Value;

use crate::core::decode::Shape;
use crate::core::error::{Error, ErrorKind};
use crate::core::reader::Token;

/// Outcome of a converter read.
#[derive(Clone, Debug, PartialEq)]
pub enum Converted {
    /// Leave the destination untouched.
    Keep,
    /// Continue with the built-in conversion of this (possibly rewritten) token.
    Continue(Token),
}

pub trait Converter: Send + Sync {
    fn name(&self) -> &'static str;

    fn applies_to(&self, shape: &Shape) -> bool;

    fn read(&self, token: Token, shape: &Shape) -> Result<Converted, Error>;

    fn can_write(&self) -> bool {
        true
    }

    fn write(&self, value: &Value, _shape: &Shape) -> Result<Value, Error> {
        Ok(value.clone())
    }
}

/// Coerces null, and empty strings for non-text members, to the member's current value.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullToDefault;

impl Converter for NullToDefault {
    fn name(&self) -> &'static str {
        "null-to-default"
    }

    fn applies_to(&self, shape: &Shape) -> bool {
        !shape.nullable
    }

    fn read(&self, token: Token, shape: &Shape) -> Result<Converted, Error> {
        match &token {
            Token::Null => Ok(Converted::Keep),
            Token::String(text) if text.is_empty() && !shape.is_text() => Ok(Converted::Keep),
            _ => Ok(Converted::Continue(token)),
        }
    }

    fn can_write(&self) -> bool {
        false
    }

    fn write(&self, _value: &Value, shape: &Shape) -> Result<Value, Error> {
        Err(Error::new(ErrorKind::Internal)
            .with_message(format!(
                "{} converter cannot write values of type '{}'",
                self.name(),
                shape.display_name()
            ))
            .with_hint("Serialize with a chain that has no read-only converters."))
    }
}

#[derive(Default)]
pub struct ConverterChain {
    converters: Vec<Box<dyn Converter>>,
}

impl ConverterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chain used by the legacy binding policy.
    pub fn legacy() -> Self {
        Self::new().with(NullToDefault)
    }

    pub fn with(mut self, converter: impl Converter + 'static) -> Self {
        self.converters.push(Box::new(converter));
        self
    }

    pub fn push(&mut self, converter: Box<dyn Converter>) {
        self.converters.push(converter);
    }

    pub fn len(&self) -> usize {
        self.converters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.converters.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.converters.iter().map(|converter| converter.name()).collect()
    }

    pub fn read(&self, token: Token, shape: &Shape) -> Result<Converted, Error> {
        match self.converters.iter().find(|converter| converter.applies_to(shape)) {
            Some(converter) => converter.read(token, shape),
            None => Ok(Converted::Continue(token)),
        }
    }

    /// Write through the first applicable converter that supports writing;
    /// read-only converters are passed over.
    pub fn write(&self, value: &Value, shape: &Shape) -> Result<Value, Error> {
        match self
            .converters
            .iter()
            .find(|converter| converter.can_write() && converter.applies_to(shape))
        {
            Some(converter) => converter.write(value, shape),
            None => Ok(value.clone()),
        }
    }
}

/// Number formatting rules applied when a numeric member arrives as a string.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Culture {
    name: String,
    decimal_separator: char,
    group_separator: char,
}

impl Culture {
    pub fn new(name: impl Into<String>, decimal_separator: char, group_separator: char) -> Self {
        Self {
            name: name.into(),
            decimal_separator,
            group_separator,
        }
    }

    pub fn invariant() -> Self {
        Self::new("", '.', ',')
    }

    /// Resolve a language tag such as `en-US` or `de-DE`.
    pub fn from_tag(tag: &str) -> Result<Self, Error> {
        let normalized = tag.trim().replace('_', "-");
        let language = normalized
            .split('-')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        let separators = match language.as_str() {
            "" | "invariant" => return Ok(Self::invariant()),
            "en" | "ja" | "zh" | "ko" | "he" | "th" => ('.', ','),
            "de" | "es" | "it" | "nl" | "pt" | "da" | "id" | "tr" => (',', '.'),
            "fr" | "ru" | "pl" | "cs" | "sv" | "fi" | "nb" | "uk" => (',', '\u{a0}'),
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(format!("unknown parsing culture: {tag}"))
                    .with_hint("Use a tag like en-US or de-DE, or leave it unset."));
            }
        };
        Ok(Self::new(normalized, separators.0, separators.1))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn decimal_separator(&self) -> char {
        self.decimal_separator
    }

    pub fn group_separator(&self) -> char {
        self.group_separator
    }

    /// Parse a float written with this culture's separators. Group separators are ignored.
    pub fn parse_float(&self, text: &str) -> Option<f64> {
        let normalized: String = text
            .trim()
            .chars()
            .filter(|ch| *ch != self.group_separator)
            .map(|ch| if ch == self.decimal_separator { '.' } else { ch })
            .collect();
        if normalized.is_empty() {
            return None;
        }
        normalized.parse().ok()
    }
}

impl Default for Culture {
    fn default() -> Self {
        Self::invariant()
    }
}
