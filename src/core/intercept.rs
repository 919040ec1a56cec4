//! Purpose: Turn field-scoped decode failures into keyed entries in a caller's error sink.
//! Exports: `FieldErrorInterceptor`, `FieldError`, `FieldErrorDetail`, `ErrorSink`,
//! `FieldErrors`, `field_key`, `classify`, `GENERIC_CLIENT_MESSAGE`.
//! Role: Error handler installed for the duration of one decode call.
//! Invariants: Every error offered to the interceptor is marked handled, even when the
//! sink refuses it; the caller's sink decides what it keeps.
//! Invariants: Internal messages reach clients only when explicitly allowed and the
//! failure is a syntax or conversion error.
use std::collections::BTreeMap;

use serde_json::{Value, json};

use crate::core::decode::{ErrorHandler, FieldErrorEvent};
use crate::core::error::Error;

pub const GENERIC_CLIENT_MESSAGE: &str = "The input was not valid.";
pub const DEFAULT_MAX_ERRORS: usize = 200;

/// Compose the sink key from a parameter prefix and a structural path.
pub fn field_key(prefix: &str, path: &str) -> String {
    if path.is_empty() {
        return prefix.to_string();
    }
    if prefix.is_empty() {
        return path.to_string();
    }
    if path.starts_with('[') {
        format!("{prefix}{path}")
    } else {
        format!("{prefix}.{path}")
    }
}

#[derive(Debug)]
pub enum FieldErrorDetail {
    /// The message may be shown to clients.
    Safe { message: String, error: Error },
    /// Only the generic message may be shown.
    Opaque(Error),
}

impl FieldErrorDetail {
    pub fn error(&self) -> &Error {
        match self {
            FieldErrorDetail::Safe { error, .. } => error,
            FieldErrorDetail::Opaque(error) => error,
        }
    }

    pub fn is_safe(&self) -> bool {
        matches!(self, FieldErrorDetail::Safe { .. })
    }

    pub fn client_message(&self) -> &str {
        match self {
            FieldErrorDetail::Safe { message, .. } => message,
            FieldErrorDetail::Opaque(_) => GENERIC_CLIENT_MESSAGE,
        }
    }
}

pub fn classify(error: Error, allow_internal_messages: bool) -> FieldErrorDetail {
    if allow_internal_messages && error.kind().is_field_scoped() {
        FieldErrorDetail::Safe {
            message: error.display_message(),
            error,
        }
    } else {
        FieldErrorDetail::Opaque(error)
    }
}

#[derive(Debug)]
pub struct FieldError {
    pub key: String,
    pub detail: FieldErrorDetail,
    /// Bound parameter the decode call was made for.
    pub parameter: String,
    /// Declared type of the member that failed.
    pub member_type: String,
}

/// Destination for field errors; returns false when the error was not retained.
pub trait ErrorSink {
    fn try_add_error(&mut self, error: FieldError) -> bool;
}

impl ErrorSink for Vec<FieldError> {
    fn try_add_error(&mut self, error: FieldError) -> bool {
        self.push(error);
        true
    }
}

/// Bounded error collection keyed by field.
#[derive(Debug)]
pub struct FieldErrors {
    entries: Vec<FieldError>,
    max_errors: usize,
    overflowed: bool,
}

impl FieldErrors {
    pub fn new() -> Self {
        Self::with_max_errors(DEFAULT_MAX_ERRORS)
    }

    pub fn with_max_errors(max_errors: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_errors,
            overflowed: false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldError> {
        self.entries.iter()
    }

    pub fn get<'s>(&'s self, key: &'s str) -> impl Iterator<Item = &'s FieldError> + 's {
        self.entries.iter().filter(move |entry| entry.key == key)
    }

    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.entries.iter().map(|entry| entry.key.as_str()).collect();
        keys.dedup();
        keys
    }

    pub fn into_vec(self) -> Vec<FieldError> {
        self.entries
    }

    /// Client view: `{ "<key>": ["<message>", ...] }`.
    pub fn to_json(&self) -> Value {
        let mut grouped: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for entry in &self.entries {
            grouped
                .entry(entry.key.as_str())
                .or_default()
                .push(entry.detail.client_message());
        }
        json!(grouped)
    }
}

impl Default for FieldErrors {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorSink for FieldErrors {
    fn try_add_error(&mut self, error: FieldError) -> bool {
        if self.entries.len() >= self.max_errors {
            if !self.overflowed {
                tracing::warn!(
                    max_errors = self.max_errors,
                    key = %error.key,
                    "field error limit reached; dropping further errors"
                );
            }
            self.overflowed = true;
            return false;
        }
        self.entries.push(error);
        true
    }
}

/// Error handler that records failures under `<parameter>.<path>` keys.
pub struct FieldErrorInterceptor<'s> {
    parameter: &'s str,
    sink: &'s mut dyn ErrorSink,
    allow_internal_messages: bool,
    recorded: usize,
    refused: usize,
}

impl<'s> FieldErrorInterceptor<'s> {
    pub fn new(parameter: &'s str, sink: &'s mut dyn ErrorSink, allow_internal_messages: bool) -> Self {
        Self {
            parameter,
            sink,
            allow_internal_messages,
            recorded: 0,
            refused: 0,
        }
    }

    pub fn recorded(&self) -> usize {
        self.recorded
    }

    pub fn refused(&self) -> usize {
        self.refused
    }
}

impl ErrorHandler for FieldErrorInterceptor<'_> {
    fn handle(&mut self, event: FieldErrorEvent) -> Result<(), Error> {
        let key = field_key(self.parameter, event.error.path().unwrap_or_default());
        let detail = classify(event.error, self.allow_internal_messages);
        tracing::debug!(
            key = %key,
            kind = ?detail.error().kind(),
            member = %event.member.display_name(),
            "recorded field error"
        );
        let entry = FieldError {
            key,
            detail,
            parameter: self.parameter.to_string(),
            member_type: event.member.display_name(),
        };
        if self.sink.try_add_error(entry) {
            self.recorded += 1;
        } else {
            self.refused += 1;
        }
        Ok(())
    }
}
