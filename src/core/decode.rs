//! Purpose: Bind tokens onto typed destinations, member by member, in place.
//! Exports: `Decode`, `Shape`, `ShapeKind`, `DecodeContext`, `ErrorHandler`, `FieldErrorEvent`,
//! `Propagate`, `Skipped`, `resolve_member`, `decode_object!`.
//! Role: Core binding loop. Each member is read, passed through the converter chain and
//! converted; a field-scoped failure is offered to the error handler before it escapes.
//! Invariants: A handled error leaves the destination member at its prior value and the
//! reader positioned after the offending value, so later members still bind.
//! Invariants: An error the handler declines is marked reported and never offered again.
//! Invariants: Array elements that fail are skipped; the remaining elements keep their order.
//! Notes: Member names match exactly first, then ASCII case-insensitively.
use std::collections::{BTreeMap, HashMap};

use serde_json::{Map, Value};

use crate::core::convert::Converted;
use crate::core::decoder::DecoderSettings;
use crate::core::error::{Error, ErrorKind};
use crate::core::reader::{JsonReader, Token};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShapeKind {
    Bool,
    Integer,
    Float,
    Text,
    Sequence,
    Map,
    Object,
    Any,
}

/// Declared metadata of a destination member.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Shape {
    pub name: &'static str,
    pub kind: ShapeKind,
    /// The destination can represent an absent value itself.
    pub nullable: bool,
}

impl Shape {
    pub const fn new(name: &'static str, kind: ShapeKind) -> Self {
        Self {
            name,
            kind,
            nullable: false,
        }
    }

    pub fn of<T: ?Sized>(kind: ShapeKind) -> Self {
        Self::new(std::any::type_name::<T>(), kind)
    }

    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn is_text(&self) -> bool {
        self.kind == ShapeKind::Text
    }

    /// Type name without module paths: `Vec<String>` rather than `alloc::vec::Vec<...>`.
    pub fn display_name(&self) -> String {
        let mut out = String::new();
        let mut segment = String::new();
        let mut chars = self.name.chars().peekable();
        while let Some(ch) = chars.next() {
            if ch == ':' && chars.peek() == Some(&':') {
                chars.next();
                segment.clear();
            } else if ch.is_alphanumeric() || ch == '_' {
                segment.push(ch);
            } else {
                out.push_str(&segment);
                segment.clear();
                out.push(ch);
            }
        }
        out.push_str(&segment);
        out
    }
}

/// A destination that can be populated from tokens.
pub trait Decode: Default {
    fn shape() -> Shape;

    /// Populate `self` from `token`; containers pull their remaining tokens from `cx`.
    fn decode(&mut self, token: Token, cx: &mut DecodeContext<'_, '_>) -> Result<(), Error>;
}

/// A field-scoped failure offered to an [`ErrorHandler`].
#[derive(Debug)]
pub struct FieldErrorEvent {
    pub error: Error,
    /// Metadata of the member being bound when the error was raised.
    pub member: Shape,
}

pub trait ErrorHandler {
    /// `Ok` marks the error handled and binding continues; returning the error
    /// lets it propagate out of the decode call.
    fn handle(&mut self, event: FieldErrorEvent) -> Result<(), Error>;
}

impl<F> ErrorHandler for F
where
    F: FnMut(FieldErrorEvent) -> Result<(), Error>,
{
    fn handle(&mut self, event: FieldErrorEvent) -> Result<(), Error> {
        self(event)
    }
}

/// Handler that declines every error; the first failure aborts decoding.
#[derive(Clone, Copy, Debug, Default)]
pub struct Propagate;

impl ErrorHandler for Propagate {
    fn handle(&mut self, event: FieldErrorEvent) -> Result<(), Error> {
        Err(event.error)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Slot {
    Assigned,
    Kept,
    Failed,
}

pub struct DecodeContext<'c, 'a> {
    reader: &'c mut JsonReader<'a>,
    settings: &'c DecoderSettings,
    handler: &'c mut dyn ErrorHandler,
}

impl<'c, 'a> DecodeContext<'c, 'a> {
    pub fn new(
        reader: &'c mut JsonReader<'a>,
        settings: &'c DecoderSettings,
        handler: &'c mut dyn ErrorHandler,
    ) -> Self {
        Self {
            reader,
            settings,
            handler,
        }
    }

    pub fn settings(&self) -> &DecoderSettings {
        self.settings
    }

    /// Current structural path, for error messages.
    pub fn path(&self) -> String {
        self.reader.path()
    }

    /// Next raw token. Errors surface to the enclosing member.
    pub fn next_token(&mut self) -> Result<Token, Error> {
        self.reader.read()
    }

    pub fn conversion_error(&self, message: impl Into<String>) -> Error {
        Error::new(ErrorKind::Conversion)
            .with_message(message)
            .with_path(self.reader.path())
            .with_location(self.reader.line(), self.reader.position())
    }

    /// Error for a token the destination type cannot take.
    pub fn unexpected(&self, token: &Token, shape: Shape) -> Error {
        self.conversion_error(format!(
            "Error converting value {token} to type '{}'",
            shape.display_name()
        ))
    }

    /// Read the next value into `slot`. Returns false when the member failed and the
    /// handler absorbed the error; the slot then keeps its prior value.
    pub fn read_member<T: Decode>(&mut self, slot: &mut T) -> Result<bool, Error> {
        let depth = self.reader.depth();
        let token = match self.reader.read() {
            Ok(Token::Eof) => return Ok(false),
            Ok(token) => token,
            Err(err) => {
                self.intercept(err, depth, T::shape())?;
                return Ok(false);
            }
        };
        let slot = self.decode_token(token, depth, slot)?;
        Ok(slot != Slot::Failed)
    }

    /// Walk the members of an object whose `StartObject` is `token`. `visit` returns
    /// false for names it does not bind; those values are skipped.
    pub fn read_object<F>(&mut self, token: Token, shape: Shape, mut visit: F) -> Result<(), Error>
    where
        F: FnMut(&mut Self, &str) -> Result<bool, Error>,
    {
        if token != Token::StartObject {
            return Err(self.conversion_error(format!(
                "Cannot deserialize the current JSON {token} into type '{}' because the type requires a JSON object",
                shape.display_name()
            )));
        }
        let depth = self.reader.depth();
        loop {
            match self.reader.read() {
                Ok(Token::EndObject) | Ok(Token::Eof) => return Ok(()),
                Ok(Token::PropertyName(name)) => {
                    if !visit(self, &name)? {
                        tracing::trace!(member = %name, "skipping unmapped member");
                        self.read_member(&mut Skipped)?;
                    }
                }
                Ok(other) => {
                    return Err(Error::new(ErrorKind::Internal)
                        .with_message(format!("unexpected {other} inside object"))
                        .with_path(self.reader.path()));
                }
                Err(err) => {
                    self.intercept(err, depth, shape)?;
                    if self.reader.is_exhausted() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Read the elements of an array whose `StartArray` was just consumed.
    pub fn read_array<T: Decode>(&mut self) -> Result<Vec<T>, Error> {
        let depth = self.reader.depth();
        let mut items = Vec::new();
        loop {
            let token = match self.reader.read() {
                Ok(Token::EndArray) | Ok(Token::Eof) => return Ok(items),
                Ok(token) => token,
                Err(err) => {
                    self.intercept(err, depth, T::shape())?;
                    if self.reader.is_exhausted() {
                        return Ok(items);
                    }
                    continue;
                }
            };
            let mut item = T::default();
            if self.decode_token(token, depth, &mut item)? != Slot::Failed {
                items.push(item);
            }
        }
    }

    /// Consume the rest of the container whose start token was just read.
    pub fn skip_container(&mut self) -> Result<(), Error> {
        let target = self.reader.depth().saturating_sub(1);
        while self.reader.depth() > target {
            if self.reader.read()? == Token::Eof {
                break;
            }
        }
        Ok(())
    }

    /// Decode a whole document. Empty input and a top-level null yield `None`,
    /// as does a top-level value the handler absorbed.
    pub(crate) fn decode_root<T: Decode>(&mut self) -> Result<Option<T>, Error> {
        let token = match self.reader.read() {
            Ok(Token::Eof) | Ok(Token::Null) => return Ok(None),
            Ok(token) => token,
            Err(err) => {
                self.intercept(err, 0, T::shape())?;
                return Ok(None);
            }
        };
        let mut value = T::default();
        match self.decode_token(token, 0, &mut value)? {
            Slot::Assigned => Ok(Some(value)),
            Slot::Kept | Slot::Failed => Ok(None),
        }
    }

    fn decode_token<T: Decode>(&mut self, token: Token, depth: usize, slot: &mut T) -> Result<Slot, Error> {
        let shape = T::shape();
        let opens_container = token.is_container_start();
        let settings = self.settings;
        let result = match settings.converters().read(token, &shape) {
            Ok(Converted::Keep) => {
                if opens_container {
                    self.reader.recover(depth)?;
                }
                return Ok(Slot::Kept);
            }
            Ok(Converted::Continue(token)) => slot.decode(token, self),
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => Ok(Slot::Assigned),
            Err(err) => {
                self.intercept(err, depth, shape)?;
                Ok(Slot::Failed)
            }
        }
    }

    fn intercept(&mut self, err: Error, depth: usize, member: Shape) -> Result<(), Error> {
        if err.is_reported() || !err.kind().is_field_scoped() {
            return Err(err);
        }
        self.handler
            .handle(FieldErrorEvent { error: err, member })
            .map_err(Error::mark_reported)?;
        self.reader.recover(depth)
    }
}

/// Index of `name` in `members`: exact match first, then ASCII case-insensitive.
pub fn resolve_member(members: &[&str], name: &str) -> Option<usize> {
    members
        .iter()
        .position(|member| *member == name)
        .or_else(|| members.iter().position(|member| member.eq_ignore_ascii_case(name)))
}

/// Implement [`Decode`] for a struct with named fields. A field may be bound to a
/// different JSON name with `field as "jsonName"`.
#[macro_export]
macro_rules! decode_object {
    (@name $field:ident) => {
        stringify!($field)
    };
    (@name $field:ident $json:literal) => {
        $json
    };
    ($ty:ty { $($field:ident $(as $json:literal)?),* $(,)? }) => {
        impl $crate::core::decode::Decode for $ty {
            fn shape() -> $crate::core::decode::Shape {
                $crate::core::decode::Shape::of::<Self>($crate::core::decode::ShapeKind::Object)
            }

            #[allow(unused_assignments, unused_mut)]
            fn decode(
                &mut self,
                token: $crate::core::reader::Token,
                cx: &mut $crate::core::decode::DecodeContext<'_, '_>,
            ) -> ::std::result::Result<(), $crate::core::error::Error> {
                let members: &[&str] = &[$($crate::decode_object!(@name $field $($json)?)),*];
                cx.read_object(token, Self::shape(), |cx, name| {
                    let Some(index) = $crate::core::decode::resolve_member(members, name) else {
                        return Ok(false);
                    };
                    let mut slot = 0usize;
                    $(
                        if index == slot {
                            cx.read_member(&mut self.$field)?;
                            return Ok(true);
                        }
                        slot += 1;
                    )*
                    Ok(false)
                })
            }
        }
    };
}

/// Placeholder destination for members with no counterpart; consumes and discards.
#[derive(Clone, Copy, Debug, Default)]
pub struct Skipped;

impl Decode for Skipped {
    fn shape() -> Shape {
        Shape::new("Skipped", ShapeKind::Any).nullable()
    }

    fn decode(&mut self, token: Token, cx: &mut DecodeContext<'_, '_>) -> Result<(), Error> {
        if token.is_container_start() {
            cx.skip_container()?;
        }
        Ok(())
    }
}

impl Decode for bool {
    fn shape() -> Shape {
        Shape::new("bool", ShapeKind::Bool)
    }

    fn decode(&mut self, token: Token, cx: &mut DecodeContext<'_, '_>) -> Result<(), Error> {
        *self = match &token {
            Token::Bool(value) => *value,
            Token::String(text) if text.trim().eq_ignore_ascii_case("true") => true,
            Token::String(text) if text.trim().eq_ignore_ascii_case("false") => false,
            Token::String(text) => {
                return Err(cx.conversion_error(format!(
                    "Could not convert string to boolean: {text}"
                )));
            }
            _ => return Err(cx.unexpected(&token, Self::shape())),
        };
        Ok(())
    }
}

fn integer_from(token: &Token, shape: Shape, cx: &DecodeContext<'_, '_>) -> Result<i128, Error> {
    match token {
        Token::Number(raw) => raw.parse::<i128>().map_err(|_| {
            if raw.contains(['.', 'e', 'E']) {
                cx.conversion_error(format!("Input string '{raw}' is not a valid integer"))
            } else {
                cx.conversion_error(format!(
                    "Value {raw} is too large or too small for {}",
                    shape.display_name()
                ))
            }
        }),
        Token::String(text) => text.trim().parse::<i128>().map_err(|_| {
            cx.conversion_error(format!("Could not convert string to integer: {text}"))
        }),
        _ => Err(cx.unexpected(token, shape)),
    }
}

macro_rules! decode_integer {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Decode for $ty {
                fn shape() -> Shape {
                    Shape::new(stringify!($ty), ShapeKind::Integer)
                }

                fn decode(&mut self, token: Token, cx: &mut DecodeContext<'_, '_>) -> Result<(), Error> {
                    let wide = integer_from(&token, Self::shape(), cx)?;
                    *self = <$ty>::try_from(wide).map_err(|_| {
                        cx.conversion_error(format!(
                            "Value {wide} is too large or too small for {}",
                            stringify!($ty)
                        ))
                    })?;
                    Ok(())
                }
            }
        )*
    };
}

decode_integer!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

fn float_from(token: &Token, shape: Shape, cx: &DecodeContext<'_, '_>) -> Result<f64, Error> {
    match token {
        Token::Number(raw) => raw
            .parse::<f64>()
            .map_err(|_| cx.conversion_error(format!("Input string '{raw}' is not a valid number"))),
        Token::String(text) => cx
            .settings()
            .culture()
            .parse_float(text)
            .ok_or_else(|| cx.conversion_error(format!("Could not convert string to double: {text}"))),
        _ => Err(cx.unexpected(token, shape)),
    }
}

impl Decode for f64 {
    fn shape() -> Shape {
        Shape::new("f64", ShapeKind::Float)
    }

    fn decode(&mut self, token: Token, cx: &mut DecodeContext<'_, '_>) -> Result<(), Error> {
        *self = float_from(&token, Self::shape(), cx)?;
        Ok(())
    }
}

impl Decode for f32 {
    fn shape() -> Shape {
        Shape::new("f32", ShapeKind::Float)
    }

    fn decode(&mut self, token: Token, cx: &mut DecodeContext<'_, '_>) -> Result<(), Error> {
        *self = float_from(&token, Self::shape(), cx)? as f32;
        Ok(())
    }
}

impl Decode for String {
    fn shape() -> Shape {
        Shape::new("String", ShapeKind::Text)
    }

    fn decode(&mut self, token: Token, cx: &mut DecodeContext<'_, '_>) -> Result<(), Error> {
        match token {
            Token::String(text) => {
                *self = text;
                Ok(())
            }
            other => Err(cx.unexpected(&other, Self::shape())),
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn shape() -> Shape {
        T::shape().nullable()
    }

    fn decode(&mut self, token: Token, cx: &mut DecodeContext<'_, '_>) -> Result<(), Error> {
        match &token {
            Token::Null => {
                *self = None;
                return Ok(());
            }
            Token::String(text) if text.is_empty() && !T::shape().is_text() => {
                *self = None;
                return Ok(());
            }
            _ => {}
        }
        let existed = self.is_some();
        let result = self.get_or_insert_with(T::default).decode(token, cx);
        if result.is_err() && !existed {
            *self = None;
        }
        result
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn shape() -> Shape {
        Shape::of::<Self>(ShapeKind::Sequence)
    }

    fn decode(&mut self, token: Token, cx: &mut DecodeContext<'_, '_>) -> Result<(), Error> {
        if token != Token::StartArray {
            return Err(cx.conversion_error(format!(
                "Cannot deserialize the current JSON {token} into type '{}' because the type requires a JSON array",
                Self::shape().display_name()
            )));
        }
        *self = cx.read_array()?;
        Ok(())
    }
}

impl<T: Decode> Decode for HashMap<String, T> {
    fn shape() -> Shape {
        Shape::of::<Self>(ShapeKind::Map)
    }

    fn decode(&mut self, token: Token, cx: &mut DecodeContext<'_, '_>) -> Result<(), Error> {
        cx.read_object(token, Self::shape(), |cx, name| {
            let mut value = T::default();
            if cx.read_member(&mut value)? {
                self.insert(name.to_owned(), value);
            }
            Ok(true)
        })
    }
}

impl<T: Decode> Decode for BTreeMap<String, T> {
    fn shape() -> Shape {
        Shape::of::<Self>(ShapeKind::Map)
    }

    fn decode(&mut self, token: Token, cx: &mut DecodeContext<'_, '_>) -> Result<(), Error> {
        cx.read_object(token, Self::shape(), |cx, name| {
            let mut value = T::default();
            if cx.read_member(&mut value)? {
                self.insert(name.to_owned(), value);
            }
            Ok(true)
        })
    }
}

impl Decode for Value {
    fn shape() -> Shape {
        Shape::new("Value", ShapeKind::Any).nullable()
    }

    fn decode(&mut self, token: Token, cx: &mut DecodeContext<'_, '_>) -> Result<(), Error> {
        *self = value_from(token, cx)?;
        Ok(())
    }
}

fn value_from(token: Token, cx: &mut DecodeContext<'_, '_>) -> Result<Value, Error> {
    match token {
        Token::Null => Ok(Value::Null),
        Token::Bool(value) => Ok(Value::Bool(value)),
        Token::String(text) => Ok(Value::String(text)),
        Token::Number(raw) => raw
            .parse::<serde_json::Number>()
            .map(Value::Number)
            .map_err(|err| {
                cx.conversion_error(format!("Input string '{raw}' is not a valid number"))
                    .with_source(err)
            }),
        Token::StartArray => {
            let mut items = Vec::new();
            loop {
                match cx.next_token()? {
                    Token::EndArray | Token::Eof => return Ok(Value::Array(items)),
                    token => items.push(value_from(token, cx)?),
                }
            }
        }
        Token::StartObject => {
            let mut map = Map::new();
            loop {
                match cx.next_token()? {
                    Token::EndObject | Token::Eof => return Ok(Value::Object(map)),
                    Token::PropertyName(name) => {
                        let token = cx.next_token()?;
                        let value = value_from(token, cx)?;
                        map.insert(name, value);
                    }
                    other => return Err(cx.unexpected(&other, Value::shape())),
                }
            }
        }
        other => Err(cx.unexpected(&other, Value::shape())),
    }
}
