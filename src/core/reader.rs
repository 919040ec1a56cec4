//! Purpose: Pull tokenizer over decoded characters with structural path tracking.
//! Exports: `JsonReader`, `Token`, `DEFAULT_MAX_DEPTH`.
//! Role: Token source for the decoder; reports where each error happened and can
//! resynchronize after a malformed or rejected value so binding continues.
//! Invariants: Working buffers are rented from the scratch pool and returned on close/drop.
//! Invariants: `path()` renders members as `a.b` and elements as `a[0]`; odd names as `['x y']`.
//! Invariants: After end of input inside a container is reported once, reads yield `Eof`.
//! Notes: Errors leave the offending character unconsumed where possible; `recover` skips it.
use std::fmt;
use std::sync::Arc;

use crate::core::error::{Error, ErrorKind};
use crate::core::pool::ScratchBufferPool;
use crate::core::text::TextRead;

pub const DEFAULT_MAX_DEPTH: usize = 64;
/// Highest accepted `max_depth`; binding recurses once per nesting level.
pub const MAX_SUPPORTED_DEPTH: usize = 128;

const READ_BUFFER_LEN: usize = 1024;
const TEXT_BUFFER_LEN: usize = 64;

#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    StartObject,
    EndObject,
    StartArray,
    EndArray,
    PropertyName(String),
    String(String),
    /// Raw number text as it appeared in the input.
    Number(String),
    Bool(bool),
    Null,
    Eof,
}

impl Token {
    pub fn is_container_start(&self) -> bool {
        matches!(self, Token::StartObject | Token::StartArray)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::StartObject => f.write_str("object"),
            Token::EndObject => f.write_str("end of object"),
            Token::StartArray => f.write_str("array"),
            Token::EndArray => f.write_str("end of array"),
            Token::PropertyName(name) => write!(f, "property name '{name}'"),
            Token::String(text) => write!(f, "\"{text}\""),
            Token::Number(raw) => f.write_str(raw),
            Token::Bool(value) => write!(f, "{value}"),
            Token::Null => f.write_str("null"),
            Token::Eof => f.write_str("end of input"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Container {
    Object,
    Array,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Expect {
    Key,
    Value,
    CommaOrEnd,
}

#[derive(Debug)]
struct Frame {
    container: Container,
    expect: Expect,
    property: Option<String>,
    index: Option<usize>,
}

impl Frame {
    fn new(container: Container) -> Self {
        let expect = match container {
            Container::Object => Expect::Key,
            Container::Array => Expect::Value,
        };
        Self {
            container,
            expect,
            property: None,
            index: None,
        }
    }
}

pub struct JsonReader<'a> {
    source: Box<dyn TextRead + 'a>,
    scratch: Arc<ScratchBufferPool>,
    chars: Option<Vec<char>>,
    text: Option<Vec<char>>,
    pos: usize,
    len: usize,
    source_done: bool,
    frames: Vec<Frame>,
    root_started: bool,
    exhausted: bool,
    max_depth: usize,
    line: u64,
    position: u64,
}

impl<'a> JsonReader<'a> {
    pub fn new(source: Box<dyn TextRead + 'a>, scratch: Arc<ScratchBufferPool>) -> Self {
        let chars = scratch.rent(READ_BUFFER_LEN);
        Self {
            source,
            scratch,
            chars: Some(chars),
            text: None,
            pos: 0,
            len: 0,
            source_done: false,
            frames: Vec::new(),
            root_started: false,
            exhausted: false,
            max_depth: DEFAULT_MAX_DEPTH,
            line: 1,
            position: 0,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Number of open containers.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn line(&self) -> u64 {
        self.line
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn path(&self) -> String {
        let mut out = String::new();
        for frame in &self.frames {
            match frame.container {
                Container::Object => {
                    let Some(name) = &frame.property else {
                        continue;
                    };
                    if needs_brackets(name) {
                        out.push_str("['");
                        out.push_str(&name.replace('\'', "\\'"));
                        out.push_str("']");
                    } else {
                        if !out.is_empty() {
                            out.push('.');
                        }
                        out.push_str(name);
                    }
                }
                Container::Array => {
                    if let Some(index) = frame.index {
                        out.push_str(&format!("[{index}]"));
                    }
                }
            }
        }
        out
    }

    /// Return the working buffers to the scratch pool. Further reads see end of input.
    pub fn close(&mut self) {
        self.scratch.return_buffer(self.chars.take());
        self.scratch.return_buffer(self.text.take());
        self.len = 0;
        self.pos = 0;
        self.source_done = true;
    }

    pub fn read(&mut self) -> Result<Token, Error> {
        if self.exhausted {
            return Ok(Token::Eof);
        }
        loop {
            self.skip_whitespace()?;
            let Some((container, expect)) = self
                .frames
                .last()
                .map(|frame| (frame.container, frame.expect))
            else {
                if self.root_started {
                    return Ok(Token::Eof);
                }
                let Some(ch) = self.peek()? else {
                    self.exhausted = true;
                    return Ok(Token::Eof);
                };
                self.root_started = true;
                return self.read_value(ch);
            };
            let Some(ch) = self.peek()? else {
                return Err(self.unexpected_end());
            };

            match (container, expect) {
                (Container::Object, Expect::Key) => return self.read_property(ch),
                (Container::Array, Expect::Value) if ch == ']' => {
                    self.bump();
                    self.frames.pop();
                    return Ok(Token::EndArray);
                }
                (_, Expect::Value) => {
                    if let Some(frame) = self.frames.last_mut() {
                        if frame.container == Container::Array {
                            frame.index = Some(frame.index.map_or(0, |index| index + 1));
                        }
                        frame.expect = Expect::CommaOrEnd;
                    }
                    return self.read_value(ch);
                }
                (_, Expect::CommaOrEnd) => match (container, ch) {
                    (_, ',') => {
                        self.bump();
                        if let Some(frame) = self.frames.last_mut() {
                            frame.expect = match container {
                                Container::Object => Expect::Key,
                                Container::Array => Expect::Value,
                            };
                        }
                    }
                    (Container::Object, '}') => {
                        self.bump();
                        self.frames.pop();
                        return Ok(Token::EndObject);
                    }
                    (Container::Array, ']') => {
                        self.bump();
                        self.frames.pop();
                        return Ok(Token::EndArray);
                    }
                    (_, other) => {
                        return Err(self.syntax(format!(
                            "After parsing a value an unexpected character was encountered: {other}"
                        )));
                    }
                },
                (Container::Array, Expect::Key) => {
                    return Err(Error::new(ErrorKind::Internal)
                        .with_message("array frame expecting a property name"));
                }
            }
        }
    }

    fn read_property(&mut self, ch: char) -> Result<Token, Error> {
        match ch {
            '}' => {
                self.bump();
                self.frames.pop();
                Ok(Token::EndObject)
            }
            '"' => {
                self.bump();
                let name = self.read_string()?;
                if let Some(frame) = self.frames.last_mut() {
                    frame.property = Some(name.clone());
                }
                self.skip_whitespace()?;
                match self.peek()? {
                    Some(':') => {
                        self.bump();
                        if let Some(frame) = self.frames.last_mut() {
                            frame.expect = Expect::Value;
                        }
                        Ok(Token::PropertyName(name))
                    }
                    Some(other) => Err(self.syntax(format!(
                        "Invalid character after parsing property name. Expected ':' but got: {other}"
                    ))),
                    None => Err(self.unexpected_end()),
                }
            }
            other => Err(self.syntax(format!("Invalid property identifier character: {other}"))),
        }
    }

    fn read_value(&mut self, ch: char) -> Result<Token, Error> {
        match ch {
            '{' | '[' => {
                if self.frames.len() >= self.max_depth {
                    return Err(self.syntax(format!(
                        "The reader's MaxDepth of {} has been exceeded",
                        self.max_depth
                    )));
                }
                self.bump();
                if ch == '{' {
                    self.frames.push(Frame::new(Container::Object));
                    Ok(Token::StartObject)
                } else {
                    self.frames.push(Frame::new(Container::Array));
                    Ok(Token::StartArray)
                }
            }
            '"' => {
                self.bump();
                self.read_string().map(Token::String)
            }
            '-' | '0'..='9' => self.read_number(),
            't' | 'f' | 'n' => self.read_literal(),
            other => Err(self.syntax(format!(
                "Unexpected character encountered while parsing value: {other}"
            ))),
        }
    }

    fn read_string(&mut self) -> Result<String, Error> {
        let mut text = self
            .text
            .take()
            .unwrap_or_else(|| self.scratch.rent(TEXT_BUFFER_LEN));
        let result = self.scan_string(&mut text);
        self.text = Some(text);
        result
    }

    // Consumes through the closing quote even after a bad escape so the
    // remainder of the string is never mistaken for structure.
    fn scan_string(&mut self, text: &mut Vec<char>) -> Result<String, Error> {
        let mut used = 0usize;
        let mut failure: Option<Error> = None;
        loop {
            let Some(ch) = self.peek()? else {
                return Err(self.unexpected_end());
            };
            self.bump();
            match ch {
                '"' => break,
                '\\' => {
                    let Some(escape) = self.peek()? else {
                        return Err(self.unexpected_end());
                    };
                    self.bump();
                    let decoded = match escape {
                        '"' | '\\' | '/' => Some(escape),
                        'b' => Some('\u{8}'),
                        'f' => Some('\u{c}'),
                        'n' => Some('\n'),
                        'r' => Some('\r'),
                        't' => Some('\t'),
                        'u' => self.read_unicode_escape()?,
                        other => {
                            if failure.is_none() {
                                failure =
                                    Some(self.syntax(format!("Bad JSON escape sequence: \\{other}")));
                            }
                            None
                        }
                    };
                    match decoded {
                        Some(decoded) => self.push_text(text, &mut used, decoded),
                        None if failure.is_none() => {
                            failure = Some(self.syntax("Bad JSON escape sequence: \\u"));
                        }
                        None => {}
                    }
                }
                other => self.push_text(text, &mut used, other),
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(text[..used].iter().collect()),
        }
    }

    fn read_unicode_escape(&mut self) -> Result<Option<char>, Error> {
        let Some(high) = self.read_hex4()? else {
            return Ok(None);
        };
        if !(0xD800..=0xDBFF).contains(&high) {
            return Ok(Some(char::from_u32(u32::from(high)).unwrap_or('\u{FFFD}')));
        }
        if self.peek()? != Some('\\') {
            return Ok(Some('\u{FFFD}'));
        }
        self.bump();
        if self.peek()? != Some('u') {
            return Ok(None);
        }
        self.bump();
        let Some(low) = self.read_hex4()? else {
            return Ok(None);
        };
        let decoded = char::decode_utf16([high, low])
            .next()
            .and_then(Result::ok)
            .unwrap_or('\u{FFFD}');
        Ok(Some(decoded))
    }

    fn read_hex4(&mut self) -> Result<Option<u16>, Error> {
        let mut value = 0u16;
        for _ in 0..4 {
            let Some(digit) = self.peek()?.and_then(|ch| ch.to_digit(16)) else {
                return Ok(None);
            };
            self.bump();
            value = value * 16 + digit as u16;
        }
        Ok(Some(value))
    }

    fn push_text(&self, text: &mut Vec<char>, used: &mut usize, ch: char) {
        if *used == text.len() {
            let mut grown = self.scratch.rent(text.len().max(TEXT_BUFFER_LEN) * 2);
            grown[..*used].copy_from_slice(&text[..*used]);
            let old = std::mem::replace(text, grown);
            self.scratch.return_buffer(Some(old));
        }
        text[*used] = ch;
        *used += 1;
    }

    fn read_number(&mut self) -> Result<Token, Error> {
        let mut raw = String::new();
        while let Some(ch) = self.peek()? {
            if !matches!(ch, '0'..='9' | '-' | '+' | '.' | 'e' | 'E') {
                break;
            }
            raw.push(ch);
            self.bump();
        }
        if let Some(ch) = self.peek()? {
            if !is_delimiter(ch) {
                return Err(self.syntax(format!(
                    "Unexpected character encountered while parsing number: {ch}"
                )));
            }
        }
        if !is_json_number(&raw) {
            return Err(self.syntax(format!("Input string '{raw}' is not a valid number")));
        }
        Ok(Token::Number(raw))
    }

    fn read_literal(&mut self) -> Result<Token, Error> {
        let mut word = String::new();
        while let Some(ch) = self.peek()? {
            if !ch.is_ascii_alphabetic() {
                break;
            }
            word.push(ch);
            self.bump();
        }
        match word.as_str() {
            "true" => Ok(Token::Bool(true)),
            "false" => Ok(Token::Bool(false)),
            "null" => Ok(Token::Null),
            _ => Err(self.syntax(format!(
                "Unexpected character encountered while parsing value: {word}"
            ))),
        }
    }

    /// Skip input until the reader is back at `depth` and positioned after a
    /// value: past the end of any container opened below `depth`, then up to
    /// the next `,` or the closing bracket of the container at `depth`.
    pub fn recover(&mut self, depth: usize) -> Result<(), Error> {
        let mut nesting = 0usize;
        while !self.exhausted {
            let Some(ch) = self.peek()? else {
                self.exhausted = true;
                break;
            };
            match ch {
                '"' => {
                    self.bump();
                    self.skip_string_raw()?;
                }
                '{' | '[' => {
                    self.bump();
                    nesting += 1;
                }
                '}' | ']' if nesting > 0 => {
                    self.bump();
                    nesting -= 1;
                }
                '}' | ']' if self.frames.len() > depth => {
                    self.bump();
                    self.frames.pop();
                    if self.frames.len() <= depth {
                        break;
                    }
                }
                '}' | ']' => {
                    let closes_top = self.frames.last().is_some_and(|frame| {
                        (frame.container == Container::Object && ch == '}')
                            || (frame.container == Container::Array && ch == ']')
                    });
                    if closes_top {
                        break;
                    }
                    self.bump();
                }
                ',' if nesting == 0 && self.frames.len() == depth && depth > 0 => break,
                _ => self.bump(),
            }
        }
        match self.frames.last_mut() {
            Some(frame) => frame.expect = Expect::CommaOrEnd,
            None => self.root_started = true,
        }
        Ok(())
    }

    fn skip_string_raw(&mut self) -> Result<(), Error> {
        while let Some(ch) = self.peek()? {
            self.bump();
            match ch {
                '"' => return Ok(()),
                '\\' => {
                    if self.peek()?.is_some() {
                        self.bump();
                    }
                }
                _ => {}
            }
        }
        self.exhausted = true;
        Ok(())
    }

    fn skip_whitespace(&mut self) -> Result<(), Error> {
        while let Some(ch) = self.peek()? {
            if !matches!(ch, ' ' | '\t' | '\n' | '\r' | '\u{feff}') {
                break;
            }
            self.bump();
        }
        Ok(())
    }

    fn peek(&mut self) -> Result<Option<char>, Error> {
        if self.pos == self.len {
            self.fill()?;
        }
        if self.pos == self.len {
            return Ok(None);
        }
        Ok(self.chars.as_deref().and_then(|chars| chars.get(self.pos)).copied())
    }

    fn bump(&mut self) {
        let Some(ch) = self.chars.as_deref().and_then(|chars| chars.get(self.pos)).copied() else {
            return;
        };
        self.pos += 1;
        if ch == '\n' {
            self.line += 1;
            self.position = 0;
        } else {
            self.position += 1;
        }
    }

    fn fill(&mut self) -> Result<(), Error> {
        if self.source_done {
            return Ok(());
        }
        let Some(chars) = self.chars.as_mut() else {
            return Ok(());
        };
        let read = self.source.read_chars(chars).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read request text")
                .with_source(err)
        })?;
        self.pos = 0;
        self.len = read;
        if read == 0 {
            self.source_done = true;
        }
        Ok(())
    }

    fn syntax(&self, message: impl Into<String>) -> Error {
        Error::new(ErrorKind::Syntax)
            .with_message(message)
            .with_path(self.path())
            .with_location(self.line, self.position)
    }

    fn unexpected_end(&mut self) -> Error {
        self.exhausted = true;
        self.syntax("Unexpected end when reading JSON")
    }
}

impl Drop for JsonReader<'_> {
    fn drop(&mut self) {
        self.close();
    }
}

fn is_delimiter(ch: char) -> bool {
    matches!(ch, ',' | '}' | ']' | ' ' | '\t' | '\n' | '\r')
}

fn needs_brackets(name: &str) -> bool {
    name.is_empty()
        || name
            .chars()
            .any(|ch| ch.is_whitespace() || matches!(ch, '.' | '[' | ']' | '(' | ')' | '\'' | '"'))
}

fn is_json_number(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    let mut i = 0;
    if bytes.get(i) == Some(&b'-') {
        i += 1;
    }
    match bytes.get(i) {
        Some(b'0') => i += 1,
        Some(b'1'..=b'9') => {
            while bytes.get(i).is_some_and(u8::is_ascii_digit) {
                i += 1;
            }
        }
        _ => return false,
    }
    if bytes.get(i) == Some(&b'.') {
        i += 1;
        let start = i;
        while bytes.get(i).is_some_and(u8::is_ascii_digit) {
            i += 1;
        }
        if i == start {
            return false;
        }
    }
    if matches!(bytes.get(i), Some(b'e') | Some(b'E')) {
        i += 1;
        if matches!(bytes.get(i), Some(b'+') | Some(b'-')) {
            i += 1;
        }
        let start = i;
        while bytes.get(i).is_some_and(u8::is_ascii_digit) {
            i += 1;
        }
        if i == start {
            return false;
        }
    }
    i == bytes.len()
}
