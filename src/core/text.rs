//! Purpose: Turn buffered body bytes into characters for the tokenizer.
//! Exports: `TextEncoding`, `TextRead`, `StreamTextReader`, media-type and charset helpers.
//! Role: Text layer between `BodyBuffer` and `JsonReader`; swappable via a reader factory.
//! Invariants: A leading byte-order mark is skipped once and never surfaced as a char.
//! Invariants: Malformed sequences decode to U+FFFD instead of failing the read.
//! Invariants: Multi-byte sequences split across reads are reassembled, not replaced.
use std::io::{self, Read};

use crate::core::error::{Error, ErrorKind};

pub const APPLICATION_JSON: &str = "application/json";
pub const TEXT_JSON: &str = "text/json";
pub const APPLICATION_ANY_JSON_SYNTAX: &str = "application/*+json";

pub const SUPPORTED_MEDIA_TYPES: &[&str] = &[APPLICATION_JSON, TEXT_JSON, APPLICATION_ANY_JSON_SYNTAX];

const READ_CHUNK: usize = 8 * 1024;
const REPLACEMENT: char = '\u{FFFD}';

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TextEncoding {
    Utf8,
    Utf16Le,
}

impl TextEncoding {
    pub fn name(self) -> &'static str {
        match self {
            TextEncoding::Utf8 => "utf-8",
            TextEncoding::Utf16Le => "utf-16le",
        }
    }

    fn bom(self) -> &'static [u8] {
        match self {
            TextEncoding::Utf8 => &[0xEF, 0xBB, 0xBF],
            TextEncoding::Utf16Le => &[0xFF, 0xFE],
        }
    }
}

/// Accepts `application/json`, `text/json` and any `application/<x>+json`.
pub fn is_json_media_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.split_once('/') {
        Some(("application", "json")) | Some(("text", "json")) => true,
        Some(("application", subtype)) => {
            subtype.len() > "+json".len() && subtype.ends_with("+json")
        }
        _ => false,
    }
}

/// Pick the body encoding from a content type's `charset`; absent means UTF-8.
pub fn negotiate_encoding(content_type: Option<&str>) -> Result<TextEncoding, Error> {
    let Some(content_type) = content_type else {
        return Ok(TextEncoding::Utf8);
    };
    let charset = content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"').to_ascii_lowercase())
    });
    match charset.as_deref() {
        None | Some("utf-8") | Some("utf8") => Ok(TextEncoding::Utf8),
        Some("utf-16") | Some("utf-16le") | Some("unicode") => Ok(TextEncoding::Utf16Le),
        Some(other) => Err(Error::new(ErrorKind::Unsupported)
            .with_message(format!("unsupported charset: {other}"))
            .with_hint("Send the body as utf-8 or utf-16le.")),
    }
}

/// Character source consumed by the tokenizer.
pub trait TextRead {
    /// Fill `buf` with decoded characters; `Ok(0)` means end of input.
    fn read_chars(&mut self, buf: &mut [char]) -> io::Result<usize>;
}

pub struct StreamTextReader<R> {
    inner: R,
    encoding: TextEncoding,
    bytes: Vec<u8>,
    start: usize,
    end: usize,
    eof: bool,
    bom_checked: bool,
}

impl<R: Read> StreamTextReader<R> {
    pub fn new(inner: R, encoding: TextEncoding) -> Self {
        Self {
            inner,
            encoding,
            bytes: vec![0; READ_CHUNK],
            start: 0,
            end: 0,
            eof: false,
            bom_checked: false,
        }
    }

    fn available(&self) -> usize {
        self.end - self.start
    }

    fn refill(&mut self) -> io::Result<()> {
        self.bytes.copy_within(self.start..self.end, 0);
        self.end -= self.start;
        self.start = 0;
        let read = loop {
            match self.inner.read(&mut self.bytes[self.end..]) {
                Ok(read) => break read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        };
        if read == 0 {
            self.eof = true;
        }
        self.end += read;
        Ok(())
    }

    fn skip_bom(&mut self) {
        let bom = self.encoding.bom();
        if self.bytes[self.start..self.end].starts_with(bom) {
            self.start += bom.len();
        }
        self.bom_checked = true;
    }

    fn decode_utf8(&mut self, out: &mut [char]) -> usize {
        let pending = &self.bytes[self.start..self.end];
        let (valid, invalid_len) = match std::str::from_utf8(pending) {
            Ok(text) => (text, None),
            Err(err) => (
                std::str::from_utf8(&pending[..err.valid_up_to()]).unwrap_or_default(),
                err.error_len(),
            ),
        };

        let mut written = 0;
        let mut consumed = 0;
        for ch in valid.chars() {
            if written == out.len() {
                break;
            }
            out[written] = ch;
            written += 1;
            consumed += ch.len_utf8();
        }
        if written < out.len() && consumed == valid.len() && consumed < pending.len() {
            match invalid_len {
                Some(len) => {
                    out[written] = REPLACEMENT;
                    written += 1;
                    consumed += len;
                }
                None if self.eof => {
                    out[written] = REPLACEMENT;
                    written += 1;
                    consumed = pending.len();
                }
                None => {}
            }
        }
        self.start += consumed;
        written
    }

    fn decode_utf16le(&mut self, out: &mut [char]) -> usize {
        let pending = &self.bytes[self.start..self.end];
        let mut units: Vec<u16> = pending
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let odd_tail = pending.len() % 2 == 1;
        if !self.eof && units.last().is_some_and(|unit| (0xD800..=0xDBFF).contains(unit)) {
            units.pop();
        }

        let mut written = 0;
        let mut consumed = 0;
        for decoded in char::decode_utf16(units.iter().copied()) {
            if written == out.len() {
                break;
            }
            match decoded {
                Ok(ch) => {
                    out[written] = ch;
                    consumed += ch.len_utf16() * 2;
                }
                Err(_) => {
                    out[written] = REPLACEMENT;
                    consumed += 2;
                }
            }
            written += 1;
        }
        if self.eof && odd_tail && written < out.len() && consumed + 1 == pending.len() {
            out[written] = REPLACEMENT;
            written += 1;
            consumed += 1;
        }
        self.start += consumed;
        written
    }
}

impl<R: Read> TextRead for StreamTextReader<R> {
    fn read_chars(&mut self, buf: &mut [char]) -> io::Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            while self.available() < 4 && !self.eof {
                self.refill()?;
            }
            if !self.bom_checked {
                self.skip_bom();
            }
            if self.available() == 0 {
                break;
            }
            let decoded = match self.encoding {
                TextEncoding::Utf8 => self.decode_utf8(&mut buf[written..]),
                TextEncoding::Utf16Le => self.decode_utf16le(&mut buf[written..]),
            };
            if decoded == 0 && self.eof {
                break;
            }
            written += decoded;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        StreamTextReader, TextEncoding, TextRead, is_json_media_type, negotiate_encoding,
    };
    use crate::core::error::ErrorKind;
    use std::io::{self, Read};

    struct Trickle<'a> {
        bytes: &'a [u8],
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.bytes.is_empty() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.bytes[0];
            self.bytes = &self.bytes[1..];
            Ok(1)
        }
    }

    fn read_all(mut reader: impl TextRead) -> String {
        let mut out = String::new();
        let mut buf = ['\0'; 5];
        loop {
            let read = reader.read_chars(&mut buf).expect("read chars");
            if read == 0 {
                return out;
            }
            out.extend(&buf[..read]);
        }
    }

    #[test]
    fn utf8_with_and_without_bom() {
        let plain = "{\"name\":\"caf\u{e9}\"}";
        let mut with_bom = vec![0xEF, 0xBB, 0xBF];
        with_bom.extend_from_slice(plain.as_bytes());

        let decoded = read_all(StreamTextReader::new(plain.as_bytes(), TextEncoding::Utf8));
        assert_eq!(decoded, plain);
        let decoded = read_all(StreamTextReader::new(with_bom.as_slice(), TextEncoding::Utf8));
        assert_eq!(decoded, plain);
    }

    #[test]
    fn utf8_sequences_split_across_reads() {
        let text = "\u{1F600} snow \u{2603} end";
        let reader = StreamTextReader::new(Trickle { bytes: text.as_bytes() }, TextEncoding::Utf8);
        assert_eq!(read_all(reader), text);
    }

    #[test]
    fn invalid_utf8_becomes_replacement() {
        let bytes = [b'a', 0xFF, b'b', 0xE2, 0x98];
        let decoded = read_all(StreamTextReader::new(&bytes[..], TextEncoding::Utf8));
        assert_eq!(decoded, "a\u{FFFD}b\u{FFFD}");
    }

    #[test]
    fn utf16le_with_bom_and_surrogates() {
        let text = "[\"\u{1F600}\"]";
        let mut bytes = vec![0xFF, 0xFE];
        for unit in text.encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        let reader = StreamTextReader::new(Trickle { bytes: &bytes }, TextEncoding::Utf16Le);
        assert_eq!(read_all(reader), text);
    }

    #[test]
    fn media_types_cover_json_family() {
        assert!(is_json_media_type("application/json"));
        assert!(is_json_media_type("application/json; charset=utf-8"));
        assert!(is_json_media_type("TEXT/JSON"));
        assert!(is_json_media_type("application/problem+json"));
        assert!(!is_json_media_type("application/+json"));
        assert!(!is_json_media_type("application/xml"));
        assert!(!is_json_media_type("text/plain"));
    }

    #[test]
    fn charset_negotiation() {
        assert_eq!(negotiate_encoding(None).expect("none"), TextEncoding::Utf8);
        assert_eq!(
            negotiate_encoding(Some("application/json")).expect("plain"),
            TextEncoding::Utf8
        );
        assert_eq!(
            negotiate_encoding(Some("application/json; charset=\"UTF-16\"")).expect("utf16"),
            TextEncoding::Utf16Le
        );
        let err = negotiate_encoding(Some("text/json; charset=latin1")).expect_err("latin1");
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }
}
