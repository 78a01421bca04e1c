//! Payload character sets
//!
//! Inbound PUBLISH payloads are decoded to text and outbound content is
//! encoded back to bytes with the gateway's configured charset.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Supported payload charsets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Charset {
    /// UTF-8, invalid sequences decode to U+FFFD
    #[default]
    Utf8,
    /// ISO-8859-1, every byte maps to the code point of the same value
    Latin1,
    /// US-ASCII, bytes above 0x7F decode to U+FFFD
    Ascii,
}

impl Charset {
    /// Canonical name
    pub fn name(self) -> &'static str {
        match self {
            Charset::Utf8 => "UTF-8",
            Charset::Latin1 => "ISO-8859-1",
            Charset::Ascii => "US-ASCII",
        }
    }

    /// Decode payload bytes to text. Never fails.
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            Charset::Utf8 => match String::from_utf8_lossy(bytes) {
                Cow::Borrowed(s) => s.to_owned(),
                Cow::Owned(s) => s,
            },
            Charset::Latin1 => bytes.iter().map(|&b| b as char).collect(),
            Charset::Ascii => bytes
                .iter()
                .map(|&b| {
                    if b.is_ascii() {
                        b as char
                    } else {
                        char::REPLACEMENT_CHARACTER
                    }
                })
                .collect(),
        }
    }

    /// Encode text to payload bytes. Unmappable characters become `?`.
    pub fn encode(self, text: &str) -> Bytes {
        match self {
            Charset::Utf8 => Bytes::copy_from_slice(text.as_bytes()),
            Charset::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                .collect::<Vec<u8>>()
                .into(),
            Charset::Ascii => text
                .chars()
                .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                .collect::<Vec<u8>>()
                .into(),
        }
    }
}

impl fmt::Display for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Charset name that is not supported
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCharset(pub String);

impl fmt::Display for UnknownCharset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown charset '{}' (expected UTF-8, ISO-8859-1 or US-ASCII)",
            self.0
        )
    }
}

impl std::error::Error for UnknownCharset {}

impl FromStr for Charset {
    type Err = UnknownCharset;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "utf-8" | "utf8" => Ok(Charset::Utf8),
            "iso-8859-1" | "latin1" | "latin-1" => Ok(Charset::Latin1),
            "us-ascii" | "ascii" => Ok(Charset::Ascii),
            _ => Err(UnknownCharset(s.to_string())),
        }
    }
}

impl TryFrom<String> for Charset {
    type Error = UnknownCharset;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Charset> for String {
    fn from(charset: Charset) -> Self {
        charset.name().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case("UTF-8", Charset::Utf8)]
    #[test_case("utf8", Charset::Utf8)]
    #[test_case("ISO-8859-1", Charset::Latin1)]
    #[test_case("iso_8859_1", Charset::Latin1)]
    #[test_case("US-ASCII", Charset::Ascii)]
    fn test_parse(name: &str, expected: Charset) {
        assert_eq!(name.parse::<Charset>(), Ok(expected));
    }

    #[test]
    fn test_parse_unknown() {
        let err = "EBCDIC".parse::<Charset>().unwrap_err();
        assert!(err.to_string().contains("EBCDIC"));
    }

    #[test]
    fn test_utf8_lossy_decode() {
        assert_eq!(Charset::Utf8.decode("héllo".as_bytes()), "héllo");
        assert_eq!(Charset::Utf8.decode(&[b'a', 0xFF, b'b']), "a\u{FFFD}b");
    }

    #[test]
    fn test_latin1() {
        assert_eq!(Charset::Latin1.decode(&[b'c', 0xE9]), "cé");
        assert_eq!(&Charset::Latin1.encode("cé€")[..], &[b'c', 0xE9, b'?']);
    }

    #[test]
    fn test_ascii() {
        assert_eq!(Charset::Ascii.decode(&[b'o', 0xC3, 0xA9]), "o\u{FFFD}\u{FFFD}");
        assert_eq!(&Charset::Ascii.encode("oé")[..], b"o?");
    }
}
