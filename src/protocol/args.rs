//! Base64 argument fields.
//!
//! Paths, free text and option blobs are base64-encoded (standard alphabet,
//! padded) before they are placed in a payload, so a field never contains a
//! space and arbitrary bytes (NUL included) survive the trip.

// ============================================================================
// Imports
// ============================================================================

use base64::Engine;
use base64::engine::general_purpose::STANDARD as Base64Standard;

use crate::error::{Error, Result};

// ============================================================================
// Field Helpers
// ============================================================================

/// Encodes one argument field.
#[inline]
#[must_use]
pub fn encode_field(bytes: impl AsRef<[u8]>) -> String {
    Base64Standard.encode(bytes)
}

/// Decodes one argument field.
///
/// # Errors
///
/// Returns [`Error::Base64`] if the field is not valid base64.
#[inline]
pub fn decode_field(field: &[u8]) -> Result<Vec<u8>> {
    Ok(Base64Standard.decode(field)?)
}

/// Decodes one argument field as UTF-8 text.
///
/// # Errors
///
/// Returns [`Error::Base64`] for bad base64 or [`Error::InvalidArgument`] if
/// the decoded bytes are not UTF-8.
pub fn decode_text(field: &[u8]) -> Result<String> {
    String::from_utf8(decode_field(field)?)
        .map_err(|e| Error::invalid_argument(format!("field is not UTF-8: {e}")))
}

// ============================================================================
// CommandArgs
// ============================================================================

/// Decoded argument list of an `application` method call.
///
/// Handlers read positional arguments from it; each entry is the raw decoded
/// bytes of one base64 field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandArgs {
    fields: Vec<Vec<u8>>,
}

impl CommandArgs {
    /// Creates an argument list from already decoded values.
    #[must_use]
    pub fn new<I, T>(values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Vec<u8>>,
    {
        Self {
            fields: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Decodes a sequence of base64 wire fields.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Base64`] if any field fails to decode.
    pub fn decode<'a>(fields: impl IntoIterator<Item = &'a [u8]>) -> Result<Self> {
        let fields = fields
            .into_iter()
            .map(decode_field)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { fields })
    }

    /// Renders the arguments as space separated base64 fields.
    #[must_use]
    pub fn encode(&self) -> String {
        self.fields
            .iter()
            .map(encode_field)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Number of arguments.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns `true` if there are no arguments.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Returns argument `index` as bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the argument is missing.
    pub fn bytes_at(&self, index: usize) -> Result<&[u8]> {
        self.fields
            .get(index)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::invalid_argument(format!("missing argument #{index}")))
    }

    /// Returns argument `index` as UTF-8 text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the argument is missing or not UTF-8.
    pub fn str_at(&self, index: usize) -> Result<&str> {
        std::str::from_utf8(self.bytes_at(index)?)
            .map_err(|e| Error::invalid_argument(format!("argument #{index} is not UTF-8: {e}")))
    }

    /// Returns argument `index` as text if it is present.
    #[must_use]
    pub fn opt_str_at(&self, index: usize) -> Option<&str> {
        self.fields
            .get(index)
            .and_then(|field| std::str::from_utf8(field).ok())
    }

    /// Iterates over all arguments.
    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.fields.iter().map(Vec::as_slice)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_has_no_spaces() {
        let field = encode_field("C:\\Program Files\\Mozilla Firefox");
        assert!(!field.contains(' '));
    }

    #[test]
    fn test_path_with_spaces_unicode_and_nul() {
        let path = "/home/gäst/My Documents/Ünïcödé\0trailer.txt";
        let field = encode_field(path);
        let decoded = decode_text(field.as_bytes()).expect("decode");
        assert_eq!(decoded, path);
    }

    #[test]
    fn test_decode_text_rejects_invalid_utf8() {
        let field = encode_field([0xff, 0xfe, 0x00]);
        let err = decode_text(field.as_bytes()).expect_err("not utf-8");
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn test_decode_field_rejects_garbage() {
        assert!(matches!(decode_field(b"***"), Err(Error::Base64(_))));
    }

    #[test]
    fn test_command_args_accessors() {
        let args = CommandArgs::new(["https://example.org", "new tab"]);
        assert_eq!(args.len(), 2);
        assert_eq!(args.str_at(0).expect("arg 0"), "https://example.org");
        assert_eq!(args.opt_str_at(1), Some("new tab"));
        assert_eq!(args.opt_str_at(2), None);
        assert!(args.str_at(2).is_err());
    }

    #[test]
    fn test_command_args_wire_form() {
        let args = CommandArgs::new(["a b", ""]);
        let wire = args.encode();
        let fields: Vec<&[u8]> = wire.as_bytes().split(|&b| b == b' ').collect();
        let decoded = CommandArgs::decode(fields).expect("decode");
        assert_eq!(decoded, args);
    }
}
