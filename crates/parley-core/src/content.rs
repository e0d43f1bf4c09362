//! Message body decoding.
//!
//! Bodies are plain UTF-8 unless the payload declares `encoding: "base64"`.
//! Older workers sent base64 without declaring it; [`decode_body`] can fall
//! back to sniffing for them when explicitly enabled.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::errors::{EventError, Result};

/// Declared encoding of a message body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentEncoding {
    /// UTF-8 text, used as-is.
    #[default]
    Plain,
    /// Standard base64 of UTF-8 text.
    Base64,
}

/// Decode a message body according to its declared encoding.
///
/// With no declared encoding the body is returned unchanged, unless
/// `sniff_base64` is set, in which case a body that decodes cleanly as
/// base64 UTF-8 is replaced by its decoded form.
pub fn decode_body(body: &str, encoding: Option<ContentEncoding>, sniff_base64: bool) -> Result<String> {
    match encoding {
        Some(ContentEncoding::Base64) => decode_base64(body),
        Some(ContentEncoding::Plain) => Ok(body.to_owned()),
        None if sniff_base64 => Ok(decode_base64(body).unwrap_or_else(|_| body.to_owned())),
        None => Ok(body.to_owned()),
    }
}

fn decode_base64(body: &str) -> Result<String> {
    let bytes = STANDARD.decode(body.trim()).map_err(|e| EventError::Content {
        encoding: "base64",
        reason: e.to_string(),
    })?;
    String::from_utf8(bytes).map_err(|e| EventError::Content {
        encoding: "base64",
        reason: e.to_string(),
    })
}
