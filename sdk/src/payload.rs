//! Handler result payloads and log previews of raw message bodies
use anyhow::Result;
use serde::Serialize;

/// Maximum characters of a payload shown in logs
pub const PREVIEW_CHARS: usize = 200;

/// Result of an invocation handler
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Passed through as UTF-8
    Text(String),

    /// Passed through verbatim
    Binary(Vec<u8>),

    /// Serialised on the way out
    Json(serde_json::Value),
}

impl Payload {
    /// Serialise any value into a JSON payload
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Payload::Json(serde_json::to_value(value)?))
    }

    /// Bytes to put on the wire
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        Ok(match self {
            Payload::Text(text) => text.into_bytes(),
            Payload::Binary(data) => data,
            Payload::Json(value) => serde_json::to_vec(&value)?,
        })
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Payload::Binary(data)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Json(value)
    }
}

/// Lossy, bounded rendering of a message body for logs
pub fn preview(data: &[u8]) -> String {
    let text = String::from_utf8_lossy(data);
    let mut chars = text.chars();
    let mut shown: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        shown.push_str("...");
    }
    shown
}

// -- Tests --
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_and_binary_pass_through() {
        assert_eq!(Payload::from("hi").into_bytes().unwrap(), b"hi");
        assert_eq!(Payload::from(vec![0u8, 255]).into_bytes().unwrap(), vec![0u8, 255]);
    }

    #[test]
    fn json_is_serialised() {
        let bytes = Payload::from(json!({"id": 7})).into_bytes().unwrap();
        assert_eq!(bytes, br#"{"id":7}"#);
    }

    #[test]
    fn preview_is_bounded() {
        assert_eq!(preview(b"short"), "short");

        let long = "x".repeat(500);
        let shown = preview(long.as_bytes());
        assert_eq!(shown.len(), PREVIEW_CHARS + 3);
        assert!(shown.ends_with("..."));
    }

    #[test]
    fn preview_tolerates_invalid_utf8() {
        assert_eq!(preview(&[b'a', 0xff, b'b']), "a\u{fffd}b");
    }
}
