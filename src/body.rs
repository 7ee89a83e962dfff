//! Bounded body buffers and body-variable extraction.

use crate::config::BodyLimitAction;
use crate::error::{EngineError, EngineResult};
use crate::variables::{Collection, VariableStore};
use bytes::{BufMut, BytesMut};
use tracing::{debug, warn};

/// A bounded accumulator for request or response body bytes.
///
/// Bytes beyond the cap are never stored; whatever accumulated up to the cap
/// stays available for processing regardless of the configured limit action.
#[derive(Debug)]
pub struct BodyBuffer {
    buf: BytesMut,
    limit: usize,
    action: BodyLimitAction,
    truncated: bool,
}

impl BodyBuffer {
    /// Create an empty buffer with a byte cap.
    #[must_use]
    pub fn new(limit: usize, action: BodyLimitAction) -> Self {
        Self {
            buf: BytesMut::new(),
            limit,
            action,
            truncated: false,
        }
    }

    /// Append a chunk, keeping at most `limit` bytes overall.
    ///
    /// Under [`BodyLimitAction::Reject`] an overflowing append reports
    /// [`EngineError::BufferLimitExceeded`]; under
    /// [`BodyLimitAction::ProcessPartial`] the overflow is dropped silently.
    pub fn append(&mut self, chunk: &[u8]) -> EngineResult<()> {
        if chunk.is_empty() {
            return Ok(());
        }

        let remaining = self.limit.saturating_sub(self.buf.len());
        if chunk.len() <= remaining {
            self.buf.put_slice(chunk);
            return Ok(());
        }

        self.buf.put_slice(&chunk[..remaining]);
        self.truncated = true;
        match self.action {
            BodyLimitAction::Reject => Err(EngineError::BufferLimitExceeded { limit: self.limit }),
            BodyLimitAction::ProcessPartial => {
                warn!(
                    limit = self.limit,
                    dropped = chunk.len() - remaining,
                    "body buffer cap hit, processing partial content"
                );
                Ok(())
            }
        }
    }

    /// The accumulated bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Accumulated length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Check if nothing has been appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Check if any bytes were dropped at the cap.
    #[must_use]
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Drop all accumulated bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.truncated = false;
    }
}

/// Extract body variables into the store according to the content type.
///
/// URL-encoded forms, JSON documents and multipart form-data fields each
/// populate per-field variables; anything else only gets the raw-body
/// variable. The raw body (lossily decoded) is always stored under `raw`.
pub fn extract_body_variables(
    store: &mut VariableStore,
    collection: Collection,
    content_type: Option<&str>,
    body: &[u8],
) {
    if body.is_empty() {
        return;
    }

    let text = String::from_utf8_lossy(body);
    store.set(collection, "raw", text.as_ref());

    let Some(content_type) = content_type else {
        return;
    };
    let media_type = content_type.to_ascii_lowercase();

    if media_type.starts_with("application/x-www-form-urlencoded") {
        extract_urlencoded(store, collection, &text);
    } else if media_type.starts_with("application/json") {
        extract_json(store, collection, body);
    } else if media_type.starts_with("multipart/form-data") {
        // Boundary tokens are case-sensitive; read them from the raw header
        if let Some(boundary) = boundary_from_content_type(content_type) {
            extract_multipart(store, collection, &text, &boundary);
        }
    }
}

fn extract_urlencoded(store: &mut VariableStore, collection: Collection, text: &str) {
    for pair in text.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };
        store.append(collection, url_decode(key), url_decode(value));
    }
}

fn extract_json(store: &mut VariableStore, collection: Collection, body: &[u8]) {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
        debug!("request body declared as JSON but failed to parse");
        return;
    };
    flatten_json(store, collection, "json", &value);
}

fn flatten_json(
    store: &mut VariableStore,
    collection: Collection,
    prefix: &str,
    value: &serde_json::Value,
) {
    use serde_json::Value;

    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                flatten_json(store, collection, &format!("{prefix}.{key}"), nested);
            }
        }
        Value::Array(items) => {
            for (index, nested) in items.iter().enumerate() {
                flatten_json(store, collection, &format!("{prefix}.{index}"), nested);
            }
        }
        Value::String(s) => store.append(collection, prefix, s),
        Value::Number(n) => store.append(collection, prefix, n.to_string()),
        Value::Bool(b) => store.append(collection, prefix, b.to_string()),
        Value::Null => store.append(collection, prefix, ""),
    }
}

fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .map(str::trim)
        .find_map(|part| {
            part.to_ascii_lowercase()
                .starts_with("boundary=")
                .then(|| &part["boundary=".len()..])
        })
        .map(|b| b.trim_matches('"').to_string())
}

fn extract_multipart(store: &mut VariableStore, collection: Collection, text: &str, boundary: &str) {
    let delimiter = format!("--{boundary}");

    for part in text.split(delimiter.as_str()).skip(1) {
        let part = part.trim_start_matches("\r\n");
        if part.starts_with("--") || part.is_empty() {
            continue; // closing delimiter
        }

        let Some((headers, value)) = part.split_once("\r\n\r\n") else {
            continue;
        };

        let Some(name) = headers
            .lines()
            .find(|l| l.to_ascii_lowercase().starts_with("content-disposition"))
            .and_then(field_name_from_disposition)
        else {
            continue;
        };

        let value = value.trim_end_matches("\r\n");
        store.append(collection, name, value);
    }
}

fn field_name_from_disposition(header: &str) -> Option<String> {
    header
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("name="))
        .map(|n| n.trim_matches('"').to_string())
}

/// Percent-decode a URL-encoded component, treating `+` as space.
pub(crate) fn url_decode(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '%' {
            let hex: String = chars.by_ref().take(2).collect();
            if hex.len() == 2 {
                if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                    result.push(byte as char);
                    continue;
                }
            }
            result.push('%');
            result.push_str(&hex);
        } else if c == '+' {
            result.push(' ');
        } else {
            result.push(c);
        }
    }
    result
}
