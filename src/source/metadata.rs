//! Cast receiver metadata stream decoding.
//!
//! The receiver writes XML-ish records to a FIFO:
//!
//! ```text
//! <item><type>73736e63</type><code>70766f6c</code><length>23</length>
//! <data encoding="base64">LTI0LjA5LC0yNC4wOSwtOTYuMzAsMC4wMA==</data></item>
//! ```
//!
//! `type` and `code` are hex-encoded four-character ASCII tags (`ssnc`,
//! `pvol`); the optional payload is base64.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::debug;

/// Buffered bytes beyond which incomplete data is discarded.
const MAX_BUFFER: usize = 10_000;

const ITEM_OPEN: &str = "<item>";
const ITEM_CLOSE: &str = "</item>";

/// One decoded metadata record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataItem {
    /// Four-character type tag, e.g. `ssnc` or `core`.
    pub item_type: String,
    /// Four-character code, e.g. `pvol`.
    pub code: String,
    /// Decoded payload, empty when absent.
    pub data: Vec<u8>,
}

impl MetadataItem {
    /// Returns `true` if this item has the given type and code.
    pub fn is(&self, item_type: &str, code: &str) -> bool {
        self.item_type == item_type && self.code == code
    }

    /// Returns the payload as text.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).trim().to_string()
    }
}

/// Incremental parser for the metadata stream.
///
/// Bytes arrive in arbitrary chunks; complete items are returned as soon as
/// their closing tag is seen.
#[derive(Debug, Default)]
pub struct MetadataParser {
    buffer: String,
}

impl MetadataParser {
    /// Creates an empty parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds bytes and returns every item completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<MetadataItem> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));

        let mut items = Vec::new();
        let mut consumed = 0;
        while let Some(start) = self.buffer[consumed..].find(ITEM_OPEN) {
            let start = consumed + start;
            let Some(end) = self.buffer[start..].find(ITEM_CLOSE) else {
                break;
            };
            let end = start + end + ITEM_CLOSE.len();
            match parse_item(&self.buffer[start..end]) {
                Some(item) => items.push(item),
                None => debug!("skipping malformed metadata item"),
            }
            consumed = end;
        }
        self.buffer.drain(..consumed);

        // Anything ahead of the next opening tag is separator text.
        let keep_from = match self.buffer.find(ITEM_OPEN) {
            Some(start) => start,
            None => self.buffer.len() - partial_open(&self.buffer),
        };
        self.buffer.drain(..keep_from);

        if self.buffer.len() > MAX_BUFFER {
            // Keep only a trailing partial item, if any.
            match self.buffer.rfind(ITEM_OPEN) {
                Some(start) => {
                    self.buffer.drain(..start);
                }
                None => self.buffer.clear(),
            }
            if self.buffer.len() > MAX_BUFFER {
                self.buffer.clear();
            }
        }

        items
    }

    /// Bytes currently held waiting for a closing tag.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Length of the longest suffix of `text` that could begin an opening tag.
fn partial_open(text: &str) -> usize {
    (1..ITEM_OPEN.len())
        .rev()
        .filter(|&n| n <= text.len() && text.is_char_boundary(text.len() - n))
        .find(|&n| ITEM_OPEN.starts_with(&text[text.len() - n..]))
        .unwrap_or(0)
}

fn parse_item(item: &str) -> Option<MetadataItem> {
    let item_type = decode_tag(element(item, "<type>", "</type>")?)?;
    let code = decode_tag(element(item, "<code>", "</code>")?)?;

    let data = match item.find("<data") {
        Some(open) => {
            let body_start = open + item[open..].find('>')? + 1;
            let body_end = body_start + item[body_start..].find("</data>")?;
            let encoded: String = item[body_start..body_end]
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            STANDARD.decode(encoded).ok()?
        }
        None => Vec::new(),
    };

    Some(MetadataItem {
        item_type,
        code,
        data,
    })
}

fn element<'a>(text: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = text.find(open)? + open.len();
    let end = start + text[start..].find(close)?;
    Some(text[start..end].trim())
}

fn decode_tag(hex: &str) -> Option<String> {
    if hex.len() % 2 != 0 {
        return None;
    }
    let bytes = (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}

/// Converts a receiver volume (dB, -144 meaning mute, otherwise -30..0) to
/// percent and a mute flag.
pub(crate) fn cast_volume(db: f32) -> (u8, bool) {
    if db <= -144.0 {
        return (0, true);
    }
    let percent = ((db + 30.0) * 100.0 / 30.0).clamp(0.0, 100.0);
    (percent as u8, false)
}
