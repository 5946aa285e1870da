//! Server-Sent Events transport for appliance updates.
//!
//! Opens `api/homeappliances/events` (all appliances) or
//! `api/homeappliances/{id}/events` (one appliance) and yields typed
//! [`StreamEvent`]s. Frames are decoded incrementally by [`SseDecoder`];
//! event names are parsed once here into [`StreamEventKind`] so nothing
//! downstream matches on raw strings.
//!
//! The stream does not reconnect on its own. It ends with `Ok` items
//! exhausted on a clean server close, or with a single `Err` on a
//! transport failure; reconnection policy belongs to the caller.
//!
//! # Example
//!
//! ```rust,ignore
//! use futures_util::StreamExt;
//!
//! let mut events = client.open_event_stream(None).await?;
//! while let Some(event) = events.next().await {
//!     let event = event?;
//!     println!("{:?} {:?}", event.kind, event.appliance_id);
//! }
//! ```

use std::pin::Pin;

use bytes::{Buf, BytesMut};
use futures_util::{Stream, StreamExt};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};
use tracing::{debug, trace, warn};

use crate::client::HomeConnectClient;
use crate::error::Error;

// ── Event kind ───────────────────────────────────────────────────────

/// The SSE `event:` field, parsed.
#[derive(Debug, Clone, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
pub enum StreamEventKind {
    #[strum(serialize = "KEEP-ALIVE")]
    KeepAlive,
    #[strum(serialize = "STATUS")]
    Status,
    #[strum(serialize = "EVENT")]
    Event,
    #[strum(serialize = "NOTIFY")]
    Notify,
    #[strum(serialize = "CONNECTED")]
    Connected,
    #[strum(serialize = "DISCONNECTED")]
    Disconnected,
    #[strum(serialize = "PAIRED")]
    Paired,
    #[strum(serialize = "DEPAIRED")]
    Depaired,
    #[strum(default)]
    Other(String),
}

impl StreamEventKind {
    /// Whether events of this kind carry key/value items to apply.
    pub fn carries_values(&self) -> bool {
        matches!(self, Self::Status | Self::Event | Self::Notify)
    }
}

// ── StreamEvent ──────────────────────────────────────────────────────

/// One normalized key/value update from an event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventItem {
    pub ha_id: Option<String>,
    pub key: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// A decoded, typed event from the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub kind: StreamEventKind,
    /// The appliance this event concerns (SSE `id`, or derived from items).
    pub appliance_id: Option<String>,
    pub items: Vec<EventItem>,
}

impl StreamEvent {
    /// Build a typed event from a raw frame.
    pub fn from_frame(frame: &SseFrame) -> Self {
        let kind = frame
            .event
            .as_deref()
            .map_or(StreamEventKind::Other(String::new()), |name| {
                name.parse()
                    .unwrap_or_else(|_| StreamEventKind::Other(name.to_owned()))
            });
        let items = if kind.carries_values() {
            normalize_items(&frame.data, frame.id.as_deref())
        } else {
            Vec::new()
        };
        let appliance_id = frame
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .or_else(|| items.iter().find_map(|item| item.ha_id.clone()));
        Self {
            kind,
            appliance_id,
            items,
        }
    }
}

// ── Payload normalization ────────────────────────────────────────────

/// Parse an event `data` payload into items.
///
/// Accepts `{"items": [...]}` or a single item object. Within an item,
/// `key` and `value` may be nested under `data`; when `value` is missing
/// entirely the nested `data` object stands in for it. The appliance id
/// comes from the item's `haId`, then `fallback_id`, then the segment
/// following `homeappliances` in the item's `uri`.
pub fn normalize_items(data: &str, fallback_id: Option<&str>) -> Vec<EventItem> {
    let data = data.trim();
    if data.is_empty() {
        return Vec::new();
    }
    let Ok(payload) = serde_json::from_str::<Value>(data) else {
        trace!(data, "event payload is not JSON");
        return Vec::new();
    };

    let raw_items: Vec<&Value> = match payload.get("items").and_then(Value::as_array) {
        Some(items) => items.iter().collect(),
        None => vec![&payload],
    };

    raw_items
        .into_iter()
        .filter_map(|item| normalize_item(item, fallback_id))
        .collect()
}

fn normalize_item(item: &Value, fallback_id: Option<&str>) -> Option<EventItem> {
    let nested = item.get("data");
    let key = item
        .get("key")
        .and_then(Value::as_str)
        .or_else(|| nested.and_then(|d| d.get("key")).and_then(Value::as_str))?
        .to_owned();

    let value = item
        .get("value")
        .or_else(|| nested.and_then(|d| d.get("value")))
        .or(nested)
        .cloned()
        .unwrap_or(Value::Null);

    let uri = item.get("uri").and_then(Value::as_str).map(str::to_owned);
    let ha_id = item
        .get("haId")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .or_else(|| fallback_id.filter(|s| !s.is_empty()).map(str::to_owned))
        .or_else(|| uri.as_deref().and_then(appliance_id_from_uri));

    Some(EventItem {
        ha_id,
        key,
        value,
        uri,
        display_value: item
            .get("displayvalue")
            .and_then(Value::as_str)
            .map(str::to_owned),
        unit: item.get("unit").and_then(Value::as_str).map(str::to_owned),
    })
}

/// `/api/homeappliances/{id}/status/...` -> `{id}`
pub fn appliance_id_from_uri(uri: &str) -> Option<String> {
    let mut segments = uri.split('/').filter(|s| !s.is_empty());
    segments.find(|s| *s == "homeappliances")?;
    segments.next().map(str::to_owned)
}

// ── Frame decoder ────────────────────────────────────────────────────

/// One dispatched SSE frame before typing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

/// Longest line the decoder buffers before dropping it.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Incremental `text/event-stream` decoder.
///
/// Feed raw byte chunks as they arrive; complete frames are returned once
/// their terminating blank line has been seen. Handles `\n`, `\r\n` and
/// chunk boundaries that split lines or UTF-8 sequences. A line longer
/// than the limit is dropped together with the frame it belongs to.
#[derive(Debug)]
pub struct SseDecoder {
    buf: BytesMut,
    /// Bytes of `buf` already searched for a line break.
    scanned: usize,
    max_line: usize,
    /// Inside an oversized line; skip until its line break.
    discarding_line: bool,
    /// An oversized line was seen; skip until the frame's blank line.
    skipping_frame: bool,
    pending: SseFrame,
    has_fields: bool,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            scanned: 0,
            max_line,
            discarding_line: false,
            skipping_frame: false,
            pending: SseFrame::default(),
            has_fields: false,
        }
    }

    /// Append a chunk and drain every frame it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') else {
                self.scanned = self.buf.len();
                if self.scanned > self.max_line {
                    if !self.discarding_line {
                        self.reject_frame();
                    }
                    self.buf.clear();
                    self.scanned = 0;
                    self.discarding_line = true;
                }
                break;
            };
            let line = self.buf.split_to(self.scanned + offset);
            self.buf.advance(1);
            self.scanned = 0;
            if std::mem::take(&mut self.discarding_line) {
                continue;
            }
            if line.len() > self.max_line {
                self.reject_frame();
                continue;
            }

            let mut line = String::from_utf8_lossy(&line).into_owned();
            if line.ends_with('\r') {
                line.pop();
            }
            if self.skipping_frame {
                self.skipping_frame = !line.is_empty();
                continue;
            }
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    fn reject_frame(&mut self) {
        warn!(max_bytes = self.max_line, "event stream line too long, dropping frame");
        self.pending = SseFrame::default();
        self.has_fields = false;
        self.skipping_frame = true;
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            if !self.has_fields {
                return None;
            }
            self.has_fields = false;
            return Some(std::mem::take(&mut self.pending));
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.pending.event = Some(value.to_owned()),
            "data" => {
                if !self.pending.data.is_empty() {
                    self.pending.data.push('\n');
                }
                self.pending.data.push_str(value);
            }
            "id" => self.pending.id = Some(value.to_owned()),
            _ => return None,
        }
        self.has_fields = true;
        None
    }
}

// ── Connection ───────────────────────────────────────────────────────

/// A boxed stream of typed events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, Error>> + Send>>;

impl HomeConnectClient {
    /// Open the event stream for all appliances (`None`) or one appliance.
    ///
    /// The bearer token in effect at call time is used for the connection.
    /// Non-success statuses are reported as `Error::Stream { status }`.
    pub async fn open_event_stream(&self, ha_id: Option<&str>) -> Result<EventStream, Error> {
        let url = self.appliance_url(ha_id, "events")?;
        debug!(%url, "opening event stream");

        let mut builder = self
            .stream_http()
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream");
        if let Some(token) = self.current_token() {
            builder = builder.bearer_auth(token.expose_secret());
        }

        let resp = builder.send().await.map_err(|e| Error::Stream {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Stream {
                status: Some(status.as_u16()),
                message: format!("event stream rejected with HTTP {status}"),
            });
        }

        let mut body = Box::pin(resp.bytes_stream());
        let stream = async_stream::stream! {
            let mut decoder = SseDecoder::new();
            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(bytes) => {
                        for frame in decoder.feed(&bytes) {
                            yield Ok(StreamEvent::from_frame(&frame));
                        }
                    }
                    Err(e) => {
                        yield Err(Error::Stream { status: None, message: e.to_string() });
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}
