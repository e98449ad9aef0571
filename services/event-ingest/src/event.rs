//! Device event wire format and normalization.
//!
//! Producers publish loosely-shaped JSON: the device identifier may arrive as
//! `deviceId` or `cameraID`, timestamps as ISO-8601 strings or epoch numbers,
//! and any number of extra fields. [`normalize`] turns one message into a
//! [`NormalizedEvent`] or fails with [`MalformedEvent`]. Unknown fields are
//! never parsed; the whole message is kept verbatim as the audit payload.

use crate::error::MalformedEvent;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;

/// Device identifier used when a message carries neither `deviceId` nor `cameraID`
pub const UNKNOWN_DEVICE: &str = "unknown-device";

/// Wall-clock format of the analytics store (`DateTime`, UTC, second precision)
pub const STORE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Numeric timestamps above this are epoch milliseconds, otherwise seconds
const EPOCH_MILLIS_THRESHOLD: f64 = 1e12;

/// Largest representable epoch offset in milliseconds (±100,000,000 days)
const MAX_EPOCH_MILLIS: f64 = 8.64e15;

/// Integral floats below this render without a fractional part
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Standard alphabet; padding optional, stray trailing bits tolerated
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// Device event as published on the broker.
///
/// Scalar fields are kept as raw JSON text: a number too large for `f64`
/// must only spoil its own field, never the whole document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawDeviceEvent {
    #[serde(rename = "deviceId", default)]
    pub device_id: Option<Box<RawValue>>,
    #[serde(rename = "cameraID", default)]
    pub camera_id: Option<Box<RawValue>>,
    /// Producer-assigned id; not unique across redelivery, used for logging only
    #[serde(rename = "eventId", default)]
    pub event_id: Option<Box<RawValue>>,
    #[serde(default)]
    pub timestamp: Option<Box<RawValue>>,
    #[serde(default)]
    pub image: Option<ImageAttachment>,
    #[serde(default)]
    pub confidence: Option<Box<RawValue>>,
}

impl RawDeviceEvent {
    /// Parsed value of a raw field; `None` when absent or out of range
    fn field(raw: &Option<Box<RawValue>>) -> Option<Value> {
        raw.as_deref()
            .and_then(|raw| serde_json::from_str(raw.get()).ok())
    }
}

/// Embedded image
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageAttachment {
    #[serde(default)]
    pub base64: Option<String>,
}

/// Where a normalized timestamp came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampSource {
    /// Parsed from the event
    Event,
    /// Event timestamp absent or unparseable; processing time used instead
    ReceivedAt,
}

/// Event time truncated to whole seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventTimestamp {
    pub at: DateTime<Utc>,
    pub source: TimestampSource,
}

impl EventTimestamp {
    /// `YYYY-MM-DD HH:MM:SS` in UTC
    pub fn to_store_string(&self) -> String {
        self.at.format(STORE_TIMESTAMP_FORMAT).to_string()
    }
}

/// Canonical form of an inbound device event
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    /// Registry key, object key prefix and analytics camera reference
    pub camera_id: String,
    pub producer_event_id: Option<String>,
    pub timestamp: EventTimestamp,
    /// Decoded image bytes
    pub image: Vec<u8>,
    pub confidence: f64,
    /// The inbound message, verbatim
    pub payload: String,
}

/// Row of the analytics `events` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Normalized timestamp string; producer ids are not trusted
    #[serde(rename = "eventId")]
    pub event_id: String,
    #[serde(rename = "cameraID")]
    pub camera_id: String,
    pub timestamp: String,
    pub confidence: f64,
    pub image_path: String,
    pub payload: String,
}

impl EventRecord {
    pub fn new(
        camera_id: String,
        timestamp: &EventTimestamp,
        confidence: f64,
        image_path: String,
        payload: String,
    ) -> Self {
        let timestamp = timestamp.to_store_string();
        Self {
            event_id: timestamp.clone(),
            camera_id,
            timestamp,
            confidence,
            image_path,
            payload,
        }
    }
}

/// Parse and canonicalize one broker message
pub fn normalize(
    message: &[u8],
    received_at: DateTime<Utc>,
) -> Result<NormalizedEvent, MalformedEvent> {
    let payload = std::str::from_utf8(message)
        .map_err(|e| MalformedEvent::InvalidDocument(e.to_string()))?;

    if !payload.trim_start().starts_with('{') {
        return Err(MalformedEvent::InvalidDocument(
            "expected a JSON object".to_string(),
        ));
    }

    let raw: RawDeviceEvent = serde_json::from_str(payload)
        .map_err(|e| MalformedEvent::InvalidDocument(e.to_string()))?;

    let image = decode_image(&raw)?;

    Ok(NormalizedEvent {
        camera_id: resolve_camera_id(&raw),
        producer_event_id: identifier(RawDeviceEvent::field(&raw.event_id).as_ref()),
        timestamp: resolve_timestamp(RawDeviceEvent::field(&raw.timestamp).as_ref(), received_at),
        image,
        confidence: resolve_confidence(RawDeviceEvent::field(&raw.confidence).as_ref()),
        payload: payload.to_string(),
    })
}

/// `deviceId`, then `cameraID`, then [`UNKNOWN_DEVICE`]
pub fn resolve_camera_id(raw: &RawDeviceEvent) -> String {
    identifier(RawDeviceEvent::field(&raw.device_id).as_ref())
        .or_else(|| identifier(RawDeviceEvent::field(&raw.camera_id).as_ref()))
        .unwrap_or_else(|| UNKNOWN_DEVICE.to_string())
}

/// Resolve an event timestamp, falling back to `received_at`
pub fn resolve_timestamp(value: Option<&Value>, received_at: DateTime<Utc>) -> EventTimestamp {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_f64().and_then(from_epoch),
        Some(Value::String(s)) => parse_timestamp_str(s),
        _ => None,
    };

    match parsed {
        Some(at) => EventTimestamp {
            at: at.trunc_subsecs(0),
            source: TimestampSource::Event,
        },
        None => EventTimestamp {
            at: received_at.trunc_subsecs(0),
            source: TimestampSource::ReceivedAt,
        },
    }
}

fn resolve_confidence(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().filter(|c| c.is_finite()).unwrap_or(0.0),
        _ => 0.0,
    }
}

fn decode_image(raw: &RawDeviceEvent) -> Result<Vec<u8>, MalformedEvent> {
    let encoded = raw
        .image
        .as_ref()
        .and_then(|image| image.base64.as_deref())
        .filter(|encoded| !encoded.is_empty())
        .ok_or(MalformedEvent::MissingImage)?;

    let compact: String = encoded
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();

    LENIENT_BASE64
        .decode(compact)
        .map_err(|e| MalformedEvent::InvalidImage(e.to_string()))
}

fn identifier(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(number_identifier(n)),
        _ => None,
    }
}

/// Integral numbers render without `.0`, so `42.0` and `42` name one device
fn number_identifier(n: &serde_json::Number) -> String {
    match n.as_f64() {
        Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() <= MAX_SAFE_INTEGER => {
            format!("{}", f as i64)
        }
        _ => n.to_string(),
    }
}

fn from_epoch(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() {
        return None;
    }

    let millis = if value > EPOCH_MILLIS_THRESHOLD {
        value
    } else {
        value * 1000.0
    };

    if millis.abs() > MAX_EPOCH_MILLIS {
        return None;
    }

    Utc.timestamp_millis_opt(millis.trunc() as i64).single()
}

fn parse_timestamp_str(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    if input.bytes().all(|b| b.is_ascii_digit()) {
        return input.parse::<f64>().ok().and_then(from_epoch);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc));
    }

    if let Ok(dt) = DateTime::parse_from_str(input, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.with_timezone(&Utc));
    }

    // Offset-less forms are read as UTC
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}
