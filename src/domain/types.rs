//! Shared types for the pallet portal

use serde::{Deserialize, Deserializer, Serialize};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a new UUIDv7 (time-sortable)
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Newtype wrapper for archway IDs to provide type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ArchwayId(pub u8);

impl std::fmt::Display for ArchwayId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scan session identifier (UUIDv7, unique per presence event)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(new_uuid_v7())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which sensor produced a decode attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReadingSource {
    #[serde(rename = "camera-left")]
    CameraLeft,
    #[serde(rename = "camera-right")]
    CameraRight,
    #[serde(rename = "infrared")]
    Infrared,
}

impl ReadingSource {
    #[inline]
    pub fn is_camera(&self) -> bool {
        matches!(self, ReadingSource::CameraLeft | ReadingSource::CameraRight)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingSource::CameraLeft => "camera-left",
            ReadingSource::CameraRight => "camera-right",
            ReadingSource::Infrared => "infrared",
        }
    }
}

impl std::str::FromStr for ReadingSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "camera-left" | "camera_left" | "cam0" => Ok(ReadingSource::CameraLeft),
            "camera-right" | "camera_right" | "cam1" => Ok(ReadingSource::CameraRight),
            "infrared" | "ir" => Ok(ReadingSource::Infrared),
            other => Err(format!("unknown reading source '{other}'")),
        }
    }
}

/// Normalize a barcode value: trimmed and upper-cased
#[inline]
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// A single decode attempt collected during a capture window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BarcodeReading {
    pub source: ReadingSource,
    /// Decoded value as reported by the capture pipeline
    pub code: String,
    pub confidence: f32,
    /// Capture timestamp (epoch ms)
    pub ts: u64,
}

impl BarcodeReading {
    /// Create a reading; infrared confidence is always 1.0
    pub fn new(source: ReadingSource, code: &str, confidence: f32, ts: u64) -> Self {
        let confidence = if source == ReadingSource::Infrared { 1.0 } else { confidence };
        Self { source, code: code.to_string(), confidence, ts }
    }

    pub fn camera(code: &str, confidence: f32, ts: u64) -> Self {
        Self::new(ReadingSource::CameraLeft, code, confidence, ts)
    }

    pub fn infrared(code: &str, ts: u64) -> Self {
        Self::new(ReadingSource::Infrared, code, 1.0, ts)
    }

    /// Normalized code value used for grouping
    pub fn normalized(&self) -> String {
        normalize_code(&self.code)
    }
}

/// An expected code and quantity on the shipping manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub code: String,
    #[serde(default = "default_quantity", alias = "qty")]
    pub quantity: u32,
}

fn default_quantity() -> u32 {
    1
}

impl ManifestEntry {
    pub fn new(code: &str, quantity: u32) -> Self {
        Self { code: normalize_code(code), quantity }
    }
}

/// Timestamp that can be either ISO 8601 string or epoch milliseconds
#[derive(Debug, Clone, Default, PartialEq)]
pub enum TimestampValue {
    #[default]
    None,
    IsoString(String),
    EpochMs(u64),
}

impl TimestampValue {
    /// Resolve to epoch milliseconds, falling back to the supplied value
    pub fn to_epoch_ms_or(&self, fallback: u64) -> u64 {
        match self {
            TimestampValue::None => fallback,
            TimestampValue::EpochMs(ms) => *ms,
            TimestampValue::IsoString(s) => {
                time::OffsetDateTime::parse(s, &time::format_description::well_known::Rfc3339)
                    .map(|dt| (dt.unix_timestamp_nanos() / 1_000_000) as u64)
                    .unwrap_or(fallback)
            }
        }
    }
}

pub fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<TimestampValue, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct TimestampVisitor;

    impl<'de> Visitor<'de> for TimestampVisitor {
        type Value = TimestampValue;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or integer timestamp")
        }

        fn visit_str<E>(self, value: &str) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::IsoString(value.to_string()))
        }

        fn visit_string<E>(self, value: String) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::IsoString(value))
        }

        fn visit_u64<E>(self, value: u64) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::EpochMs(value))
        }

        fn visit_i64<E>(self, value: i64) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::EpochMs(u64::try_from(value).unwrap_or(0)))
        }

        fn visit_unit<E>(self) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::None)
        }
    }

    deserializer.deserialize_any(TimestampVisitor)
}

/// Event submitted by producers to the orchestrator queue
#[derive(Debug, Clone)]
pub struct ScanEvent {
    pub kind: ScanEventKind,
    /// Producer-side timestamp (epoch ms)
    pub event_time: u64,
    pub received_at: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanEventKind {
    /// Raw ultrasonic sample; `None` when the sensor produced no valid pulse
    Distance { archway: ArchwayId, sensor: u8, distance_in: Option<f64> },
    /// Presence decided by the external sensor layer
    Presence { archway: ArchwayId, present: bool },
    /// Decode attempt from a camera or the IR scanner
    Reading { archway: ArchwayId, source: ReadingSource, code: String, confidence: f32 },
    /// Replace the manifest (empty list unloads it)
    ManifestLoad(Vec<ManifestEntry>),
}

impl ScanEvent {
    pub fn new(kind: ScanEventKind, event_time: u64) -> Self {
        Self { kind, event_time, received_at: Instant::now() }
    }

    pub fn at(mut self, received_at: Instant) -> Self {
        self.received_at = received_at;
        self
    }
}

impl ScanEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanEventKind::Distance { .. } => "distance",
            ScanEventKind::Presence { .. } => "presence",
            ScanEventKind::Reading { .. } => "reading",
            ScanEventKind::ManifestLoad(_) => "manifest_load",
        }
    }
}
