//! Channel payload decoding.
//!
//! Every device exposes four text channels. A frame is a short ASCII number
//! terminated by carriage-return and/or NUL bytes. Devices occasionally send
//! garbage, so [`decode`] resolves unparsable values to the field's fallback
//! instead of failing; only an unrecognised channel key is an error.

use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use thiserror::Error;

/// Longest frame text kept in a [`DecodeError::MalformedValue`] report.
pub const MAX_FRAME_LEN: usize = 32;
/// Number of channels a fully discovered device exposes.
pub const EXPECTED_CHANNEL_COUNT: usize = 4;

const FRAME_TERMINATORS: [char; 2] = ['\r', '\0'];

pub type FrameBuffer = ArrayString<MAX_FRAME_LEN>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleField {
    Id,
    Speed,
    Heading,
    Distance,
}

/// Channel identifier to vehicle field.
pub const CHANNEL_BINDINGS: [(&str, VehicleField); EXPECTED_CHANNEL_COUNT] = [
    ("fff1", VehicleField::Id),
    ("fff2", VehicleField::Speed),
    ("fff3", VehicleField::Heading),
    ("fff4", VehicleField::Distance),
];

const_assert_eq!(CHANNEL_BINDINGS.len(), EXPECTED_CHANNEL_COUNT);

/// A resolved channel key from [`CHANNEL_BINDINGS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ChannelKey {
    key: &'static str,
    field: VehicleField,
}

impl ChannelKey {
    /// Looks up a raw channel identifier, ignoring ASCII case.
    pub fn lookup(raw: &str) -> Option<Self> {
        CHANNEL_BINDINGS
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(raw))
            .map(|&(key, field)| Self { key, field })
    }

    pub fn for_field(field: VehicleField) -> Self {
        let (key, _) = CHANNEL_BINDINGS[field as usize];
        Self { key, field }
    }

    pub fn as_str(&self) -> &'static str {
        self.key
    }

    pub fn field(&self) -> VehicleField {
        self.field
    }
}

/// A typed write to exactly one vehicle field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum AttributeUpdate {
    Id(i64),
    Speed(f64),
    Heading(f64),
    Distance(i64),
}

impl AttributeUpdate {
    pub fn field(&self) -> VehicleField {
        match self {
            AttributeUpdate::Id(_) => VehicleField::Id,
            AttributeUpdate::Speed(_) => VehicleField::Speed,
            AttributeUpdate::Heading(_) => VehicleField::Heading,
            AttributeUpdate::Distance(_) => VehicleField::Distance,
        }
    }

    /// Clamps speed and heading into `-1.0..=1.0`. Non-finite values
    /// become the field fallback.
    pub fn normalized(self) -> Self {
        match self {
            AttributeUpdate::Speed(speed) => AttributeUpdate::Speed(normalize_unit(speed)),
            AttributeUpdate::Heading(heading) => AttributeUpdate::Heading(normalize_unit(heading)),
            other => other,
        }
    }

    /// Value written when a frame for `field` cannot be parsed.
    pub fn fallback(field: VehicleField) -> Self {
        match field {
            VehicleField::Id => AttributeUpdate::Id(0),
            VehicleField::Speed => AttributeUpdate::Speed(0.0),
            VehicleField::Heading => AttributeUpdate::Heading(0.0),
            VehicleField::Distance => AttributeUpdate::Distance(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown channel `{0}`")]
    UnknownChannel(String),
    #[error("malformed {field:?} value `{text}`")]
    MalformedValue { field: VehicleField, text: String },
}

/// Decodes a frame, falling back to the field default on malformed text.
pub fn decode(channel: &str, payload: &[u8]) -> Result<AttributeUpdate, DecodeError> {
    match decode_strict(channel, payload) {
        Err(DecodeError::MalformedValue { field, text }) => {
            tracing::debug!(channel, ?field, text = %text, "malformed frame, using fallback value");
            Ok(AttributeUpdate::fallback(field))
        }
        other => other,
    }
}

/// Decodes a frame, reporting malformed text as [`DecodeError::MalformedValue`].
pub fn decode_strict(channel: &str, payload: &[u8]) -> Result<AttributeUpdate, DecodeError> {
    let key = ChannelKey::lookup(channel)
        .ok_or_else(|| DecodeError::UnknownChannel(channel.to_string()))?;
    let field = key.field();

    let malformed = |text: &str| DecodeError::MalformedValue {
        field,
        text: excerpt(text).to_string(),
    };

    let text = std::str::from_utf8(payload)
        .map_err(|_| malformed(&*String::from_utf8_lossy(payload)))?;
    let frame = text.trim_end_matches(&FRAME_TERMINATORS[..]);

    match field {
        VehicleField::Id => parse_int(frame)
            .map(AttributeUpdate::Id)
            .ok_or_else(|| malformed(frame)),
        VehicleField::Distance => parse_int(frame)
            .map(AttributeUpdate::Distance)
            .ok_or_else(|| malformed(frame)),
        VehicleField::Speed => parse_unit(frame)
            .map(AttributeUpdate::Speed)
            .ok_or_else(|| malformed(frame)),
        VehicleField::Heading => parse_unit(frame)
            .map(AttributeUpdate::Heading)
            .ok_or_else(|| malformed(frame)),
    }
}

/// Leading part of a rejected frame, bounded for error reports and logs.
fn excerpt(text: &str) -> FrameBuffer {
    let mut buffer = FrameBuffer::new();
    for ch in text.chars() {
        if buffer.try_push(ch).is_err() {
            break;
        }
    }
    buffer
}

fn parse_int(text: &str) -> Option<i64> {
    text.parse::<i64>().ok()
}

fn parse_unit(text: &str) -> Option<f64> {
    text.parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .map(normalize_unit)
}

fn normalize_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}
