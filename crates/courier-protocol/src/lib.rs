// courier-protocol: Wire header record and framing constants.
//
// A frame on the wire is `<json-header> \r\n\r\n <payload>`, where the
// header's `len` field gives the exact payload byte count.  The header is
// plain UTF-8 JSON with no length prefix; new optional fields can be added
// without a protocol version bump, and captures stay human-readable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// The four-byte header terminator.
pub const TERMINATOR: [u8; 4] = *b"\r\n\r\n";

/// Minimum number of header bytes a reader fetches before scanning for the
/// terminator.  Defensive floor against tiny-read attacks; every header this
/// library emits is comfortably larger.
pub const MIN_HEADER_PREFIX: usize = 24;

/// Preshared keys are exactly this many bytes on the wire.
pub const PSK_LEN: usize = 16;

/// Wall-clock format used for the `ts` and `exp` header fields.
pub const WIRE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f%:z";

/// User metadata attached to a message.  Values round-trip as arbitrary JSON.
pub type Metadata = HashMap<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Frame classification carried in the header's `status` field.
///
/// Serialized as the variant name string, so captures read as
/// `"status":"AuthRequested"` rather than an opaque ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// Ordinary application message.
    Normal,
    /// Server-initiated disconnect of a single client.
    Removed,
    /// Sender is shutting down.
    Shutdown,
    /// Idle timeout disconnect.
    Timeout,
    /// Server demands authentication (first frame to an unauthenticated peer).
    AuthRequired,
    /// Client presents its preshared key.
    AuthRequested,
    AuthSuccess,
    AuthFailure,
    /// Client declares its chosen GUID; the server rekeys its registry entry.
    RegisterClient,
}

// ---------------------------------------------------------------------------
// Wire timestamps
// ---------------------------------------------------------------------------

/// Serde adapter for the wire timestamp format.
pub mod wire_time {
    use super::WIRE_TIME_FORMAT;
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&ts.format(WIRE_TIME_FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        DateTime::parse_from_str(&s, WIRE_TIME_FORMAT)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for optional wire timestamps (`exp`).
pub mod wire_time_opt {
    use super::WIRE_TIME_FORMAT;
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match ts {
            Some(ts) => serializer.serialize_str(&ts.format(WIRE_TIME_FORMAT).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: Option<String> = Option::deserialize(deserializer)?;
        match s {
            None => Ok(None),
            Some(s) => DateTime::parse_from_str(&s, WIRE_TIME_FORMAT)
                .map(|ts| Some(ts.with_timezone(&Utc)))
                .map_err(serde::de::Error::custom),
        }
    }
}

// ---------------------------------------------------------------------------
// FrameHeader
// ---------------------------------------------------------------------------

/// The JSON header preceding every payload.
///
/// Member order on the wire is irrelevant; unknown members are ignored so
/// newer peers can add fields freely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameHeader {
    /// Payload byte count.  Authoritative: the receiver consumes exactly this
    /// many bytes before the next frame.
    pub len: u64,
    /// Preshared key material; only present in `AuthRequested` frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub psk: Option<Vec<u8>>,
    pub status: Status,
    /// User metadata map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md: Option<Metadata>,
    /// Sender expects a correlated response.
    #[serde(default)]
    pub syncreq: bool,
    /// This frame is a correlated response.
    #[serde(default)]
    pub syncresp: bool,
    /// Sender's wall clock at construction.
    #[serde(with = "wire_time")]
    pub ts: DateTime<Utc>,
    /// Absolute expiration for sync requests and their responses.
    #[serde(
        default,
        with = "wire_time_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub exp: Option<DateTime<Utc>>,
    /// Correlation identifier; stable across a request and its response.
    pub convguid: Uuid,
    /// Client-chosen GUID used to rebind server-side identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub senderguid: Option<Uuid>,
}

impl FrameHeader {
    /// An ordinary message frame.
    pub fn normal(len: u64, md: Option<Metadata>) -> Self {
        FrameHeader {
            len,
            psk: None,
            status: Status::Normal,
            md,
            syncreq: false,
            syncresp: false,
            ts: Utc::now(),
            exp: None,
            convguid: Uuid::new_v4(),
            senderguid: None,
        }
    }

    /// A zero-payload control frame (`Removed`, `Shutdown`, `Timeout`,
    /// `AuthRequired`, `AuthSuccess`, `AuthFailure`).
    pub fn control(status: Status) -> Self {
        FrameHeader {
            status,
            ..FrameHeader::normal(0, None)
        }
    }

    /// A sync request carrying a fresh conversation id and an absolute
    /// expiration.
    pub fn sync_request(len: u64, md: Option<Metadata>, exp: DateTime<Utc>) -> Self {
        FrameHeader {
            syncreq: true,
            exp: Some(exp),
            ..FrameHeader::normal(len, md)
        }
    }

    /// The response to `request`.  Conversation id and expiration are copied
    /// from the request so the originator can correlate and expire it.
    pub fn sync_response(request: &FrameHeader, len: u64, md: Option<Metadata>) -> Self {
        FrameHeader {
            syncresp: true,
            exp: request.exp,
            convguid: request.convguid,
            ..FrameHeader::normal(len, md)
        }
    }

    /// A client's answer to an `AuthRequired` challenge.
    pub fn auth_requested(psk: [u8; PSK_LEN]) -> Self {
        FrameHeader {
            psk: Some(psk.to_vec()),
            status: Status::AuthRequested,
            ..FrameHeader::normal(0, None)
        }
    }

    /// A client's GUID declaration.
    pub fn register_client(guid: Uuid) -> Self {
        FrameHeader {
            status: Status::RegisterClient,
            senderguid: Some(guid),
            ..FrameHeader::normal(0, None)
        }
    }

    /// True if this frame carries an `exp` that has already passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.exp.is_some_and(|exp| exp < now)
    }
}

// ---------------------------------------------------------------------------
// Encoding helpers
// ---------------------------------------------------------------------------

/// Encode a header to its wire form: UTF-8 JSON followed by the terminator.
pub fn encode_header(header: &FrameHeader) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(header)?;
    bytes.extend_from_slice(&TERMINATOR);
    Ok(bytes)
}

/// Parse the JSON portion of a header (terminator already stripped).
pub fn parse_header(bytes: &[u8]) -> Result<FrameHeader, serde_json::Error> {
    serde_json::from_slice(bytes)
}

/// Index of the first terminator occurrence in `buf`, if any.
pub fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(TERMINATOR.len())
        .position(|window| window == TERMINATOR)
}
