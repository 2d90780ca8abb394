//! Domain model for the realtime vehicle pipeline.
//!
//! Defines the wire-level event envelope and the domain types that flow
//! through the processor: vehicle positions, viewport bounding boxes, scope
//! definitions, and computed frames.
//!
//! # Envelope versioning
//!
//! Every published message is wrapped in an [`EventEnvelope`] carrying a
//! schema version. Consumers reject unknown versions rather than coercing
//! them, which allows the payload shape to evolve without silently breaking
//! older processors. The event payload itself is a tagged union on `kind`,
//! so dispatch is exhaustive at compile time.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Envelope schema version understood by this processor.
pub const ENVELOPE_SCHEMA_VERSION: &str = "1";

/// Identifier of a provisioned scope (see [`crate::scope::compute_scope_id`]).
pub type ScopeId = String;

/// Errors raised while decoding or validating an event envelope.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The payload is not valid JSON or does not match the envelope shape.
    ///
    /// Unknown `kind` discriminants land here as well, since serde cannot
    /// select a variant for them.
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Envelope carries a schema version this processor does not understand.
    #[error("unsupported schema version {found:?} (expected {ENVELOPE_SCHEMA_VERSION:?})")]
    SchemaVersion { found: String },

    /// Vehicle id must be a non-empty string.
    #[error("vehicle id is empty")]
    EmptyVehicleId,

    /// Latitude outside [-90, 90].
    #[error("latitude {0} out of range [-90, 90]")]
    LatitudeOutOfRange(f64),

    /// Longitude outside [-180, 180].
    #[error("longitude {0} out of range [-180, 180]")]
    LongitudeOutOfRange(f64),

    /// Bearing outside [0, 360).
    #[error("bearing {0} out of range [0, 360)")]
    BearingOutOfRange(f64),

    /// Speed must be non-negative.
    #[error("speed {0} m/s is negative")]
    NegativeSpeed(f64),
}

/// Geographic coordinate in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    /// Latitude in degrees, [-90, 90].
    pub lat: f64,
    /// Longitude in degrees, [-180, 180].
    pub lng: f64,
}

impl Coordinate {
    /// Check that both components are within geographic bounds.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(-90.0..=90.0).contains(&self.lat) {
            return Err(ValidationError::LatitudeOutOfRange(self.lat));
        }
        if !(-180.0..=180.0).contains(&self.lng) {
            return Err(ValidationError::LongitudeOutOfRange(self.lng));
        }
        Ok(())
    }
}

/// Operational status reported with a vehicle position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleStatus {
    InService,
    OutOfService,
    Unknown,
}

/// Last-known position of a single vehicle.
///
/// Identity is the `id` field; upserts replace the whole record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehiclePosition {
    /// Stable vehicle identifier within a city feed.
    pub id: String,
    /// Last reported coordinate.
    pub coordinate: Coordinate,
    /// When the source observed this position.
    pub updated_at: DateTime<Utc>,
    /// Heading in degrees clockwise from north, [0, 360).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearing: Option<f64>,
    /// Ground speed in metres per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_mps: Option<f64>,
    /// Operational status, if the source reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<VehicleStatus>,
}

impl VehiclePosition {
    /// Semantic validation beyond what serde shape-checks.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::EmptyVehicleId);
        }
        self.coordinate.validate()?;
        if let Some(bearing) = self.bearing {
            if !(0.0..360.0).contains(&bearing) {
                return Err(ValidationError::BearingOutOfRange(bearing));
            }
        }
        if let Some(speed) = self.speed_mps {
            if speed < 0.0 {
                return Err(ValidationError::NegativeSpeed(speed));
            }
        }
        Ok(())
    }
}

/// Payload of a `vehicle.remove` event: just the identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleRef {
    pub id: String,
}

/// Normalized vehicle event, discriminated on `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum VehicleEvent {
    /// Insert or replace a vehicle's position in its city map.
    #[serde(rename = "vehicle.upsert", rename_all = "camelCase")]
    Upsert {
        at: DateTime<Utc>,
        city_id: String,
        source: String,
        payload: VehiclePosition,
    },
    /// Remove a vehicle from its city map. Removing an absent id is a no-op.
    #[serde(rename = "vehicle.remove", rename_all = "camelCase")]
    Remove {
        at: DateTime<Utc>,
        city_id: String,
        source: String,
        payload: VehicleRef,
    },
}

impl VehicleEvent {
    /// City this event applies to.
    pub fn city_id(&self) -> &str {
        match self {
            Self::Upsert { city_id, .. } | Self::Remove { city_id, .. } => city_id,
        }
    }

    /// Wire-level discriminant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Upsert { .. } => "vehicle.upsert",
            Self::Remove { .. } => "vehicle.remove",
        }
    }
}

/// Versioned wrapper around a [`VehicleEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Must equal [`ENVELOPE_SCHEMA_VERSION`].
    pub schema_version: String,
    pub data: VehicleEvent,
}

impl EventEnvelope {
    /// Wrap an event in the current schema version.
    pub fn new(data: VehicleEvent) -> Self {
        Self {
            schema_version: ENVELOPE_SCHEMA_VERSION.to_string(),
            data,
        }
    }

    /// Decode and validate an envelope from raw transport bytes.
    pub fn decode(payload: &[u8]) -> Result<Self, ValidationError> {
        let envelope: Self = serde_json::from_slice(payload)?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Serialize for publishing.
    pub fn encode(&self) -> Result<Bytes, ValidationError> {
        let raw = serde_json::to_vec(self)?;
        Ok(Bytes::from(raw))
    }

    /// Check schema version and event payload semantics.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.schema_version != ENVELOPE_SCHEMA_VERSION {
            return Err(ValidationError::SchemaVersion {
                found: self.schema_version.clone(),
            });
        }
        match &self.data {
            VehicleEvent::Upsert { payload, .. } => payload.validate(),
            VehicleEvent::Remove { payload, .. } => {
                if payload.id.is_empty() {
                    return Err(ValidationError::EmptyVehicleId);
                }
                Ok(())
            }
        }
    }
}

/// Viewport bounding box in degrees.
///
/// Invariants `north >= south` and `east >= west` are enforced at the
/// provisioning seam (see [`crate::scope`]); `zoom` is a display hint and
/// never participates in scope identity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zoom: Option<f64>,
}

impl BBox {
    /// Inclusive containment test used by frame computation.
    pub fn contains(&self, coordinate: &Coordinate) -> bool {
        self.south <= coordinate.lat
            && coordinate.lat <= self.north
            && self.west <= coordinate.lng
            && coordinate.lng <= self.east
    }
}

/// A provisioned viewport subscription: city plus canonical bounding box.
///
/// Created once per distinct normalized viewport, immutable thereafter, and
/// destroyed only by TTL expiry in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeDefinition {
    pub id: ScopeId,
    pub city_id: String,
    pub bbox: BBox,
    pub created_at: DateTime<Utc>,
}

/// Snapshot of the vehicles inside one scope's bounding box.
///
/// Recomputed on every relevant state change; each computation supersedes
/// the previous frame rather than merging into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopedTrainsFrame {
    pub scope_id: ScopeId,
    pub city_id: String,
    pub bbox: BBox,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub vehicles: Vec<VehiclePosition>,
}
