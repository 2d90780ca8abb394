//! Viewport normalization and scope identity.
//!
//! Provides the pure functions that turn a client-supplied bounding box into
//! a canonical, deduplicated scope: Web-Mercator clamping, fixed-precision
//! quantization, and deterministic identifier derivation.
//!
//! Two requests for "the same" viewport — differing only in zoom or by less
//! than the configured precision — must collapse to one stored scope, so the
//! identifier is derived exclusively from the quantized bounds.

use thiserror::Error;

use crate::model::{BBox, ScopeId, ENVELOPE_SCHEMA_VERSION};

/// Maximum latitude representable in Web Mercator (degrees).
pub const WEB_MERCATOR_MAX_LAT: f64 = 85.05113;

/// Minimum zoom level.
pub const MIN_ZOOM: u8 = 0;

/// Maximum zoom level.
pub const MAX_ZOOM: u8 = 22;

/// Default quantization precision in degrees (~0.11 m at the equator).
pub const DEFAULT_SCOPE_PRECISION: f64 = 1e-6;

/// Delimiter between scope identifier fields.
const SCOPE_ID_DELIMITER: char = ':';

/// Errors raised while normalizing a viewport.
#[derive(Debug, Error, PartialEq)]
pub enum ScopeError {
    /// Bounding box violates `north >= south` or `east >= west`.
    #[error("invalid bbox ordering: south={south}, west={west}, north={north}, east={east}")]
    InvalidOrdering {
        south: f64,
        west: f64,
        north: f64,
        east: f64,
    },

    /// Quantization precision must be a positive finite number.
    #[error("invalid quantization precision {0}")]
    InvalidPrecision(f64),

    /// Rounding inverted the bounds. Only possible from pathological inputs
    /// at the boundary of a coarse precision.
    #[error("bbox ordering inverted after quantization at precision {precision}")]
    InvertedAfterQuantize { precision: f64 },
}

/// Options for [`compute_scope_id`].
#[derive(Debug, Clone)]
pub struct ScopeIdOptions {
    /// Quantization precision in degrees.
    pub precision: f64,
    /// Schema version embedded in the identifier.
    pub schema_version: String,
    /// Display zoom hint. Never participates in the identifier.
    pub zoom: Option<f64>,
}

impl Default for ScopeIdOptions {
    fn default() -> Self {
        Self {
            precision: DEFAULT_SCOPE_PRECISION,
            schema_version: ENVELOPE_SCHEMA_VERSION.to_string(),
            zoom: None,
        }
    }
}

/// Validates bbox ordering invariants.
#[inline]
pub fn validate_bbox(bbox: &BBox) -> Result<(), ScopeError> {
    if bbox.north < bbox.south || bbox.east < bbox.west {
        return Err(ScopeError::InvalidOrdering {
            south: bbox.south,
            west: bbox.west,
            north: bbox.north,
            east: bbox.east,
        });
    }
    Ok(())
}

/// Rounds a zoom hint to the nearest integer and clamps to [`MIN_ZOOM`]..=[`MAX_ZOOM`].
///
/// Zoom is optional metadata: `None` in, `None` out.
#[inline]
pub fn clamp_zoom(zoom: Option<f64>) -> Option<u8> {
    zoom.map(|z| z.round().clamp(f64::from(MIN_ZOOM), f64::from(MAX_ZOOM)) as u8)
}

/// Clamps bbox latitudes to the Web-Mercator range and longitudes to ±180°.
///
/// Field identity is preserved (no reordering), so a degenerate box near the
/// poles or the antimeridian cannot corrupt identity derivation downstream.
#[inline]
pub fn clamp_to_web_mercator(bbox: &BBox) -> BBox {
    BBox {
        south: bbox.south.clamp(-WEB_MERCATOR_MAX_LAT, WEB_MERCATOR_MAX_LAT),
        north: bbox.north.clamp(-WEB_MERCATOR_MAX_LAT, WEB_MERCATOR_MAX_LAT),
        west: bbox.west.clamp(-180.0, 180.0),
        east: bbox.east.clamp(-180.0, 180.0),
        zoom: bbox.zoom,
    }
}

/// Rounds each bound to the nearest multiple of `precision`.
///
/// Re-validates ordering after rounding; rounding is monotonic so this can
/// only fail for pathological inputs.
pub fn quantize_bbox(bbox: &BBox, precision: f64) -> Result<BBox, ScopeError> {
    if !precision.is_finite() || precision <= 0.0 {
        return Err(ScopeError::InvalidPrecision(precision));
    }

    // -0.0 compares equal to 0.0 but formats with a sign, which would split
    // one viewport into two identities at a zero-crossing bound.
    let quantize = |v: f64| {
        let q = (v / precision).round() * precision;
        if q == 0.0 {
            0.0
        } else {
            q
        }
    };

    let quantized = BBox {
        south: quantize(bbox.south),
        west: quantize(bbox.west),
        north: quantize(bbox.north),
        east: quantize(bbox.east),
        zoom: bbox.zoom,
    };

    if quantized.north < quantized.south || quantized.east < quantized.west {
        return Err(ScopeError::InvertedAfterQuantize { precision });
    }

    Ok(quantized)
}

/// Derives the deterministic scope identifier for a city viewport.
///
/// The bbox is clamped and quantized, each bound is formatted with a decimal
/// count derived from the precision, and the fields are joined as
/// `schemaVersion:cityId:south:west:north:east`. Zoom never participates, so
/// repeated requests for the same viewport — even with jittered coordinates —
/// collapse to one identifier.
pub fn compute_scope_id(
    city_id: &str,
    bbox: &BBox,
    options: &ScopeIdOptions,
) -> Result<ScopeId, ScopeError> {
    validate_bbox(bbox)?;
    let clamped = clamp_to_web_mercator(bbox);
    let quantized = quantize_bbox(&clamped, options.precision)?;

    let decimals = decimals_for_precision(options.precision);
    let d = SCOPE_ID_DELIMITER;
    Ok(format!(
        "{sv}{d}{city_id}{d}{south:.p$}{d}{west:.p$}{d}{north:.p$}{d}{east:.p$}",
        sv = options.schema_version,
        south = quantized.south,
        west = quantized.west,
        north = quantized.north,
        east = quantized.east,
        p = decimals,
    ))
}

/// Number of decimal places needed to represent multiples of `precision`.
///
/// `ceil(-log10(precision))`, floored at 0 — e.g. 1e-6 → 6, 0.5 → 1, 10 → 0.
#[inline]
fn decimals_for_precision(precision: f64) -> usize {
    let decimals = (-precision.log10()).ceil();
    if decimals.is_sign_negative() || decimals.is_nan() {
        0
    } else {
        decimals as usize
    }
}
