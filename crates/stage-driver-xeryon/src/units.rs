//! Conversion between encoder counts and physical units.
//!
//! Linear axes report resolution in nanometres per count, rotary axes in
//! microradians per count. Every unit therefore carries a scale in the
//! matching base quantity (nm or µrad), and conversion is
//! `counts = value * scale / resolution`.
//!
//! No rounding happens here. Callers that transmit counts round explicitly.

use serde::{Deserialize, Serialize};
use stage_core::error::{AppResult, StageError};
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

/// Mechanical kind of an axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AxisKind {
    /// Translation stage, positions in mm.
    Linear,
    /// Rotation stage, positions in degrees.
    Rotary,
}

impl AxisKind {
    /// Unit in which speeds are stored for this kind (mm/s or deg/s).
    pub fn base_unit(self) -> Unit {
        match self {
            AxisKind::Linear => Unit::Mm,
            AxisKind::Rotary => Unit::Deg,
        }
    }
}

impl fmt::Display for AxisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AxisKind::Linear => f.write_str("linear"),
            AxisKind::Rotary => f.write_str("rotary"),
        }
    }
}

/// Display/command unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Unit {
    /// Millimetre
    Mm,
    /// Micrometre
    Mu,
    /// Nanometre
    Nm,
    /// Inch
    Inch,
    /// Milli-inch
    Minch,
    /// Raw encoder counts
    Enc,
    /// Milliradian
    Mrad,
    /// Radian
    Rad,
    /// Degree
    Deg,
}

impl Unit {
    /// Every supported unit.
    pub const ALL: [Unit; 9] = [
        Unit::Mm,
        Unit::Mu,
        Unit::Nm,
        Unit::Inch,
        Unit::Minch,
        Unit::Enc,
        Unit::Mrad,
        Unit::Rad,
        Unit::Deg,
    ];

    /// Short symbol used in configuration and on the command line.
    pub fn symbol(self) -> &'static str {
        match self {
            Unit::Mm => "mm",
            Unit::Mu => "mu",
            Unit::Nm => "nm",
            Unit::Inch => "inch",
            Unit::Minch => "minch",
            Unit::Enc => "enc",
            Unit::Mrad => "mrad",
            Unit::Rad => "rad",
            Unit::Deg => "deg",
        }
    }

    /// Axis kind this unit measures, `None` for encoder counts.
    pub fn kind(self) -> Option<AxisKind> {
        match self {
            Unit::Mm | Unit::Mu | Unit::Nm | Unit::Inch | Unit::Minch => Some(AxisKind::Linear),
            Unit::Mrad | Unit::Rad | Unit::Deg => Some(AxisKind::Rotary),
            Unit::Enc => None,
        }
    }

    /// Fail with [`StageError::UnitMismatch`] unless usable on `kind`.
    pub fn check_kind(self, kind: AxisKind) -> AppResult<()> {
        match self.kind() {
            Some(k) if k != kind => Err(StageError::UnitMismatch {
                unit: self.symbol().to_string(),
                kind: kind.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Nanometres (linear) or microradians (rotary) per unit.
    fn scale(self) -> f64 {
        match self {
            Unit::Mm => 1e6,
            Unit::Mu => 1e3,
            Unit::Nm => 1.0,
            Unit::Inch => 25.4e6,
            Unit::Minch => 25.4e3,
            Unit::Enc => 1.0,
            Unit::Mrad => 1e3,
            Unit::Rad => 1e6,
            Unit::Deg => PI / 180.0 * 1e6,
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Unit {
    type Err = StageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mm" => Ok(Unit::Mm),
            "mu" | "um" | "µm" => Ok(Unit::Mu),
            "nm" => Ok(Unit::Nm),
            "inch" | "in" => Ok(Unit::Inch),
            "minch" | "mil" => Ok(Unit::Minch),
            "enc" | "encoder" | "counts" => Ok(Unit::Enc),
            "mrad" => Ok(Unit::Mrad),
            "rad" => Ok(Unit::Rad),
            "deg" | "°" => Ok(Unit::Deg),
            other => Err(StageError::Configuration(format!("unknown unit '{}'", other))),
        }
    }
}

impl TryFrom<String> for Unit {
    type Error = StageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Unit> for String {
    fn from(unit: Unit) -> Self {
        unit.symbol().to_string()
    }
}

fn check_resolution(resolution: f64) -> AppResult<()> {
    if resolution.is_finite() && resolution > 0.0 {
        Ok(())
    } else {
        Err(StageError::InvalidResolution(resolution))
    }
}

/// Convert `value` in `unit` to encoder counts.
pub fn to_encoder(value: f64, unit: Unit, resolution: f64) -> AppResult<f64> {
    check_resolution(resolution)?;
    Ok(match unit {
        Unit::Enc => value,
        _ => value * unit.scale() / resolution,
    })
}

/// Convert encoder counts to `unit`.
pub fn from_encoder(counts: f64, unit: Unit, resolution: f64) -> AppResult<f64> {
    check_resolution(resolution)?;
    Ok(match unit {
        Unit::Enc => counts,
        _ => counts * resolution / unit.scale(),
    })
}

/// Convert a rate stored in base units per second (mm/s or deg/s) into
/// `unit` per second.
pub fn rate_from_base(value: f64, kind: AxisKind, unit: Unit, resolution: f64) -> AppResult<f64> {
    let counts = to_encoder(value, kind.base_unit(), resolution)?;
    from_encoder(counts, unit, resolution)
}

/// Encoder counts in one full revolution for a rotary axis with the given
/// µrad/count resolution.
pub fn counts_per_revolution(resolution: f64) -> AppResult<i64> {
    check_resolution(resolution)?;
    Ok((2.0 * PI * 1e6 / resolution).round() as i64)
}
