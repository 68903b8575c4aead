//! Axis settings: bounded, clamped values tied to a device mnemonic.
//!
//! A [`Parameter`] composes an [`Observable<f64>`] with immutable bounds and
//! the scaling used on the wire. Parameters never talk to the device
//! themselves; [`crate::controller::Controller::send_setting`] and
//! [`crate::controller::Controller::load_parameters_from_controller`] move
//! values between host and device.
//!
//! # Device scaling
//!
//! | Scaling     | Host unit           | Device value                  |
//! |-------------|---------------------|-------------------------------|
//! | `None`      | device unit         | `round(v)`                    |
//! | `Speed`     | mm/s or deg/s       | `round(v * 1000)`             |
//! | `Distance`  | mm or deg           | `round(v * 1e6 / resolution)` |
//! | `Frequency` | Hz                  | `round(v * 10)`               |
//!
//! The distance rule is the same for linear and rotary axes: the device
//! stores `value * 1e6 / resolution` whatever the host unit.
//!
//! # Example
//!
//! ```rust,ignore
//! let params = ParameterSet::for_axis(ControllerType::C, AxisFamily::Xls);
//! let sspd = params.get("SSPD").unwrap();
//! sspd.set(500.0)?;            // clamped to the family maximum
//! let raw = sspd.device_value(312.5)?;
//! ```

use serde::Serialize;
use stage_core::error::{AppResult, StageError};
use stage_core::observable::Observable;
use tokio::sync::watch;

use crate::controller::ControllerType;
use crate::identify::AxisFamily;
use crate::units::AxisKind;

/// Default position tolerance (counts) used when an axis has no `PTO2`.
pub const DEFAULT_PTO2: f64 = 10.0;

/// Grouping shown by settings views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ParameterCategory {
    /// Speeds and accelerations
    Motion,
    /// Soft limits
    Limits,
    /// Control loop tuning
    Control,
    /// Position/error tolerances
    Tolerance,
    /// Telemetry and link behaviour
    Communication,
}

/// How a host value maps to the integer the device stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceScaling {
    /// Value is already in device units.
    None,
    /// Speed, device stores thousandths.
    Speed,
    /// Distance, device stores encoder counts.
    Distance,
    /// Frequency, device stores tenths of a hertz.
    Frequency,
}

impl DeviceScaling {
    /// Host value → device integer.
    pub fn to_device(self, value: f64, resolution: f64) -> AppResult<i64> {
        let scaled = match self {
            DeviceScaling::None => value,
            DeviceScaling::Speed => value * 1000.0,
            DeviceScaling::Distance => value * DISTANCE_SCALE / checked(resolution)?,
            DeviceScaling::Frequency => value * 10.0,
        };
        Ok(scaled.round() as i64)
    }

    /// Device number → host value.
    pub fn from_device(self, raw: f64, resolution: f64) -> AppResult<f64> {
        Ok(match self {
            DeviceScaling::None => raw,
            DeviceScaling::Speed => raw / 1000.0,
            DeviceScaling::Distance => raw * checked(resolution)? / DISTANCE_SCALE,
            DeviceScaling::Frequency => raw / 10.0,
        })
    }
}

/// Resolution units per host distance unit on the wire.
const DISTANCE_SCALE: f64 = 1e6;

fn checked(resolution: f64) -> AppResult<f64> {
    if resolution.is_finite() && resolution > 0.0 {
        Ok(resolution)
    } else {
        Err(StageError::Configuration(format!(
            "resolution must be positive, got {}",
            resolution
        )))
    }
}

/// A bounded numeric setting identified by its device mnemonic.
#[derive(Debug, Clone)]
pub struct Parameter {
    mnemonic: &'static str,
    name: &'static str,
    category: ParameterCategory,
    min: f64,
    max: f64,
    increment: f64,
    scaling: DeviceScaling,
    value: Observable<f64>,
}

/// Serializable view of a parameter for listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterView {
    /// Device mnemonic
    pub mnemonic: &'static str,
    /// Display name
    pub name: &'static str,
    /// Category
    pub category: ParameterCategory,
    /// Lower bound
    pub min: f64,
    /// Upper bound
    pub max: f64,
    /// Step for increment/decrement
    pub increment: f64,
    /// Current value
    pub value: f64,
}

impl Parameter {
    /// Create a parameter; `initial` is clamped into `[min, max]`.
    pub fn new(
        mnemonic: &'static str,
        name: &'static str,
        category: ParameterCategory,
        (min, max, increment): (f64, f64, f64),
        scaling: DeviceScaling,
        initial: f64,
    ) -> Self {
        Self {
            mnemonic,
            name,
            category,
            min,
            max,
            increment,
            scaling,
            value: Observable::new(mnemonic, initial.clamp(min, max)).with_description(name),
        }
    }

    /// Device mnemonic (e.g. `SSPD`).
    pub fn mnemonic(&self) -> &'static str {
        self.mnemonic
    }

    /// Display name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Category tag.
    pub fn category(&self) -> ParameterCategory {
        self.category
    }

    /// Lower bound.
    pub fn min(&self) -> f64 {
        self.min
    }

    /// Upper bound.
    pub fn max(&self) -> f64 {
        self.max
    }

    /// Step used by [`increment`](Self::increment) and [`decrement`](Self::decrement).
    pub fn step(&self) -> f64 {
        self.increment
    }

    /// Wire scaling.
    pub fn scaling(&self) -> DeviceScaling {
        self.scaling
    }

    /// Current value.
    pub fn value(&self) -> f64 {
        self.value.get()
    }

    /// Subscribe to value changes.
    pub fn subscribe(&self) -> watch::Receiver<f64> {
        self.value.subscribe()
    }

    /// Store `value` clamped into `[min, max]`.
    ///
    /// Subscribers are notified only when the clamped value differs from the
    /// stored one; the return value says whether that happened. Non-finite
    /// input is rejected and leaves the value untouched.
    pub fn set(&self, value: f64) -> AppResult<bool> {
        if !value.is_finite() {
            return Err(StageError::Configuration(format!(
                "{}: value {} is not finite",
                self.mnemonic, value
            )));
        }
        Ok(self.value.set_if_changed(value.clamp(self.min, self.max)))
    }

    /// Raise the value by one increment, re-clamped.
    pub fn increment(&self) -> bool {
        self.value
            .set_if_changed((self.value() + self.increment).clamp(self.min, self.max))
    }

    /// Lower the value by one increment, re-clamped.
    pub fn decrement(&self) -> bool {
        self.value
            .set_if_changed((self.value() - self.increment).clamp(self.min, self.max))
    }

    /// Current value converted to the integer the device expects.
    pub fn device_value(&self, resolution: f64) -> AppResult<i64> {
        self.scaling.to_device(self.value(), resolution)
    }

    /// Store a value read back from the device.
    pub fn set_from_device(&self, raw: f64, resolution: f64) -> AppResult<bool> {
        let host = self.scaling.from_device(raw, resolution)?;
        self.set(host)
    }

    /// Snapshot for listings.
    pub fn view(&self) -> ParameterView {
        ParameterView {
            mnemonic: self.mnemonic,
            name: self.name,
            category: self.category,
            min: self.min,
            max: self.max,
            increment: self.increment,
            value: self.value(),
        }
    }
}

/// Ordered collection of parameters, unique by mnemonic.
#[derive(Debug, Clone, Default)]
pub struct ParameterSet {
    params: Vec<Parameter>,
}

impl ParameterSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter. A parameter with the same mnemonic is replaced in place.
    pub fn register(&mut self, param: Parameter) {
        match self
            .params
            .iter_mut()
            .find(|p| p.mnemonic == param.mnemonic)
        {
            Some(existing) => *existing = param,
            None => self.params.push(param),
        }
    }

    /// Look up by mnemonic.
    pub fn get(&self, mnemonic: &str) -> Option<&Parameter> {
        self.params
            .iter()
            .find(|p| p.mnemonic.eq_ignore_ascii_case(mnemonic))
    }

    /// Look up by mnemonic, failing with [`StageError::UnknownParameter`].
    pub fn require(&self, mnemonic: &str) -> AppResult<&Parameter> {
        self.get(mnemonic)
            .ok_or_else(|| StageError::UnknownParameter(mnemonic.to_string()))
    }

    /// Current value of `mnemonic`, if present.
    pub fn value(&self, mnemonic: &str) -> Option<f64> {
        self.get(mnemonic).map(Parameter::value)
    }

    /// Position tolerance in counts (`PTO2`, default 10).
    pub fn pto2(&self) -> f64 {
        self.value("PTO2").unwrap_or(DEFAULT_PTO2)
    }

    /// Iterate in factory order.
    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter()
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Listing snapshot of every parameter.
    pub fn views(&self) -> Vec<ParameterView> {
        self.params.iter().map(Parameter::view).collect()
    }

    /// Build the parameter set for an axis of `family` on a `controller_type`.
    pub fn for_axis(controller_type: ControllerType, family: AxisFamily) -> Self {
        use DeviceScaling as S;
        use ParameterCategory as C;

        let mut set = Self::new();
        let rotary = family.kind() == AxisKind::Rotary;

        // (max speed, default speed, index speed) in mm/s or deg/s
        let (speed_max, speed_default, index_default) = match family {
            AxisFamily::Xls => (400.0, 100.0, 10.0),
            AxisFamily::Xla => (200.0, 50.0, 5.0),
            AxisFamily::Xrt | AxisFamily::Xrta => (1000.0, 180.0, 90.0),
            AxisFamily::Xrt3 => (1500.0, 360.0, 90.0),
        };
        let speed_inc = if rotary { 5.0 } else { 1.0 };

        set.register(Parameter::new(
            "SSPD",
            "Speed",
            C::Motion,
            (0.0, speed_max, speed_inc),
            S::Speed,
            speed_default,
        ));
        set.register(Parameter::new(
            "MSPD",
            "Maximum speed",
            C::Motion,
            (0.0, speed_max, speed_inc),
            S::Speed,
            speed_max,
        ));
        set.register(Parameter::new(
            "ISPD",
            "Index speed",
            C::Motion,
            (0.0, speed_max, speed_inc),
            S::Speed,
            index_default,
        ));
        set.register(Parameter::new(
            "ACCE",
            "Acceleration",
            C::Motion,
            (0.0, 65500.0, 100.0),
            S::None,
            32750.0,
        ));
        set.register(Parameter::new(
            "DECE",
            "Deceleration",
            C::Motion,
            (0.0, 65500.0, 100.0),
            S::None,
            32750.0,
        ));

        // Rotary stages default to an empty window: no soft limits.
        let (limit_bound, limit_inc, low, high) = if rotary {
            (360.0, 1.0, 0.0, 0.0)
        } else {
            (1000.0, 0.1, -50.0, 50.0)
        };
        set.register(Parameter::new(
            "LLIM",
            "Low soft limit",
            C::Limits,
            (-limit_bound, limit_bound, limit_inc),
            S::Distance,
            low,
        ));
        set.register(Parameter::new(
            "HLIM",
            "High soft limit",
            C::Limits,
            (-limit_bound, limit_bound, limit_inc),
            S::Distance,
            high,
        ));

        let (zone_max, zone_inc) = if rotary { (10.0, 0.01) } else { (1.0, 0.001) };
        set.register(Parameter::new(
            "ZON1",
            "Zone 1 size",
            C::Control,
            (0.0, zone_max, zone_inc),
            S::Distance,
            0.01,
        ));
        set.register(Parameter::new(
            "ZON2",
            "Zone 2 size",
            C::Control,
            (0.0, zone_max, zone_inc),
            S::Distance,
            0.1,
        ));
        set.register(Parameter::new(
            "CFRQ",
            "Control frequency",
            C::Control,
            (80_000.0, 185_000.0, 100.0),
            S::Frequency,
            100_000.0,
        ));

        set.register(Parameter::new(
            "PTOL",
            "Position tolerance",
            C::Tolerance,
            (0.0, 1000.0, 1.0),
            S::None,
            2.0,
        ));
        set.register(Parameter::new(
            "PTO2",
            "Position tolerance 2",
            C::Tolerance,
            (0.0, 1000.0, 1.0),
            S::None,
            DEFAULT_PTO2,
        ));
        set.register(Parameter::new(
            "ELIM",
            "Error limit",
            C::Tolerance,
            (0.0, 65535.0, 1.0),
            S::None,
            1000.0,
        ));

        set.register(Parameter::new(
            "POLI",
            "Polling interval",
            C::Communication,
            (1.0, 1000.0, 1.0),
            S::None,
            50.0,
        ));

        if controller_type.supports_mass() {
            set.register(Parameter::new(
                "MASS",
                "Load mass",
                C::Control,
                (0.0, 5000.0, 10.0),
                S::None,
                0.0,
            ));
        }

        set
    }
}
