//! Axis protocol/state core.
//!
//! An [`Axis`] holds the live telemetry of one stage (`EPOS`, `STAT`, `TIME`),
//! the commanded target (`DPOS`) and everything derived from them: decoded
//! status bits, the tolerance-gated position-reached flag, speed, info
//! messages and the plotting buffer.
//!
//! # Data flow
//!
//! ```text
//! caller ──► Axis::set_dpos ──► Controller::send_command ──► "DPOS=n\n"
//!                │
//!                └─ registers PendingArrival (oneshot)
//!
//! receive task ──► TelemetryFrame ──► Axis::apply_frame
//!                                        │ STAT → TIME → EPOS → derived
//!                                        ├─ resolves PendingArrival
//!                                        └─ Dispatcher::post(snapshot)
//! ```
//!
//! # Arrival
//!
//! At most one move request is outstanding per axis. A newer `set_dpos`
//! resolves the previous one with [`StageError::Superseded`], `stop` with
//! [`StageError::Cancelled`], and a request that does not arrive within the
//! configured window fails with [`StageError::Timeout`].

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use stage_core::dispatch::Dispatcher;
use stage_core::error::{AppResult, StageError};
use stage_core::observable::Observable;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::instrument;

use crate::controller::{Controller, ControllerType};
use crate::identify::AxisFamily;
use crate::parameter::ParameterSet;
use crate::status::{info_messages, InfoMessage, StatusFlags};
use crate::telegram::TelemetryFrame;
use crate::units::{self, AxisKind, Unit};

/// Extra suppression added to `POLI` after an encoder reset.
const ENCODER_RESET_MARGIN: Duration = Duration::from_millis(500);

/// Clock used to timestamp telemetry samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeBase {
    /// Device `TIME` ticks, unwrapped. Falls back to the controller clock
    /// until the first `TIME` value arrives.
    #[default]
    DeviceTicks,
    /// Host-side controller clock.
    ControllerClock,
}

/// Unwraps the 16-bit device tick counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceClock {
    last: Option<u16>,
    offset: i64,
}

impl DeviceClock {
    /// Feed a raw `TIME` value and return the unwrapped tick count.
    ///
    /// Every decrease of the raw value is one wrap and adds 65536.
    pub fn update(&mut self, raw: u16) -> i64 {
        if self.last.is_some_and(|last| raw < last) {
            self.offset += 1 << 16;
        }
        self.last = Some(raw);
        self.offset + i64::from(raw)
    }

    /// Unwrapped ticks of the last update.
    pub fn ticks(&self) -> Option<i64> {
        self.last.map(|raw| self.offset + i64::from(raw))
    }

    /// Accumulated wrap offset.
    pub fn offset(&self) -> i64 {
        self.offset
    }
}

/// Whether `epos` lies within `pto2 + 1` counts of `dpos`.
///
/// For rotary axes the targets one revolution above and below are also
/// considered and the smallest distance wins. Distances are taken in `i128`
/// so any pair of reported positions compares without overflow.
pub fn within_tolerance(epos: i64, dpos: i64, pto2: f64, full_revolution: Option<i64>) -> bool {
    let delta = i128::from(epos) - i128::from(dpos);
    let mut diff = delta.abs();
    if let Some(rev) = full_revolution.map(i128::from) {
        diff = diff.min((delta - rev).abs()).min((delta + rev).abs());
    }
    diff as f64 <= pto2 + 1.0
}

/// Identity and geometry of the stage on an axis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AxisModel {
    /// Device model key, e.g. `XLS1`
    pub model: String,
    /// Family derived from the model
    pub family: AxisFamily,
    /// Linear or rotary
    pub kind: AxisKind,
    /// nm/count (linear) or µrad/count (rotary)
    pub resolution: f64,
    /// Counts per revolution; 0 for linear axes
    pub counts_per_revolution: i64,
}

impl AxisModel {
    /// Resolve a model string and resolution.
    ///
    /// `counts_per_revolution` overrides the value derived from the
    /// resolution on rotary axes.
    pub fn new(model: &str, resolution: f64, counts_per_revolution: Option<i64>) -> AppResult<Self> {
        let family = AxisFamily::from_model(model)?;
        if !(resolution.is_finite() && resolution > 0.0) {
            return Err(StageError::InvalidResolution(resolution));
        }
        let kind = family.kind();
        let counts_per_revolution = match (kind, counts_per_revolution) {
            (AxisKind::Linear, _) => 0,
            (AxisKind::Rotary, Some(c)) if c > 0 => c,
            (AxisKind::Rotary, Some(c)) => {
                return Err(StageError::Configuration(format!(
                    "{}: counts_per_revolution must be positive, got {}",
                    model, c
                )))
            }
            (AxisKind::Rotary, None) => units::counts_per_revolution(resolution)?,
        };
        Ok(Self {
            model: model.to_string(),
            family,
            kind,
            resolution,
            counts_per_revolution,
        })
    }

    /// Full revolution in counts for rotary axes.
    pub fn full_revolution(&self) -> Option<i64> {
        (self.kind == AxisKind::Rotary && self.counts_per_revolution > 0)
            .then_some(self.counts_per_revolution)
    }
}

/// Host-side behaviour of an axis that does not come from the device.
#[derive(Debug, Clone)]
pub struct AxisSettings {
    /// Unit used for the slider value and plot samples
    pub display_unit: Unit,
    /// Step used by `step_negative` / `step_positive`
    pub step_size: f64,
    /// Unit of `step_size`
    pub step_unit: Unit,
    /// Seconds per device `TIME` tick
    pub tick_seconds: f64,
    /// Maximum number of buffered plot samples
    pub plot_capacity: usize,
    /// Maximum wait for a move to arrive
    pub arrival_timeout: Duration,
    /// Initial time base
    pub time_base: TimeBase,
    /// Start a logging session on every `set_dpos`
    pub auto_logging: bool,
}

impl AxisSettings {
    /// Defaults for an axis of `kind`.
    pub fn for_kind(kind: AxisKind) -> Self {
        Self {
            display_unit: kind.base_unit(),
            step_size: 1.0,
            step_unit: kind.base_unit(),
            tick_seconds: 0.001,
            plot_capacity: 10_000,
            arrival_timeout: Duration::from_secs(30),
            time_base: TimeBase::DeviceTicks,
            auto_logging: false,
        }
    }
}

/// One point of the position plot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PlotSample {
    /// Seconds since the logging session started
    pub seconds: f64,
    /// Position in the display unit
    pub position: f64,
}

/// Outcome of a completed move request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrivalReport {
    /// Target in counts, after normalisation and clamping
    pub target: i64,
    /// Time from command to observed arrival (zero if already there)
    pub delay: Duration,
}

/// Consistent view of an axis, published after every telemetry frame.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct AxisSnapshot {
    /// Axis letter
    pub letter: Option<char>,
    /// Encoder position (counts)
    pub epos: i64,
    /// Commanded position (counts)
    pub dpos: i64,
    /// Raw status word
    pub stat: u32,
    /// Decoded status word
    pub flags: StatusFlags,
    /// Status bit gated by the tolerance check
    pub position_reached: bool,
    /// Speed in mm/s or deg/s, never negative
    pub speed: f64,
    /// Highest speed since the last reset
    pub max_speed: f64,
    /// DPOS in the display unit
    pub slider: f64,
    /// Unwrapped device ticks
    pub time_ticks: Option<i64>,
    /// Active fault messages
    pub info: Vec<InfoMessage>,
    /// Whether plot samples are being recorded
    pub logging: bool,
    /// Whether a move request is outstanding
    pub awaiting_arrival: bool,
    /// Delay of the last completed move request
    pub command_to_position_reached_delay: Option<Duration>,
}

struct PendingArrival {
    id: u64,
    target: i64,
    issued_at: Instant,
    tx: oneshot::Sender<AppResult<Duration>>,
}

impl PendingArrival {
    fn fail(self, error: StageError) {
        // Receiver may have given up already
        let _ = self.tx.send(Err(error));
    }
}

struct AxisState {
    epos: i64,
    dpos: i64,
    stat: u32,
    flags: StatusFlags,
    position_reached: bool,
    clock: DeviceClock,
    last_sample: Option<(i64, f64)>,
    speed: f64,
    max_speed: f64,
    slider: f64,
    info: Vec<InfoMessage>,
    suppressed_until: Option<Instant>,
    pending: Option<PendingArrival>,
    last_delay: Option<Duration>,
    time_base: TimeBase,
    logging: bool,
    auto_logging: bool,
    auto_session: bool,
    log_origin: Option<f64>,
    plot: VecDeque<PlotSample>,
    epos_bounds: Option<(i64, i64)>,
}

impl AxisState {
    fn new(settings: &AxisSettings) -> Self {
        Self {
            epos: 0,
            dpos: 0,
            stat: 0,
            flags: StatusFlags::default(),
            position_reached: false,
            clock: DeviceClock::default(),
            last_sample: None,
            speed: 0.0,
            max_speed: 0.0,
            slider: 0.0,
            info: Vec::new(),
            suppressed_until: None,
            pending: None,
            last_delay: None,
            time_base: settings.time_base,
            logging: false,
            auto_logging: settings.auto_logging,
            auto_session: false,
            log_origin: None,
            plot: VecDeque::new(),
            epos_bounds: None,
        }
    }

    fn start_session(&mut self, auto: bool) {
        self.logging = true;
        self.auto_session = auto;
        self.log_origin = None;
        self.plot.clear();
        self.epos_bounds = None;
    }
}

/// Values an axis needs from its model and parameters while holding its
/// state lock.
#[derive(Clone, Copy)]
struct Geometry {
    kind: AxisKind,
    resolution: f64,
    full_revolution: Option<i64>,
    pto2: f64,
}

/// One stage on a controller.
pub struct Axis {
    controller: Weak<Controller>,
    index: usize,
    letter: Option<char>,
    controller_type: ControllerType,
    model: RwLock<AxisModel>,
    parameters: RwLock<Arc<ParameterSet>>,
    settings: AxisSettings,
    display_unit: RwLock<Unit>,
    state: Mutex<AxisState>,
    snapshot: Observable<AxisSnapshot>,
    dispatcher: Arc<dyn Dispatcher>,
    next_request: AtomicU64,
}

impl std::fmt::Debug for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Axis")
            .field("index", &self.index)
            .field("letter", &self.letter)
            .field("model", &*self.model.read())
            .finish_non_exhaustive()
    }
}

impl Axis {
    pub(crate) fn new(
        controller: Weak<Controller>,
        index: usize,
        letter: Option<char>,
        controller_type: ControllerType,
        model: AxisModel,
        settings: AxisSettings,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        let parameters = Arc::new(ParameterSet::for_axis(controller_type, model.family));
        let state = AxisState::new(&settings);
        let label = letter.map_or_else(|| "axis".to_string(), |l| format!("axis {}", l));
        Self {
            controller,
            index,
            letter,
            controller_type,
            model: RwLock::new(model),
            parameters: RwLock::new(parameters),
            display_unit: RwLock::new(settings.display_unit),
            settings,
            state: Mutex::new(state),
            snapshot: Observable::new(
                label,
                AxisSnapshot {
                    letter,
                    ..Default::default()
                },
            ),
            dispatcher,
            next_request: AtomicU64::new(1),
        }
    }

    // =========================================================================
    // Identity
    // =========================================================================

    /// Position of this axis on its controller.
    pub fn axis_index(&self) -> usize {
        self.index
    }

    /// Axis letter used as command prefix; `None` on single-axis controllers.
    pub fn letter(&self) -> Option<char> {
        self.letter
    }

    /// Current stage model.
    pub fn model(&self) -> AxisModel {
        self.model.read().clone()
    }

    /// Linear or rotary.
    pub fn kind(&self) -> AxisKind {
        self.model.read().kind
    }

    /// nm/count or µrad/count.
    pub fn resolution(&self) -> f64 {
        self.model.read().resolution
    }

    /// Parameter set of the current model.
    pub fn parameters(&self) -> Arc<ParameterSet> {
        self.parameters.read().clone()
    }

    /// Unit used for the slider value and plot samples.
    pub fn display_unit(&self) -> Unit {
        *self.display_unit.read()
    }

    /// Change the display unit.
    pub fn set_display_unit(&self, unit: Unit) -> AppResult<()> {
        unit.check_kind(self.kind())?;
        *self.display_unit.write() = unit;
        let snap = {
            let mut st = self.state.lock();
            st.slider = self.to_display(st.dpos);
            self.snapshot_of(&st)
        };
        self.publish(snap);
        Ok(())
    }

    /// Replace the stage model and rebuild the parameter set.
    #[instrument(skip(self), fields(axis = ?self.letter), err)]
    pub fn set_model(
        &self,
        model: &str,
        resolution: f64,
        counts_per_revolution: Option<i64>,
    ) -> AppResult<()> {
        let new_model = AxisModel::new(model, resolution, counts_per_revolution)?;
        if self.display_unit().check_kind(new_model.kind).is_err() {
            *self.display_unit.write() = new_model.kind.base_unit();
        }
        let params = Arc::new(ParameterSet::for_axis(self.controller_type, new_model.family));
        tracing::info!(model = %new_model.model, family = %new_model.family, "axis model changed");
        *self.model.write() = new_model;
        *self.parameters.write() = params;
        Ok(())
    }

    // =========================================================================
    // Observation
    // =========================================================================

    /// Subscribe to published snapshots.
    pub fn subscribe(&self) -> watch::Receiver<AxisSnapshot> {
        self.snapshot.subscribe()
    }

    /// Last published snapshot.
    pub fn snapshot(&self) -> AxisSnapshot {
        self.snapshot.get()
    }

    /// Live encoder position.
    pub fn epos(&self) -> i64 {
        self.state.lock().epos
    }

    /// Commanded position.
    pub fn dpos(&self) -> i64 {
        self.state.lock().dpos
    }

    /// Decoded status word.
    pub fn flags(&self) -> StatusFlags {
        self.state.lock().flags
    }

    /// Position-reached bit gated by tolerance against DPOS.
    pub fn position_reached(&self) -> bool {
        self.state.lock().position_reached
    }

    /// Speed in mm/s or deg/s.
    pub fn speed(&self) -> f64 {
        self.state.lock().speed
    }

    /// Highest speed since the last reset, in mm/s or deg/s.
    pub fn max_speed(&self) -> f64 {
        self.state.lock().max_speed
    }

    /// Speed expressed in `unit` per second.
    pub fn speed_in(&self, unit: Unit) -> AppResult<f64> {
        self.rate_in(self.speed(), unit)
    }

    /// Max speed expressed in `unit` per second.
    pub fn max_speed_in(&self, unit: Unit) -> AppResult<f64> {
        self.rate_in(self.max_speed(), unit)
    }

    fn rate_in(&self, value: f64, unit: Unit) -> AppResult<f64> {
        let model = self.model();
        unit.check_kind(model.kind)?;
        units::rate_from_base(value, model.kind, unit, model.resolution)
    }

    /// Reset the max-speed high-water mark.
    pub fn reset_max_speed(&self) {
        let snap = {
            let mut st = self.state.lock();
            st.max_speed = 0.0;
            self.snapshot_of(&st)
        };
        self.publish(snap);
    }

    /// Active info-bar messages.
    pub fn info_messages(&self) -> Vec<InfoMessage> {
        self.state.lock().info.clone()
    }

    /// Unwrapped device ticks.
    pub fn time_ticks(&self) -> Option<i64> {
        self.state.lock().clock.ticks()
    }

    /// Whether a move request is outstanding.
    pub fn is_awaiting_arrival(&self) -> bool {
        self.state.lock().pending.is_some()
    }

    // =========================================================================
    // Telemetry
    // =========================================================================

    fn geometry(&self) -> Geometry {
        let model = self.model.read();
        Geometry {
            kind: model.kind,
            resolution: model.resolution,
            full_revolution: model.full_revolution(),
            pto2: self.parameters.read().pto2(),
        }
    }

    fn to_display(&self, counts: i64) -> f64 {
        let model = self.model.read();
        units::from_encoder(counts as f64, self.display_unit(), model.resolution).unwrap_or_default()
    }

    /// Apply one telemetry frame atomically and publish one snapshot.
    ///
    /// Fields are applied in the order STAT, TIME, EPOS, then derived state
    /// is recomputed. `controller_secs` is the controller clock at receipt.
    pub fn apply_frame(&self, frame: &TelemetryFrame, controller_secs: f64) {
        let geo = self.geometry();
        let display_unit = self.display_unit();
        let now = Instant::now();

        let snap = {
            let mut st = self.state.lock();

            if let Some(stat) = frame.stat {
                let mut flags = StatusFlags::decode(stat);
                if st.suppressed_until.is_some_and(|until| now < until) {
                    flags.encoder_error = st.flags.encoder_error;
                } else {
                    st.suppressed_until = None;
                }
                st.stat = stat;
                st.flags = flags;
                st.info = info_messages(&flags);
            }

            if let Some(time) = frame.time {
                st.clock.update(time);
            }

            if let Some(epos) = frame.epos {
                st.epos = epos;
                st.epos_bounds = Some(match st.epos_bounds {
                    Some((lo, hi)) => (lo.min(epos), hi.max(epos)),
                    None => (epos, epos),
                });

                let secs = match (st.time_base, st.clock.ticks()) {
                    (TimeBase::DeviceTicks, Some(ticks)) => ticks as f64 * self.settings.tick_seconds,
                    _ => controller_secs,
                };
                Self::update_speed(&mut st, epos, secs, &geo);

                if st.logging {
                    let origin = *st.log_origin.get_or_insert(secs);
                    let position = units::from_encoder(epos as f64, display_unit, geo.resolution)
                        .unwrap_or_default();
                    if st.plot.len() >= self.settings.plot_capacity {
                        st.plot.pop_front();
                    }
                    st.plot.push_back(PlotSample {
                        seconds: secs - origin,
                        position,
                    });
                }
            }

            st.position_reached = st.flags.position_reached
                && within_tolerance(st.epos, st.dpos, geo.pto2, geo.full_revolution);

            if st.position_reached {
                if let Some(pending) = st.pending.take() {
                    let delay = now.saturating_duration_since(pending.issued_at);
                    tracing::debug!(axis = ?self.letter, target = pending.target, ?delay, "position reached");
                    st.last_delay = Some(delay);
                    let _ = pending.tx.send(Ok(delay));
                    if st.auto_session {
                        st.logging = false;
                        st.auto_session = false;
                    }
                }
            }

            self.snapshot_of(&st)
        };
        self.publish(snap);
    }

    fn update_speed(st: &mut AxisState, epos: i64, secs: f64, geo: &Geometry) {
        if !st.flags.motor_on {
            st.speed = 0.0;
            st.last_sample = Some((epos, secs));
            return;
        }
        let Some((prev_epos, prev_secs)) = st.last_sample else {
            st.last_sample = Some((epos, secs));
            return;
        };
        let elapsed = secs - prev_secs;
        if elapsed <= f64::EPSILON {
            return;
        }
        let mut delta = i128::from(epos) - i128::from(prev_epos);
        if let Some(rev) = geo.full_revolution.map(i128::from) {
            if delta > rev / 2 {
                delta -= rev;
            } else if delta < -rev / 2 {
                delta += rev;
            }
        }
        let distance = units::from_encoder(delta as f64, geo.kind.base_unit(), geo.resolution)
            .unwrap_or_default();
        st.speed = (distance / elapsed).abs();
        if st.speed > st.max_speed {
            st.max_speed = st.speed;
        }
        st.last_sample = Some((epos, secs));
    }

    fn snapshot_of(&self, st: &AxisState) -> AxisSnapshot {
        AxisSnapshot {
            letter: self.letter,
            epos: st.epos,
            dpos: st.dpos,
            stat: st.stat,
            flags: st.flags,
            position_reached: st.position_reached,
            speed: st.speed,
            max_speed: st.max_speed,
            slider: st.slider,
            time_ticks: st.clock.ticks(),
            info: st.info.clone(),
            logging: st.logging,
            awaiting_arrival: st.pending.is_some(),
            command_to_position_reached_delay: st.last_delay,
        }
    }

    fn publish(&self, snap: AxisSnapshot) {
        let observable = self.snapshot.clone();
        self.dispatcher.post(Box::new(move || observable.set(snap)));
    }

    /// Fail an outstanding move request with [`StageError::Cancelled`].
    pub(crate) fn cancel_pending(&self) {
        let pending = self.state.lock().pending.take();
        if let Some(p) = pending {
            let target = p.target;
            p.fail(StageError::Cancelled { target });
        }
    }

    // =========================================================================
    // Logging
    // =========================================================================

    /// Start a manual logging session (clears the plot buffer and bounds).
    pub fn start_logging(&self) {
        let snap = {
            let mut st = self.state.lock();
            st.start_session(false);
            self.snapshot_of(&st)
        };
        self.publish(snap);
    }

    /// Stop recording plot samples.
    pub fn stop_logging(&self) {
        let snap = {
            let mut st = self.state.lock();
            st.logging = false;
            st.auto_session = false;
            self.snapshot_of(&st)
        };
        self.publish(snap);
    }

    /// Whether plot samples are being recorded.
    pub fn is_logging(&self) -> bool {
        self.state.lock().logging
    }

    /// Start a logging session on every `set_dpos` and stop it on arrival.
    pub fn set_auto_logging(&self, enabled: bool) {
        self.state.lock().auto_logging = enabled;
    }

    /// Select the clock used for speed and plot timestamps.
    pub fn set_time_base(&self, time_base: TimeBase) {
        let mut st = self.state.lock();
        if st.time_base != time_base {
            st.time_base = time_base;
            st.last_sample = None;
        }
    }

    /// Currently selected time base.
    pub fn time_base(&self) -> TimeBase {
        self.state.lock().time_base
    }

    /// Take every buffered plot sample.
    pub fn drain_plot_samples(&self) -> Vec<PlotSample> {
        self.state.lock().plot.drain(..).collect()
    }

    /// Lowest and highest EPOS seen in the current session.
    pub fn position_bounds(&self) -> Option<(i64, i64)> {
        self.state.lock().epos_bounds
    }

    // =========================================================================
    // Motion
    // =========================================================================

    fn controller(&self) -> AppResult<Arc<Controller>> {
        self.controller
            .upgrade()
            .ok_or_else(|| StageError::NotConnected("controller dropped".into()))
    }

    async fn send(&self, text: &str) -> AppResult<()> {
        self.controller()?.send_command(text, self.letter).await
    }

    /// Soft-limit window in counts, if non-empty.
    pub fn limit_window(&self) -> Option<(i64, i64)> {
        let params = self.parameters();
        let model = self.model.read();
        let llim = params.get("LLIM")?.device_value(model.resolution).ok()?;
        let hlim = params.get("HLIM")?.device_value(model.resolution).ok()?;
        (hlim > llim).then_some((llim, hlim))
    }

    /// Normalise (rotary) and clamp a requested target.
    pub fn prepare_target(&self, value: i64) -> i64 {
        let mut target = value;
        if let Some(rev) = self.model.read().full_revolution() {
            target = target.rem_euclid(rev);
        }
        if let Some((llim, hlim)) = self.limit_window() {
            target = target.clamp(llim, hlim);
        }
        target
    }

    /// Move to `value` (counts) and wait for arrival.
    ///
    /// The target is normalised into one revolution on rotary axes and
    /// clamped to the soft-limit window, then sent as `DPOS=<target>`.
    /// Resolves immediately when the axis is already within tolerance.
    #[instrument(skip(self), fields(axis = ?self.letter), err)]
    pub async fn set_dpos(&self, value: i64) -> AppResult<ArrivalReport> {
        let controller = self.controller()?;
        let target = self.prepare_target(value);
        if target != value {
            tracing::debug!(requested = value, target, "target adjusted");
        }
        let geo = self.geometry();
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let (immediate, snap) = {
            let mut st = self.state.lock();
            st.dpos = target;
            st.slider = self.to_display(target);
            if let Some(old) = st.pending.take() {
                let old_target = old.target;
                old.fail(StageError::Superseded { target: old_target });
            }
            let immediate = within_tolerance(st.epos, target, geo.pto2, geo.full_revolution);
            st.position_reached = immediate && st.flags.position_reached;
            if immediate {
                st.last_delay = Some(Duration::ZERO);
                // Nothing to wait for, so no auto session either
                if st.auto_session {
                    st.logging = false;
                    st.auto_session = false;
                }
            } else {
                if st.auto_logging {
                    st.start_session(true);
                }
                st.pending = Some(PendingArrival {
                    id,
                    target,
                    issued_at: Instant::now(),
                    tx,
                });
            }
            (immediate, self.snapshot_of(&st))
        };
        self.publish(snap);

        if let Err(e) = controller
            .send_command(&format!("DPOS={}", target), self.letter)
            .await
        {
            self.drop_pending(id);
            return Err(e);
        }

        if immediate {
            return Ok(ArrivalReport {
                target,
                delay: Duration::ZERO,
            });
        }

        match tokio::time::timeout(self.settings.arrival_timeout, rx).await {
            Ok(Ok(result)) => result.map(|delay| ArrivalReport { target, delay }),
            Ok(Err(_)) => Err(StageError::Cancelled { target }),
            Err(_) => {
                self.drop_pending(id);
                Err(StageError::Timeout(format!(
                    "axis did not reach {} within {:?}",
                    target, self.settings.arrival_timeout
                )))
            }
        }
    }

    fn drop_pending(&self, id: u64) {
        let mut st = self.state.lock();
        if st.pending.as_ref().is_some_and(|p| p.id == id) {
            st.pending = None;
        }
    }

    /// Step by `step` in `unit` from DPOS when it was reached, else from EPOS.
    #[instrument(skip(self), fields(axis = ?self.letter), err)]
    pub async fn take_step(&self, step: f64, unit: Unit) -> AppResult<ArrivalReport> {
        let counts = units::to_encoder(step, unit, self.resolution())?.round();
        if !counts.is_finite() {
            return Err(StageError::Configuration(format!(
                "step of {} {} is not a finite distance",
                step, unit
            )));
        }
        // Saturating float cast, then saturating add
        let counts = counts as i64;
        let geo = self.geometry();
        let base = {
            let st = self.state.lock();
            if within_tolerance(st.epos, st.dpos, geo.pto2, geo.full_revolution) {
                st.dpos
            } else {
                st.epos
            }
        };
        self.set_dpos(base.saturating_add(counts)).await
    }

    /// Step backwards by the configured step.
    pub async fn step_negative(&self) -> AppResult<ArrivalReport> {
        self.take_step(-self.settings.step_size, self.settings.step_unit)
            .await
    }

    /// Step forwards by the configured step.
    pub async fn step_positive(&self) -> AppResult<ArrivalReport> {
        self.take_step(self.settings.step_size, self.settings.step_unit)
            .await
    }

    /// Move to position 0.
    pub async fn home(&self) -> AppResult<ArrivalReport> {
        self.set_dpos(0).await
    }

    fn snap_slider(&self, towards_high: bool) {
        let Some((llim, hlim)) = self.limit_window() else {
            return;
        };
        let edge = if towards_high { hlim } else { llim };
        let snap = {
            let mut st = self.state.lock();
            st.slider = self.to_display(edge);
            self.snapshot_of(&st)
        };
        self.publish(snap);
    }

    /// Run towards the low end (`MOVE=-1`).
    #[instrument(skip(self), fields(axis = ?self.letter), err)]
    pub async fn move_negative(&self) -> AppResult<()> {
        self.send("MOVE=-1").await?;
        self.snap_slider(false);
        Ok(())
    }

    /// Run towards the high end (`MOVE=1`).
    #[instrument(skip(self), fields(axis = ?self.letter), err)]
    pub async fn move_positive(&self) -> AppResult<()> {
        self.send("MOVE=1").await?;
        self.snap_slider(true);
        Ok(())
    }

    /// Scan towards the low end (`SCAN=-1`).
    #[instrument(skip(self), fields(axis = ?self.letter), err)]
    pub async fn scan_negative(&self) -> AppResult<()> {
        self.send("SCAN=-1").await?;
        self.snap_slider(false);
        Ok(())
    }

    /// Scan towards the high end (`SCAN=1`).
    #[instrument(skip(self), fields(axis = ?self.letter), err)]
    pub async fn scan_positive(&self) -> AppResult<()> {
        self.send("SCAN=1").await?;
        self.snap_slider(true);
        Ok(())
    }

    /// Stop motion, reset max speed and cancel any outstanding move request.
    #[instrument(skip(self), fields(axis = ?self.letter), err)]
    pub async fn stop(&self) -> AppResult<()> {
        self.cancel_pending();
        let snap = {
            let mut st = self.state.lock();
            st.max_speed = 0.0;
            self.snapshot_of(&st)
        };
        self.publish(snap);
        self.send("STOP").await
    }

    /// Search the encoder index (`INDX=0`).
    #[instrument(skip(self), fields(axis = ?self.letter), err)]
    pub async fn index(&self) -> AppResult<()> {
        self.send("INDX=0").await
    }

    /// Search the index in negative direction (`INDX=0`).
    pub async fn index_minus(&self) -> AppResult<()> {
        self.index().await
    }

    /// Search the index in positive direction (`INDX=1`).
    #[instrument(skip(self), fields(axis = ?self.letter), err)]
    pub async fn index_plus(&self) -> AppResult<()> {
        self.send("INDX=1").await
    }

    /// Reset the encoder (`ENCR`).
    ///
    /// Encoder-error changes are ignored for `POLI + 500` ms afterwards, while
    /// the device re-homes its encoder.
    #[instrument(skip(self), fields(axis = ?self.letter), err)]
    pub async fn reset_encoder(&self) -> AppResult<()> {
        let poli = self.parameters().value("POLI").unwrap_or(0.0).max(0.0);
        let window = Duration::from_millis(poli.round() as u64) + ENCODER_RESET_MARGIN;
        self.state.lock().suppressed_until = Some(Instant::now() + window);
        self.send("ENCR").await
    }

    /// Reset the axis (`RSET`).
    pub async fn reset(&self) -> AppResult<()> {
        self.controller()?.reset(self).await
    }

    /// Persist the device settings (`SAVE`).
    pub async fn save_settings(&self) -> AppResult<()> {
        self.controller()?.save_settings(self).await
    }

    // =========================================================================
    // Parameters
    // =========================================================================

    /// Set a parameter locally (clamped) and push it to the device if it
    /// changed.
    ///
    /// Runs under the controller's parameter gate so it never interleaves
    /// with a parameter sync. The local value is kept even if sending fails.
    #[instrument(skip(self), fields(axis = ?self.letter), err)]
    pub async fn set_parameter(&self, mnemonic: &str, value: f64) -> AppResult<bool> {
        self.edit_parameter(mnemonic, |p| p.set(value)).await
    }

    /// Raise a parameter by its increment and push it.
    pub async fn increment_parameter(&self, mnemonic: &str) -> AppResult<bool> {
        self.edit_parameter(mnemonic, |p| Ok(p.increment())).await
    }

    /// Lower a parameter by its increment and push it.
    pub async fn decrement_parameter(&self, mnemonic: &str) -> AppResult<bool> {
        self.edit_parameter(mnemonic, |p| Ok(p.decrement())).await
    }

    async fn edit_parameter<F>(&self, mnemonic: &str, edit: F) -> AppResult<bool>
    where
        F: FnOnce(&crate::parameter::Parameter) -> AppResult<bool>,
    {
        let controller = self.controller()?;
        let _gate = controller.sync_gate.lock().await;
        let params = self.parameters();
        let changed = edit(params.require(mnemonic)?)?;
        if changed {
            controller.send_setting(self, mnemonic).await?;
        }
        Ok(changed)
    }
}
