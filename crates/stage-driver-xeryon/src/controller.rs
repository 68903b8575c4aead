//! Controller lifecycle, command channel and parameter sync.
//!
//! A [`Controller`] owns one serial link and the axes behind it. While open,
//! a receive task reads the telemetry stream, splits it into telegram tokens,
//! routes them through the [`DispatchTable`] and applies one
//! [`TelemetryFrame`](crate::telegram::TelemetryFrame) per axis.
//!
//! Parameter sync needs request/response exchanges on the same stream, so it
//! suspends the receive task, takes the reader back and talks through a
//! [`QueryLink`]. Telemetry is switched off (`INFO=0`) for the duration and
//! restored to the configured mode afterwards.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use stage_core::dispatch::{self, Dispatcher};
use stage_core::error::{AppResult, StageError};
use stage_core::observable::Observable;
use stage_core::serial::{split_port, PortOpener, SerialOpener, SerialReader, SerialWriter};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::instrument;

use crate::axis::{Axis, AxisModel, AxisSettings, TimeBase};
use crate::query::{frame_command, QueryLink};
use crate::telegram::{group_frames, DispatchTable, TelegramParser};
use crate::units::Unit;

/// Telemetry modes the firmware accepts for `INFO=`.
pub const INFO_MODES: [u8; 4] = [0, 1, 4, 7];

/// Quiet window used to flush stale telemetry before a parameter sync.
const SYNC_DRAIN_WINDOW: Duration = Duration::from_millis(50);

/// Pause after a failed read before polling the port again.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Hardware variant of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerType {
    /// Not probed yet
    #[default]
    Unknown,
    /// OEM single-axis board
    Oem,
    /// Compact single-axis controller
    C,
    /// Multi-axis controller (up to 6 axes)
    M,
    /// 19" rack controller (up to 18 axes)
    Rack19,
}

impl ControllerType {
    /// Allowed number of axes.
    pub fn axis_bounds(self) -> std::ops::RangeInclusive<usize> {
        match self {
            ControllerType::Unknown | ControllerType::Oem | ControllerType::C => 1..=1,
            ControllerType::M => 1..=6,
            ControllerType::Rack19 => 1..=18,
        }
    }

    /// Whether the firmware knows the `MASS` setting.
    pub fn supports_mass(self) -> bool {
        matches!(self, ControllerType::C | ControllerType::M | ControllerType::Rack19)
    }

    /// Whether commands carry an axis letter prefix.
    pub fn is_multi_axis(self) -> bool {
        matches!(self, ControllerType::M | ControllerType::Rack19)
    }

    /// Derive the variant from the `AXES` and `SOFT` replies of a probe.
    pub fn from_probe(axes: Option<u32>, firmware: Option<&str>) -> Self {
        match axes {
            None | Some(0) => ControllerType::Unknown,
            Some(1) => {
                if firmware.is_some_and(|s| s.to_ascii_uppercase().contains("OEM")) {
                    ControllerType::Oem
                } else {
                    ControllerType::C
                }
            }
            Some(2..=6) => ControllerType::M,
            Some(_) => ControllerType::Rack19,
        }
    }
}

impl std::fmt::Display for ControllerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ControllerType::Unknown => "unknown",
            ControllerType::Oem => "oem",
            ControllerType::C => "c",
            ControllerType::M => "m",
            ControllerType::Rack19 => "rack19",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Telemetry settings of a controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// `INFO=` mode restored after every sync (0, 1, 4 or 7)
    pub info_mode: u8,
    /// Clock used for speed and plot timestamps
    pub time_base: TimeBase,
    /// Seconds per device `TIME` tick
    pub tick_seconds: f64,
    /// Plot buffer capacity per axis
    pub plot_capacity: usize,
    /// Start a logging session on every move
    pub auto_logging: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            info_mode: 4,
            time_base: TimeBase::DeviceTicks,
            tick_seconds: 0.001,
            plot_capacity: 10_000,
            auto_logging: false,
        }
    }
}

/// One axis entry of a controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxisConfig {
    /// Axis letter; required on multi-axis controllers
    #[serde(default)]
    pub letter: Option<char>,
    /// Stage model, e.g. `XLS1`
    pub model: String,
    /// nm/count (linear) or µrad/count (rotary), already corrected
    pub resolution: f64,
    /// Override for the counts per revolution of rotary stages
    #[serde(default)]
    pub counts_per_revolution: Option<i64>,
    /// Display unit (defaults to mm or deg)
    #[serde(default)]
    pub display_unit: Option<Unit>,
    /// Step used by the step commands
    #[serde(default = "default_step_size")]
    pub step_size: f64,
    /// Unit of `step_size` (defaults to the display unit)
    #[serde(default)]
    pub step_unit: Option<Unit>,
}

/// Configuration of one controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Unique name, used as registry key
    pub name: String,
    /// Optional label for display
    #[serde(default)]
    pub friendly_name: Option<String>,
    /// Serial port path
    pub port: String,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Bound on one query during parameter sync, in milliseconds
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Hardware variant
    #[serde(default)]
    pub controller_type: ControllerType,
    /// Bound on one move request, in milliseconds
    #[serde(default = "default_arrival_timeout_ms")]
    pub arrival_timeout_ms: u64,
    /// Run a parameter sync right after opening
    #[serde(default = "default_load_parameters")]
    pub load_parameters_on_open: bool,
    /// Telemetry settings
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// Axes in controller order
    pub axes: Vec<AxisConfig>,
}

fn default_step_size() -> f64 {
    1.0
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_read_timeout_ms() -> u64 {
    1000
}

fn default_arrival_timeout_ms() -> u64 {
    30_000
}

fn default_load_parameters() -> bool {
    true
}

impl ControllerConfig {
    /// Whether commands for these axes carry a letter prefix.
    pub fn uses_letters(&self) -> bool {
        self.controller_type.is_multi_axis() || self.axes.len() > 1
    }

    /// Check the configuration before any hardware is touched.
    pub fn validate(&self) -> AppResult<()> {
        let fail = |msg: String| Err(StageError::Configuration(format!("{}: {}", self.name, msg)));

        if self.name.trim().is_empty() {
            return Err(StageError::Configuration("controller name is empty".into()));
        }
        if self.port.trim().is_empty() {
            return fail("port is empty".into());
        }
        let bounds = self.controller_type.axis_bounds();
        if !bounds.contains(&self.axes.len()) {
            return fail(format!(
                "{} axes configured, a {} controller supports {}..={}",
                self.axes.len(),
                self.controller_type,
                bounds.start(),
                bounds.end()
            ));
        }
        if !INFO_MODES.contains(&self.telemetry.info_mode) {
            return fail(format!("INFO mode {} is not one of {:?}", self.telemetry.info_mode, INFO_MODES));
        }
        if !(self.telemetry.tick_seconds.is_finite() && self.telemetry.tick_seconds > 0.0) {
            return fail("tick_seconds must be positive".into());
        }

        let mut seen = Vec::new();
        for axis in &self.axes {
            if self.uses_letters() {
                let Some(letter) = axis.letter.map(|c| c.to_ascii_uppercase()) else {
                    return fail(format!("axis {} needs a letter", axis.model));
                };
                if !letter.is_ascii_alphabetic() {
                    return fail(format!("axis letter '{}' is not a letter", letter));
                }
                if seen.contains(&letter) {
                    return fail(format!("axis letter '{}' used twice", letter));
                }
                seen.push(letter);
            }
            let model = AxisModel::new(&axis.model, axis.resolution, axis.counts_per_revolution)?;
            for unit in [axis.display_unit, axis.step_unit].into_iter().flatten() {
                unit.check_kind(model.kind)?;
            }
            if !axis.step_size.is_finite() {
                return fail(format!("axis {} step size is not finite", axis.model));
            }
        }
        Ok(())
    }

    fn axis_settings(&self, axis: &AxisConfig, model: &AxisModel) -> AxisSettings {
        let display_unit = axis.display_unit.unwrap_or(model.kind.base_unit());
        AxisSettings {
            display_unit,
            step_size: axis.step_size,
            step_unit: axis.step_unit.unwrap_or(display_unit),
            tick_seconds: self.telemetry.tick_seconds,
            plot_capacity: self.telemetry.plot_capacity.max(1),
            arrival_timeout: Duration::from_millis(self.arrival_timeout_ms),
            time_base: self.telemetry.time_base,
            auto_logging: self.telemetry.auto_logging,
        }
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Outcome of a parameter sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Parameters updated from the device
    pub loaded: usize,
    /// `[A:]MNEMONIC` of every parameter left at its previous value
    pub skipped: Vec<String>,
}

/// Serial number and firmware reported by the device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ControllerIdentity {
    /// `SRNO`
    pub serial_number: Option<String>,
    /// `SOFT`
    pub firmware: Option<String>,
}

/// Summary used for listings.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerInfo {
    /// Registry key
    pub name: String,
    /// Label for display
    pub display_name: String,
    /// Serial port path
    pub port: String,
    /// Hardware variant
    pub controller_type: ControllerType,
    /// Device identity
    pub identity: ControllerIdentity,
    /// Whether the link is open
    pub running: bool,
    /// `[A:]MODEL` of every axis
    pub axes: Vec<String>,
}

enum ReceiverSlot {
    Idle,
    Parked(SerialReader),
    Running {
        shutdown: oneshot::Sender<()>,
        handle: JoinHandle<SerialReader>,
    },
}

/// One serial controller and its axes.
pub struct Controller {
    me: Weak<Controller>,
    config: ControllerConfig,
    opener: Arc<dyn PortOpener>,
    axes: Vec<Arc<Axis>>,
    dispatch_table: RwLock<DispatchTable>,
    writer: tokio::sync::Mutex<Option<SerialWriter>>,
    receiver: Mutex<ReceiverSlot>,
    /// Serialises parameter syncs with parameter edits.
    pub(crate) sync_gate: tokio::sync::Mutex<()>,
    lifecycle: tokio::sync::Mutex<()>,
    running: Observable<bool>,
    identity: RwLock<ControllerIdentity>,
    started: Instant,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("name", &self.config.name)
            .field("port", &self.config.port)
            .field("controller_type", &self.config.controller_type)
            .field("axes", &self.axes.len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Controller {
    /// Controller on a real serial port, publishing snapshots inline.
    pub fn new(config: ControllerConfig) -> AppResult<Arc<Self>> {
        Self::with_opener(config, Arc::new(SerialOpener::default()))
    }

    /// Controller using a custom port opener.
    pub fn with_opener(config: ControllerConfig, opener: Arc<dyn PortOpener>) -> AppResult<Arc<Self>> {
        Self::with_parts(config, opener, dispatch::inline())
    }

    /// Controller with a custom port opener and snapshot dispatcher.
    pub fn with_parts(
        config: ControllerConfig,
        opener: Arc<dyn PortOpener>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> AppResult<Arc<Self>> {
        config.validate()?;

        let uses_letters = config.uses_letters();
        let mut prepared = Vec::with_capacity(config.axes.len());
        for axis in &config.axes {
            let model = AxisModel::new(&axis.model, axis.resolution, axis.counts_per_revolution)?;
            let settings = config.axis_settings(axis, &model);
            let letter = if uses_letters {
                axis.letter.map(|c| c.to_ascii_uppercase())
            } else {
                None
            };
            prepared.push((letter, model, settings));
        }
        let letters: Vec<Option<char>> = prepared.iter().map(|(l, _, _)| *l).collect();
        let controller_type = config.controller_type;
        let name = config.name.clone();

        Ok(Arc::new_cyclic(|me: &Weak<Controller>| {
            let axes = prepared
                .into_iter()
                .enumerate()
                .map(|(index, (letter, model, settings))| {
                    Arc::new(Axis::new(
                        me.clone(),
                        index,
                        letter,
                        controller_type,
                        model,
                        settings,
                        dispatcher.clone(),
                    ))
                })
                .collect();
            Controller {
                me: me.clone(),
                config,
                opener,
                axes,
                dispatch_table: RwLock::new(DispatchTable::for_letters(&letters)),
                writer: tokio::sync::Mutex::new(None),
                receiver: Mutex::new(ReceiverSlot::Idle),
                sync_gate: tokio::sync::Mutex::new(()),
                lifecycle: tokio::sync::Mutex::new(()),
                running: Observable::new(format!("{} running", name), false),
                identity: RwLock::new(ControllerIdentity::default()),
                started: Instant::now(),
            }
        }))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Registry key.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Friendly name, falling back to the registry key.
    pub fn display_name(&self) -> &str {
        self.config.friendly_name.as_deref().unwrap_or(&self.config.name)
    }

    /// Serial port path.
    pub fn port(&self) -> &str {
        &self.config.port
    }

    /// Configuration this controller was built from.
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Hardware variant.
    pub fn controller_type(&self) -> ControllerType {
        self.config.controller_type
    }

    /// Axes in controller order.
    pub fn axes(&self) -> &[Arc<Axis>] {
        &self.axes
    }

    /// Axis by letter. `None` selects the first axis.
    pub fn axis(&self, letter: Option<char>) -> AppResult<Arc<Axis>> {
        let found = match letter {
            None => self.axes.first(),
            // Unlettered single-axis controllers answer to any letter
            Some(_) if self.axes.len() == 1 && self.axes[0].letter().is_none() => self.axes.first(),
            Some(c) => {
                let c = c.to_ascii_uppercase();
                self.axes.iter().find(|a| a.letter() == Some(c))
            }
        };
        found.cloned().ok_or_else(|| {
            StageError::AxisNotFound(format!(
                "{}:{}",
                self.config.name,
                letter.map_or_else(|| "-".to_string(), String::from)
            ))
        })
    }

    /// Whether the serial link is open.
    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    /// Subscribe to open/close transitions.
    pub fn subscribe_running(&self) -> watch::Receiver<bool> {
        self.running.subscribe()
    }

    /// Replace the telemetry routing.
    pub fn set_dispatch_table(&self, table: DispatchTable) {
        *self.dispatch_table.write() = table;
    }

    /// Record serial number and firmware.
    pub fn set_identity(&self, identity: ControllerIdentity) {
        *self.identity.write() = identity;
    }

    /// Serial number and firmware, if known.
    pub fn identity(&self) -> ControllerIdentity {
        self.identity.read().clone()
    }

    /// Seconds since this controller was created.
    pub fn global_time_seconds(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Listing summary.
    pub fn info(&self) -> ControllerInfo {
        ControllerInfo {
            name: self.config.name.clone(),
            display_name: self.display_name().to_string(),
            port: self.config.port.clone(),
            controller_type: self.config.controller_type,
            identity: self.identity(),
            running: self.is_running(),
            axes: self
                .axes
                .iter()
                .map(|a| match a.letter() {
                    Some(l) => format!("{}:{}", l, a.model().model),
                    None => a.model().model,
                })
                .collect(),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open the serial link and start the receive task.
    ///
    /// With `load_parameters_on_open` a parameter sync runs in the background
    /// and telemetry starts when it finishes. Otherwise `INFO=<mode>` is sent
    /// right away.
    #[instrument(skip(self), fields(controller = %self.config.name, port = %self.config.port), err)]
    pub async fn open(&self) -> AppResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_running() {
            return Ok(());
        }

        let port = self.opener.open(&self.config.port, self.config.baud_rate).await?;
        let (reader, writer) = split_port(port);
        *self.writer.lock().await = Some(writer);
        self.running.set(true);

        if self.config.load_parameters_on_open {
            *self.receiver.lock() = ReceiverSlot::Parked(reader);
            let me = self.me.clone();
            tokio::spawn(async move {
                let Some(controller) = me.upgrade() else {
                    return;
                };
                match controller.load_parameters_from_controller().await {
                    Ok(report) => tracing::info!(
                        controller = %controller.name(),
                        loaded = report.loaded,
                        skipped = report.skipped.len(),
                        "parameters loaded"
                    ),
                    Err(e) => tracing::warn!(controller = %controller.name(), error = %e, "parameter load failed"),
                }
            });
        } else {
            self.spawn_receiver(reader);
            if let Err(e) = self.set_info_mode(self.config.telemetry.info_mode).await {
                self.shut_down().await;
                return Err(e);
            }
        }

        tracing::info!("controller opened");
        Ok(())
    }

    /// Stop the receive task, close the link and cancel pending moves.
    #[instrument(skip(self), fields(controller = %self.config.name), err)]
    pub async fn close(&self) -> AppResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.shut_down().await {
            tracing::info!("controller closed");
        }
        Ok(())
    }

    /// Tear the link down. Caller holds the lifecycle lock. Returns whether
    /// the controller was running.
    async fn shut_down(&self) -> bool {
        let was_running = self.is_running();
        self.running.set(false);

        drop(self.suspend_receiver().await);

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                tracing::warn!(error = %e, "error closing serial writer");
            }
        }

        for axis in &self.axes {
            axis.cancel_pending();
        }
        was_running
    }

    /// Toggle the link. Returns whether it is open afterwards.
    pub async fn open_port(&self) -> AppResult<bool> {
        if self.is_running() {
            self.close().await?;
        } else {
            self.open().await?;
        }
        Ok(self.is_running())
    }

    fn spawn_receiver(&self, reader: SerialReader) {
        let (shutdown, rx) = oneshot::channel();
        let handle = tokio::spawn(receive_loop(self.me.clone(), reader, rx));
        *self.receiver.lock() = ReceiverSlot::Running { shutdown, handle };
    }

    /// Stop the receive task and take its reader back.
    async fn suspend_receiver(&self) -> Option<SerialReader> {
        let slot = std::mem::replace(&mut *self.receiver.lock(), ReceiverSlot::Idle);
        match slot {
            ReceiverSlot::Idle => None,
            ReceiverSlot::Parked(reader) => Some(reader),
            ReceiverSlot::Running { shutdown, handle } => {
                let _ = shutdown.send(());
                match handle.await {
                    Ok(reader) => Some(reader),
                    Err(e) => {
                        tracing::warn!(controller = %self.config.name, error = %e, "receive task failed");
                        None
                    }
                }
            }
        }
    }

    fn resume_receiver(&self, reader: SerialReader) {
        if self.is_running() {
            self.spawn_receiver(reader);
        }
    }

    fn handle_batch(&self, parser: &mut TelegramParser, bytes: &[u8]) {
        let tokens = parser.feed(bytes);
        if tokens.is_empty() {
            return;
        }
        let frames = group_frames(&tokens, &self.dispatch_table.read());
        let secs = self.global_time_seconds();
        for (index, frame) in frames {
            if let Some(axis) = self.axes.get(index) {
                axis.apply_frame(&frame, secs);
            }
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Write `[A:]text\n` to the device.
    #[instrument(skip(self), fields(controller = %self.config.name), err)]
    pub async fn send_command(&self, text: &str, letter: Option<char>) -> AppResult<()> {
        let line = frame_command(text, letter);
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| StageError::NotConnected(self.config.name.clone()))?;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        tracing::debug!(command = line.trim_end(), "sent");
        Ok(())
    }

    /// Send the current value of one parameter (`M=<device value>`).
    pub async fn send_setting(&self, axis: &Axis, mnemonic: &str) -> AppResult<()> {
        let params = axis.parameters();
        let param = params.require(mnemonic)?;
        let value = param.device_value(axis.resolution())?;
        self.send_command(&format!("{}={}", param.mnemonic(), value), axis.letter())
            .await
    }

    /// Persist the device settings of `axis` (`SAVE`).
    pub async fn save_settings(&self, axis: &Axis) -> AppResult<()> {
        self.send_command("SAVE", axis.letter()).await
    }

    /// Reset `axis` (`RSET`).
    pub async fn reset(&self, axis: &Axis) -> AppResult<()> {
        self.send_command("RSET", axis.letter()).await
    }

    /// Select the telemetry mode (`INFO=<mode>`).
    pub async fn set_info_mode(&self, mode: u8) -> AppResult<()> {
        if !INFO_MODES.contains(&mode) {
            return Err(StageError::Configuration(format!(
                "INFO mode {} is not one of {:?}",
                mode, INFO_MODES
            )));
        }
        self.send_command(&format!("INFO={}", mode), None).await
    }

    /// Stop every axis.
    pub async fn stop_all(&self) -> AppResult<()> {
        for axis in &self.axes {
            axis.stop().await?;
        }
        Ok(())
    }

    // =========================================================================
    // Parameter sync
    // =========================================================================

    /// Query every parameter of every axis and store the device values.
    ///
    /// Telemetry is paused for the duration. Parameters whose query times out
    /// or returns garbage keep their previous value and are listed in the
    /// report. `INFO=<mode>` is always sent afterwards.
    #[instrument(skip(self), fields(controller = %self.config.name), err)]
    pub async fn load_parameters_from_controller(&self) -> AppResult<SyncReport> {
        let _gate = self.sync_gate.lock().await;
        let Some(mut reader) = self.suspend_receiver().await else {
            return Err(StageError::NotConnected(self.config.name.clone()));
        };
        let result = self.query_parameters(&mut reader).await;
        self.resume_receiver(reader);
        result
    }

    async fn query_parameters(&self, reader: &mut SerialReader) -> AppResult<SyncReport> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| StageError::NotConnected(self.config.name.clone()))?;
        let mut link = QueryLink::new(reader, writer)
            .with_timeout(Duration::from_millis(self.config.read_timeout_ms));

        link.send("INFO=0", None).await?;
        link.drain(SYNC_DRAIN_WINDOW).await;

        let mut report = SyncReport::default();
        let mut failure = None;
        'axes: for axis in &self.axes {
            let params = axis.parameters();
            let resolution = axis.resolution();
            for param in params.iter() {
                let label = match axis.letter() {
                    Some(l) => format!("{}:{}", l, param.mnemonic()),
                    None => param.mnemonic().to_string(),
                };
                let stored = match link.query(param.mnemonic(), axis.letter()).await {
                    Ok(raw) => param.set_from_device(raw, resolution).map(|_| ()),
                    Err(e) => Err(e),
                };
                match stored {
                    Ok(()) => report.loaded += 1,
                    Err(e @ (StageError::Timeout(_) | StageError::Protocol(_) | StageError::Configuration(_))) => {
                        tracing::warn!(parameter = %label, error = %e, "parameter skipped");
                        report.skipped.push(label);
                    }
                    Err(e) => {
                        failure = Some(e);
                        break 'axes;
                    }
                }
            }
        }

        link.send(&format!("INFO={}", self.config.telemetry.info_mode), None)
            .await?;
        match failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

/// Reads the telemetry stream until shut down. Returns the reader so a sync
/// can reuse it.
async fn receive_loop(
    controller: Weak<Controller>,
    mut reader: SerialReader,
    mut shutdown: oneshot::Receiver<()>,
) -> SerialReader {
    let mut parser = TelegramParser::new();
    let mut buf = [0u8; 1024];
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    tracing::debug!("serial stream closed");
                    let _ = (&mut shutdown).await;
                    break;
                }
                Ok(n) => {
                    let Some(controller) = controller.upgrade() else {
                        break;
                    };
                    controller.handle_batch(&mut parser, &buf[..n]);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "serial read error");
                    tokio::time::sleep(READ_ERROR_BACKOFF).await;
                }
            }
        }
    }
    reader
}

#[cfg(test)]
mod tests {
    use super::*;
    use stage_core::mock_serial;

    fn single_axis_config() -> ControllerConfig {
        toml::from_str(
            r#"
            name = "bench"
            port = "/dev/mock0"
            controller_type = "c"
            load_parameters_on_open = false

            [[axes]]
            model = "XLS1"
            resolution = 312.5
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_controller_type_from_probe() {
        assert_eq!(ControllerType::from_probe(None, None), ControllerType::Unknown);
        assert_eq!(ControllerType::from_probe(Some(1), Some("OEM 2.1")), ControllerType::Oem);
        assert_eq!(ControllerType::from_probe(Some(1), Some("2.1")), ControllerType::C);
        assert_eq!(ControllerType::from_probe(Some(3), None), ControllerType::M);
        assert_eq!(ControllerType::from_probe(Some(12), None), ControllerType::Rack19);
        assert!(ControllerType::Rack19.axis_bounds().contains(&18));
        assert!(!ControllerType::Oem.supports_mass());
    }

    #[test]
    fn test_config_defaults() {
        let config = single_axis_config();
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.telemetry.info_mode, 4);
        assert!(!config.uses_letters());
        config.validate().unwrap();
    }

    #[test]
    fn test_config_validation_failures() {
        let mut config = single_axis_config();
        config.axes.push(config.axes[0].clone());
        assert!(config.validate().is_err(), "C controller takes one axis");

        config.controller_type = ControllerType::M;
        assert!(config.validate().is_err(), "letters required");

        config.axes[0].letter = Some('x');
        config.axes[1].letter = Some('X');
        assert!(config.validate().is_err(), "letters must be unique");

        config.axes[1].letter = Some('Y');
        config.validate().unwrap();

        config.axes[1].display_unit = Some(Unit::Deg);
        assert!(matches!(config.validate(), Err(StageError::UnitMismatch { .. })));

        config.axes[1].display_unit = None;
        config.telemetry.info_mode = 3;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_open_send_close() {
        let (opener, mut device) = mock_serial::opener();
        let controller = Controller::with_opener(single_axis_config(), Arc::new(opener)).unwrap();

        controller.open().await.unwrap();
        assert!(controller.is_running());
        device.expect_line("INFO=4").await;

        let axis = controller.axis(None).unwrap();
        axis.save_settings().await.unwrap();
        device.expect_line("SAVE").await;

        controller.close().await.unwrap();
        assert!(!controller.is_running());
        assert!(matches!(
            controller.send_command("STOP", None).await,
            Err(StageError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_axis_lookup() {
        let (opener, _device) = mock_serial::opener();
        let controller = Controller::with_opener(single_axis_config(), Arc::new(opener)).unwrap();
        assert_eq!(controller.axis(None).unwrap().axis_index(), 0);
        assert_eq!(controller.axis(Some('a')).unwrap().axis_index(), 0);
        assert_eq!(controller.info().axes, vec!["XLS1".to_string()]);
    }
}
