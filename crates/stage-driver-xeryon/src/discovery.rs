//! Port probing.
//!
//! A probe opens the port, silences telemetry (`INFO=0`), asks for `SRNO`,
//! `SOFT` and `AXES`, and keeps every line it reads as the dump. Device-info
//! entries in the dump (`[A:]MODEL=resolution`) name the axes, which are then
//! identified one by one. The port is closed again before returning; the
//! result can be turned into a configured, stopped [`Controller`].

use serde::Serialize;
use stage_core::dispatch::Dispatcher;
use stage_core::error::{AppResult, StageError};
use stage_core::serial::{split_port, PortOpener};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::instrument;

use crate::controller::{AxisConfig, Controller, ControllerConfig, ControllerIdentity, ControllerType};
use crate::identify::{parse_device_info, AxisIdentification, AxisIdentifier};
use crate::query::{QueryLink, DEFAULT_QUERY_TIMEOUT};

/// Probe settings.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Baud rate to open ports with
    pub baud_rate: u32,
    /// Bound on each query
    pub query_timeout: Duration,
    /// Quiet window used to collect unsolicited lines
    pub drain_window: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            drain_window: Duration::from_millis(100),
        }
    }
}

/// Result of probing one port.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredController {
    /// Probed port
    pub port: String,
    /// Baud rate the probe used
    pub baud_rate: u32,
    /// `SRNO` reply
    pub serial_number: Option<String>,
    /// `SOFT` reply
    pub firmware: Option<String>,
    /// Variant derived from `AXES` and `SOFT`
    pub controller_type: ControllerType,
    /// Every line read during the probe
    pub dump: Vec<String>,
    /// Identified axes in dump order
    pub axes: Vec<AxisIdentification>,
}

impl DiscoveredController {
    /// Registry name: `xeryon-<serial>` or `xeryon-<port file name>`.
    pub fn name(&self) -> String {
        match &self.serial_number {
            Some(srno) => format!("xeryon-{}", srno.trim()),
            None => {
                let port = Path::new(&self.port)
                    .file_name()
                    .map_or_else(|| self.port.clone(), |f| f.to_string_lossy().into_owned());
                format!("xeryon-{}", port)
            }
        }
    }

    /// Controller configuration for what was found.
    pub fn to_config(&self) -> ControllerConfig {
        ControllerConfig {
            name: self.name(),
            friendly_name: None,
            port: self.port.clone(),
            baud_rate: self.baud_rate,
            read_timeout_ms: 1000,
            controller_type: self.controller_type,
            arrival_timeout_ms: 30_000,
            load_parameters_on_open: true,
            telemetry: Default::default(),
            axes: self
                .axes
                .iter()
                .map(|id| AxisConfig {
                    letter: id.letter,
                    model: id.model.clone(),
                    resolution: id.resolution,
                    counts_per_revolution: None,
                    display_unit: None,
                    step_size: 1.0,
                    step_unit: None,
                })
                .collect(),
        }
    }

    /// Build a stopped controller with the identified limits applied.
    pub fn into_controller(
        self,
        opener: Arc<dyn PortOpener>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> AppResult<Arc<Controller>> {
        let controller = Controller::with_parts(self.to_config(), opener, dispatcher)?;
        controller.set_identity(ControllerIdentity {
            serial_number: self.serial_number.clone(),
            firmware: self.firmware.clone(),
        });
        for (axis, id) in controller.axes().iter().zip(&self.axes) {
            if id.hlim <= id.llim {
                continue;
            }
            let params = axis.parameters();
            let resolution = axis.resolution();
            params.require("LLIM")?.set_from_device(id.llim as f64, resolution)?;
            params.require("HLIM")?.set_from_device(id.hlim as f64, resolution)?;
        }
        Ok(controller)
    }
}

/// Probe one port.
///
/// Fails when the port cannot be opened or the dump names no known axis.
#[instrument(skip(opener, options), fields(baud = options.baud_rate), err)]
pub async fn discover_port(
    opener: &dyn PortOpener,
    port: &str,
    options: &DiscoveryOptions,
) -> AppResult<DiscoveredController> {
    let serial = opener.open(port, options.baud_rate).await?;
    let (mut reader, mut writer) = split_port(serial);

    let result = probe(&mut reader, &mut writer, port, options).await;

    if let Err(e) = writer.shutdown().await {
        tracing::debug!(error = %e, "error closing probed port");
    }
    result
}

async fn probe<R, W>(
    reader: &mut R,
    writer: &mut W,
    port: &str,
    options: &DiscoveryOptions,
) -> AppResult<DiscoveredController>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut link = QueryLink::new(reader, writer).with_timeout(options.query_timeout);
    link.send("INFO=0", None).await?;
    link.drain(options.drain_window).await;

    let serial_number = link.query_raw("SRNO", None).await.ok();
    let firmware = link.query_raw("SOFT", None).await.ok();
    let axis_count = link
        .query("AXES", None)
        .await
        .ok()
        .filter(|n| *n >= 0.0)
        .map(|n| n.round() as u32);
    link.drain(options.drain_window).await;

    let dump = link.transcript().to_vec();
    let infos = parse_device_info(&dump.join("\n"));
    if infos.is_empty() {
        return Err(StageError::Protocol(format!("{}: no axis found in device dump", port)));
    }

    let mut controller_type = ControllerType::from_probe(axis_count, firmware.as_deref());
    if !controller_type.axis_bounds().contains(&infos.len()) {
        controller_type = ControllerType::from_probe(Some(infos.len() as u32), firmware.as_deref());
    }

    let mut identifier = AxisIdentifier::new(link);
    let mut axes = Vec::with_capacity(infos.len());
    for info in &infos {
        match identifier.identify(info).await {
            Ok(id) => axes.push(id),
            Err(e) => tracing::warn!(model = %info.model, error = %e, "axis not identified"),
        }
    }
    if axes.is_empty() {
        return Err(StageError::Protocol(format!("{}: no known axis family in dump", port)));
    }
    let dump = identifier.into_link().transcript().to_vec();

    tracing::info!(
        port,
        serial_number = serial_number.as_deref().unwrap_or("-"),
        %controller_type,
        axes = axes.len(),
        "controller discovered"
    );
    Ok(DiscoveredController {
        port: port.to_string(),
        baud_rate: options.baud_rate,
        serial_number,
        firmware,
        controller_type,
        dump,
        axes,
    })
}

/// Probe every port, skipping those that do not answer.
pub async fn discover_ports(
    opener: &dyn PortOpener,
    ports: &[String],
    options: &DiscoveryOptions,
) -> Vec<DiscoveredController> {
    let mut found = Vec::new();
    for port in ports {
        match discover_port(opener, port, options).await {
            Ok(d) => found.push(d),
            Err(e) => tracing::debug!(port = %port, error = %e, "no controller on port"),
        }
    }
    found
}
