//! Builds controllers from `[[controllers]]` configuration sections.
//!
//! ```rust,ignore
//! use stage_driver_xeryon::XeryonFactory;
//!
//! let section = toml::Value::Table(toml::toml! {
//!     name = "bench"
//!     port = "/dev/ttyACM0"
//!     controller_type = "c"
//!     [[axes]]
//!     model = "XLS1"
//!     resolution = 312.5
//! });
//! XeryonFactory.validate(&section)?;
//! let controller = XeryonFactory.build(section).await?;
//! ```

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use stage_core::dispatch::{self, Dispatcher};
use stage_core::serial::{PortOpener, SerialOpener};
use std::sync::Arc;

use crate::controller::{Controller, ControllerConfig};
use crate::identify;

/// Factory for Xeryon controllers.
#[derive(Debug, Clone, Copy, Default)]
pub struct XeryonFactory;

impl XeryonFactory {
    /// Value of the `type` field this factory handles.
    pub fn driver_type(&self) -> &'static str {
        "xeryon"
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        "Xeryon Piezo Stage Controller"
    }

    /// Check a configuration section without touching hardware.
    pub fn validate(&self, config: &toml::Value) -> Result<()> {
        identify::validate_tables()?;
        let cfg: ControllerConfig = config.clone().try_into()?;
        cfg.validate()?;
        Ok(())
    }

    /// Build a stopped controller on a real serial port.
    pub fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<Arc<Controller>>> {
        self.build_with(config, Arc::new(SerialOpener::default()), dispatch::inline())
    }

    /// Build a stopped controller with a custom port opener and dispatcher.
    pub fn build_with(
        &self,
        config: toml::Value,
        opener: Arc<dyn PortOpener>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> BoxFuture<'static, Result<Arc<Controller>>> {
        Box::pin(async move {
            let cfg: ControllerConfig = config.try_into().context("Invalid Xeryon controller config")?;
            let name = cfg.name.clone();
            let controller = Controller::with_parts(cfg, opener, dispatcher)
                .with_context(|| format!("Failed to build controller '{}'", name))?;
            tracing::debug!(controller = %name, axes = controller.axes().len(), "controller built");
            Ok(controller)
        })
    }
}
