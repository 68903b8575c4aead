//! Registry of found controllers.
//!
//! Controllers are keyed by name. "Found" controllers are every controller
//! discovery or configuration produced; "running" ones are those with an open
//! link. A running controller cannot be replaced or removed.

use parking_lot::RwLock;
use stage_core::error::{AppResult, StageError};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::controller::Controller;

/// Found and running controllers, keyed by name.
#[derive(Debug, Default)]
pub struct ControllerRegistry {
    found: RwLock<BTreeMap<String, Arc<Controller>>>,
}

impl ControllerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a found controller.
    ///
    /// Fails if a running controller already has the same name.
    pub fn add_found(&self, controller: Arc<Controller>) -> AppResult<()> {
        let mut found = self.found.write();
        if let Some(existing) = found.get(controller.name()) {
            if existing.is_running() {
                return Err(StageError::ControllerRunning(controller.name().to_string()));
            }
        }
        tracing::debug!(controller = %controller.name(), port = %controller.port(), "controller registered");
        found.insert(controller.name().to_string(), controller);
        Ok(())
    }

    /// Remove a stopped controller.
    pub fn remove_found(&self, name: &str) -> AppResult<Arc<Controller>> {
        let mut found = self.found.write();
        match found.get(name) {
            None => Err(StageError::ControllerNotFound(name.to_string())),
            Some(c) if c.is_running() => Err(StageError::ControllerRunning(name.to_string())),
            Some(_) => found
                .remove(name)
                .ok_or_else(|| StageError::ControllerNotFound(name.to_string())),
        }
    }

    /// Controller by name.
    pub fn get(&self, name: &str) -> AppResult<Arc<Controller>> {
        self.found
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StageError::ControllerNotFound(name.to_string()))
    }

    /// Every found controller, by name.
    pub fn found(&self) -> Vec<Arc<Controller>> {
        self.found.read().values().cloned().collect()
    }

    /// Controllers with an open link.
    pub fn running(&self) -> Vec<Arc<Controller>> {
        self.found
            .read()
            .values()
            .filter(|c| c.is_running())
            .cloned()
            .collect()
    }

    /// Number of found controllers.
    pub fn len(&self) -> usize {
        self.found.read().len()
    }

    /// Whether no controller was found.
    pub fn is_empty(&self) -> bool {
        self.found.read().is_empty()
    }

    /// Open a found controller.
    pub async fn start(&self, name: &str) -> AppResult<Arc<Controller>> {
        let controller = self.get(name)?;
        controller.open().await?;
        Ok(controller)
    }

    /// Close a found controller.
    pub async fn stop(&self, name: &str) -> AppResult<()> {
        self.get(name)?.close().await
    }

    /// Open or close a found controller. Returns whether it is running after.
    pub async fn toggle(&self, name: &str) -> AppResult<bool> {
        self.get(name)?.open_port().await
    }

    /// Drop stopped controllers whose port is no longer present.
    ///
    /// Running controllers are kept; their link reports the loss itself.
    pub fn prune(&self, present_ports: &[String]) -> Vec<String> {
        let mut found = self.found.write();
        let gone: Vec<String> = found
            .iter()
            .filter(|(_, c)| !c.is_running() && !present_ports.iter().any(|p| p == c.port()))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &gone {
            found.remove(name);
            tracing::info!(controller = %name, "controller pruned");
        }
        gone
    }

    /// Close every running controller. Errors are logged, not returned.
    pub async fn stop_all(&self) {
        for controller in self.running() {
            if let Err(e) = controller.close().await {
                tracing::warn!(controller = %controller.name(), error = %e, "close failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerConfig;
    use stage_core::mock_serial;

    fn controller(name: &str, port: &str) -> Arc<Controller> {
        let config: ControllerConfig = toml::from_str(&format!(
            r#"
            name = "{name}"
            port = "{port}"
            [[axes]]
            model = "XLS1"
            resolution = 312.5
            "#
        ))
        .unwrap();
        let (opener, _device) = mock_serial::opener();
        Controller::with_opener(config, Arc::new(opener)).unwrap()
    }

    #[tokio::test]
    async fn test_found_is_sorted_and_replaceable() {
        let registry = ControllerRegistry::new();
        registry.add_found(controller("b", "/dev/b")).unwrap();
        registry.add_found(controller("a", "/dev/a")).unwrap();
        registry.add_found(controller("a", "/dev/a2")).unwrap();

        let names: Vec<String> = registry.found().iter().map(|c| c.name().to_string()).collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(registry.get("a").unwrap().port(), "/dev/a2");
        assert!(registry.running().is_empty());
    }

    #[tokio::test]
    async fn test_prune_keeps_present_ports() {
        let registry = ControllerRegistry::new();
        registry.add_found(controller("a", "/dev/a")).unwrap();
        registry.add_found(controller("b", "/dev/b")).unwrap();

        let pruned = registry.prune(&["/dev/a".to_string()]);
        assert_eq!(pruned, vec!["b".to_string()]);
        assert_eq!(registry.len(), 1);
        assert!(matches!(
            registry.remove_found("b"),
            Err(StageError::ControllerNotFound(_))
        ));
    }
}
