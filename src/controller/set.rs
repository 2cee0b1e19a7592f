//! The process-wide set of controllers

use super::{Controller, ControllerOptions, HookRegistry, ViewerId};
use crate::auth::{controller_permission, Authorizer};
use crate::config::Config;
use crate::protocol::ControllerInfo;
use crate::transport::ProcessTransport;
use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// All controllers of a process, sharing one hook registry
pub struct ControllerSet {
    controllers: BTreeMap<String, Controller>,
    hooks: Arc<HookRegistry>,
}

impl Default for ControllerSet {
    fn default() -> Self {
        Self::new(Arc::new(HookRegistry::new()))
    }
}

impl ControllerSet {
    pub fn new(hooks: Arc<HookRegistry>) -> Self {
        Self {
            controllers: BTreeMap::new(),
            hooks,
        }
    }

    /// Build one (unconnected) controller per configured entry
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut set = Self::default();
        for (name, def) in &config.controllers {
            let transport = Arc::new(ProcessTransport::from_config(&def.auth));
            let options = ControllerOptions::new(name.clone(), transport)
                .with_command_delay(Duration::from_millis(def.command_delay_ms))
                .with_init_script(def.scripts.init.iter().cloned());
            set.create(options)?;
        }
        Ok(set)
    }

    /// Add a controller built from `options`
    pub fn create(&mut self, options: ControllerOptions) -> Result<Controller> {
        if self.controllers.contains_key(&options.name) {
            return Err(anyhow!("Controller '{}' already exists", options.name));
        }
        let controller = Controller::new(options, Arc::clone(&self.hooks));
        self.controllers
            .insert(controller.name().to_string(), controller.clone());
        Ok(controller)
    }

    /// Start connecting every controller in the background
    pub fn start(&self) {
        for controller in self.controllers.values() {
            controller.spawn_connect();
        }
    }

    pub fn get(&self, name: &str) -> Option<&Controller> {
        self.controllers.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Controller> {
        self.controllers.values()
    }

    pub fn names(&self) -> Vec<String> {
        self.controllers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    /// Controllers the operator may see and drive
    pub fn visible_to<'a>(&'a self, operator: &'a dyn Authorizer) -> impl Iterator<Item = &'a Controller> + 'a {
        self.controllers
            .values()
            .filter(move |c| operator.has_permission(&controller_permission(c.name())))
    }

    /// Release the hook relation of a viewer whose channel closed
    pub fn release_viewer(&self, viewer: ViewerId) -> bool {
        self.hooks.release(viewer)
    }

    /// Status for every controller visible to the operator
    pub fn info_for(&self, operator: &dyn Authorizer, attached_to: Option<&str>) -> Vec<ControllerInfo> {
        self.visible_to(operator)
            .map(|c| ControllerInfo {
                name: c.name().to_string(),
                state: c.state(),
                queued: c.queued(),
                viewers: c.viewers().len(),
                is_attached: attached_to == Some(c.name()),
            })
            .collect()
    }

    /// Stop every controller
    pub fn shutdown(&self) {
        for controller in self.controllers.values() {
            controller.shutdown();
        }
    }
}
