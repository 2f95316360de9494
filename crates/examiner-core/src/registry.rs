//! Ordered plugin registry.

use std::sync::Arc;

use tracing::warn;

use crate::plugin::Plugin;

/// Registered plugins in registration order.
///
/// Duplicate identifiers are kept: listings report every registration and
/// lookups return all matches, mirroring how `init` fans out to each match.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, plugin: Arc<dyn Plugin>) {
        if self.contains(plugin.identifier()) {
            warn!(plugin = %plugin.identifier(), "plugin identifier registered more than once");
        }
        self.plugins.push(plugin);
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.plugins.iter().any(|p| p.identifier() == identifier)
    }

    /// Every registration matching `identifier`, in registration order.
    pub fn matching(&self, identifier: &str) -> Vec<Arc<dyn Plugin>> {
        self.plugins
            .iter()
            .filter(|p| p.identifier() == identifier)
            .cloned()
            .collect()
    }

    /// All identifiers, in registration order.
    pub fn identifiers(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.identifier().to_string()).collect()
    }

    /// Identifiers of background plugins, in registration order.
    pub fn background_identifiers(&self) -> Vec<String> {
        self.plugins
            .iter()
            .filter(|p| p.runs_in_background())
            .map(|p| p.identifier().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
