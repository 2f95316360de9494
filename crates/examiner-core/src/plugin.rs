//! The plugin contract implemented by host code.

use std::sync::Arc;

use crate::connection::PluginConnection;

/// A named capability unit exposed to the desktop inspector.
///
/// Plugins are registered before the engine starts and live for the rest of
/// the process. `on_connect` / `on_disconnect` run on the I/O path and must
/// not block.
pub trait Plugin: Send + Sync {
    /// Unique identifier, e.g. `"Example"` or `"Preferences"`.
    fn identifier(&self) -> &str;

    /// The desktop sent `init` for this plugin. Register receivers on
    /// `connection` and keep it to push notifications.
    fn on_connect(&self, connection: Arc<PluginConnection>);

    /// The desktop sent `deinit`; the connection handed to `on_connect` is
    /// no longer routed.
    fn on_disconnect(&self);

    /// Whether the plugin stays active while the desktop is showing another
    /// plugin.
    fn runs_in_background(&self) -> bool {
        false
    }
}
