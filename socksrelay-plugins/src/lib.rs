pub mod echo;
pub mod raw;

use socksrelay_plugin::PluginRegistry;
use std::sync::Arc;

/// Register the demonstration plugins (`ECHO`, `RAW`). Neither implements a
/// real protocol; they exist to exercise the plugin contract end-to-end.
pub fn register_demo_plugins(registry: &mut PluginRegistry) {
    registry.register(Arc::new(echo::EchoPluginFactory));
    registry.register(Arc::new(raw::RawPluginFactory::default()));
}
