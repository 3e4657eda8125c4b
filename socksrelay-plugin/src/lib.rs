pub mod plugin;
pub mod registry;

pub use plugin::{AsyncReadWrite, PluginFactory, PluginInstance};
pub use registry::PluginRegistry;
