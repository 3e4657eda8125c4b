//! The plugin registry: a `scheme -> factory` map, built once at startup
//! and read-only thereafter.

use crate::plugin::PluginFactory;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct PluginRegistry {
    factories: HashMap<String, Arc<dyn PluginFactory>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Arc<dyn PluginFactory>) {
        self.factories.insert(factory.scheme().to_string(), factory);
    }

    pub fn get(&self, scheme: &str) -> Option<Arc<dyn PluginFactory>> {
        self.factories.get(scheme).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use socksrelay_core::ProxyError;
    use socksrelay_registry::CheckedOutEntry;

    struct MockFactory(&'static str);

    #[async_trait]
    impl PluginFactory for MockFactory {
        fn scheme(&self) -> &str {
            self.0
        }
        async fn build(
            &self,
            _entry: &CheckedOutEntry,
            _client_addr: std::net::SocketAddr,
        ) -> Result<Box<dyn crate::plugin::PluginInstance>, ProxyError> {
            unimplemented!("not exercised by this test")
        }
    }

    #[test]
    fn register_and_lookup_by_scheme() {
        let mut registry = PluginRegistry::new();
        assert!(registry.is_empty());
        registry.register(Arc::new(MockFactory("SMB")));
        registry.register(Arc::new(MockFactory("LDAP")));

        assert_eq!(registry.len(), 2);
        assert!(registry.get("SMB").is_some());
        assert!(registry.get("HTTP").is_none());

        let mut schemes = registry.list();
        schemes.sort();
        assert_eq!(schemes, vec!["LDAP", "SMB"]);
    }
}
