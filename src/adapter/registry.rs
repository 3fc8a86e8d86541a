//! Vendor-tag lookup over registered adapters.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::OrchestratorError;

use super::traits::ModelAdapter;

#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ModelAdapter>>,
}

impl AdapterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ModelAdapter>) {
        self.adapters.insert(adapter.vendor_tag().to_string(), adapter);
    }

    /// Look up the adapter for a vendor tag. Unknown tags fail with
    /// `InvalidPlatform`.
    pub fn get(&self, vendor: &str) -> Result<Arc<dyn ModelAdapter>, OrchestratorError> {
        self.adapters.get(vendor).cloned().ok_or_else(|| OrchestratorError::InvalidPlatform(vendor.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::mock::MockAdapter;

    #[test]
    fn unknown_vendor_is_invalid_platform() {
        let registry = AdapterRegistry::new();
        let err = registry.get("nonexistent").unwrap_err();
        assert_eq!(err.code(), "invalid_platform");
    }

    #[test]
    fn registered_vendor_resolves() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(MockAdapter::new()));
        assert!(registry.get("mock").is_ok());
    }
}
