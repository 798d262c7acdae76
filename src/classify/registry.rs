use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use super::backend::ClipClassifier;

/// A classifier shared by every camera's inference worker.
///
/// Wrapped in `Mutex` because `ClipClassifier::predict` takes `&mut self`; calls from
/// different cameras are serialized on the model, never on the pipelines.
pub type SharedClassifier = Arc<Mutex<dyn ClipClassifier>>;

/// Thread-safe registry of clip classifier backends.
pub struct ClassifierRegistry {
    backends: HashMap<String, SharedClassifier>,
    default_name: Option<String>,
}

impl ClassifierRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            default_name: None,
        }
    }

    /// Register a backend. The first registered backend becomes the default.
    pub fn register<C: ClipClassifier + 'static>(&mut self, classifier: C) {
        let name = classifier.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.backends.insert(name, Arc::new(Mutex::new(classifier)));
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.backends.contains_key(name) {
            return Err(anyhow!("classifier backend '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    /// Get backend by name.
    pub fn get(&self, name: &str) -> Option<SharedClassifier> {
        self.backends.get(name).cloned()
    }

    /// Get default backend.
    pub fn default_classifier(&self) -> Option<SharedClassifier> {
        self.default_name.as_ref().and_then(|name| self.get(name))
    }

    /// List registered backends.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run the warm-up hook of every registered backend.
    pub fn warm_up_all(&self) -> Result<()> {
        for (name, backend) in &self.backends {
            let mut guard = backend
                .lock()
                .map_err(|_| anyhow!("classifier '{}' lock poisoned", name))?;
            guard.warm_up()?;
        }
        Ok(())
    }
}

impl Default for ClassifierRegistry {
    fn default() -> Self {
        Self::new()
    }
}
