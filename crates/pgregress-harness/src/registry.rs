//! Regression file registry.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::FixtureError;
use crate::fixtures::{FixtureDocument, RegressionFile};

#[derive(Debug, Default)]
struct Inner {
    order: Vec<Arc<RegressionFile>>,
    by_name: HashMap<String, Arc<RegressionFile>>,
    sealed: bool,
}

/// Table of regression files keyed by name.
///
/// Populated once at startup, sealed, then read concurrently by the runner's
/// worker threads.
#[derive(Debug, Default)]
pub struct FixtureRegistry {
    inner: RwLock<Inner>,
}

impl FixtureRegistry {
    /// Create a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store a file under its name.
    pub fn register(&self, file: RegressionFile) -> Result<(), FixtureError> {
        file.validate()?;
        let mut inner = self.inner.write();
        if inner.sealed {
            return Err(FixtureError::RegistrySealed(file.name));
        }
        if inner.by_name.contains_key(&file.name) {
            return Err(FixtureError::DuplicateFile(file.name));
        }
        let file = Arc::new(file);
        inner.by_name.insert(file.name.clone(), Arc::clone(&file));
        inner.order.push(file);
        Ok(())
    }

    /// Refuse any further registration.
    pub fn seal(&self) {
        self.inner.write().sealed = true;
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.inner.read().sealed
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Arc<RegressionFile>> {
        self.inner.read().by_name.get(name).cloned()
    }

    /// Names in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.inner
            .read()
            .order
            .iter()
            .map(|file| file.name.clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register every file in one fixture document. Returns the names registered.
    pub fn load_file(&self, path: &Path) -> Result<Vec<String>, FixtureError> {
        let files = FixtureDocument::from_file(path)?;
        let mut names = Vec::with_capacity(files.len());
        for file in files {
            names.push(file.name.clone());
            self.register(file)?;
        }
        Ok(names)
    }

    /// Register every `*.json` document in a directory, in path order.
    pub fn load_dir(&self, dir: &Path) -> Result<Vec<String>, FixtureError> {
        let invalid = |message: String| FixtureError::InvalidFixture {
            path: dir.display().to_string(),
            message,
        };
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(|err| invalid(err.to_string()))? {
            let path = entry.map_err(|err| invalid(err.to_string()))?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut names = Vec::new();
        for path in paths {
            names.extend(self.load_file(&path)?);
        }
        Ok(names)
    }
}
