use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::schema::CaseTypeDef;
use crate::validate::validate_case_type;
use crate::{TypeError, TypeResult, load_file};

/// Known case types, keyed by name. Types are shared read-only with every
/// case instance that uses them.
#[derive(Debug, Clone, Default)]
pub struct CaseTypeRegistry {
    types: BTreeMap<String, Arc<CaseTypeDef>>,
}

impl CaseTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, def: CaseTypeDef) -> TypeResult<Arc<CaseTypeDef>> {
        validate_case_type(&def)?;
        if self.types.contains_key(&def.name) {
            return Err(TypeError::DuplicateType { name: def.name });
        }
        let def = Arc::new(def);
        self.types.insert(def.name.clone(), Arc::clone(&def));
        Ok(def)
    }

    pub fn get(&self, name: &str) -> Option<Arc<CaseTypeDef>> {
        self.types.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<CaseTypeDef>> {
        self.types.values()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Load every `.yaml`, `.yml` and `.json` file in `dir`. Files with other
    /// extensions are skipped; a malformed type file fails the whole load.
    pub fn load_dir(dir: &Path) -> TypeResult<Self> {
        let mut registry = Self::new();
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        paths.sort();
        for path in paths {
            match load_file(&path) {
                Ok(def) => {
                    debug!(name = %def.name, path = %path.display(), "loaded case type");
                    registry.insert(def)?;
                }
                Err(TypeError::UnsupportedFile { .. }) => {
                    warn!(path = %path.display(), "skipping non case type file");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(registry)
    }
}
