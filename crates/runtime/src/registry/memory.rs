//! In-memory function registry

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::FunctionRegistry;
use crate::types::{FunctionSpec, RegistryError};

/// Registry held entirely in process memory; contents are lost on exit
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    functions: RwLock<HashMap<String, FunctionSpec>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.functions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.read().is_empty()
    }
}

#[async_trait]
impl FunctionRegistry for InMemoryRegistry {
    async fn put(&self, spec: FunctionSpec) -> Result<(), RegistryError> {
        let mut functions = self.functions.write();
        if functions.contains_key(spec.name()) {
            return Err(RegistryError::AlreadyExists {
                name: spec.name().to_string(),
            });
        }
        functions.insert(spec.name().to_string(), spec);
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<FunctionSpec, RegistryError> {
        self.functions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                name: name.to_string(),
            })
    }
}
