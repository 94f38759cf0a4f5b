//! Module name resolution.
//!
//! Names resolve in three tiers:
//!
//! 1. a specialized handler registered under the name, together with its table;
//! 2. a standalone table, run by the generic executor;
//! 3. an empty table with sensor id `0x0000`, also generic.
//!
//! Resolution never fails. Results are cached per name for the lifetime of the
//! registry, so later registrations do not affect names already resolved.

use super::ModuleHandler;
use super::config::ModuleConfig;
use super::illuminance::IlluminanceHandler;
use crate::error::BjigError;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

const ILLUMINANCE_CONFIG: &str = include_str!("../../configs/illuminance.json");
const ROUTER_CONFIG: &str = include_str!("../../configs/router.json");

/// What a module name is bound to.
#[derive(Clone)]
pub enum ModuleDescriptor {
    Specialized {
        handler: Arc<dyn ModuleHandler>,
        config: ModuleConfig,
    },
    Generic(ModuleConfig),
    Unknown(ModuleConfig),
}

impl fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleDescriptor::Specialized { handler, config } => f
                .debug_struct("Specialized")
                .field("handler", &handler.name())
                .field("config", &config.name)
                .finish(),
            ModuleDescriptor::Generic(config) => f.debug_tuple("Generic").field(&config.name).finish(),
            ModuleDescriptor::Unknown(config) => f.debug_tuple("Unknown").field(&config.name).finish(),
        }
    }
}

/// A resolved module, shared between concurrent dispatch calls.
#[derive(Debug)]
pub struct ResolvedModule {
    pub name: String,
    pub descriptor: ModuleDescriptor,
}

impl ResolvedModule {
    pub fn config(&self) -> &ModuleConfig {
        match &self.descriptor {
            ModuleDescriptor::Specialized { config, .. } => config,
            ModuleDescriptor::Generic(config) | ModuleDescriptor::Unknown(config) => config,
        }
    }

    pub fn handler(&self) -> Option<&Arc<dyn ModuleHandler>> {
        match &self.descriptor {
            ModuleDescriptor::Specialized { handler, .. } => Some(handler),
            _ => None,
        }
    }

    pub fn is_generic(&self) -> bool {
        !matches!(self.descriptor, ModuleDescriptor::Specialized { .. })
    }
}

#[derive(Default)]
pub struct ModuleRegistry {
    handlers: HashMap<String, Arc<dyn ModuleHandler>>,
    configs: HashMap<String, ModuleConfig>,
    cache: RwLock<HashMap<String, Arc<ResolvedModule>>>,
}

impl ModuleRegistry {
    /// An empty registry: every name resolves to the empty generic table.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in `illuminance` and `router` modules.
    pub fn with_builtin_modules() -> Result<Self, BjigError> {
        let mut registry = Self::new();
        registry.register_config(ModuleConfig::from_json_str(ILLUMINANCE_CONFIG)?);
        registry.register_handler("illuminance", Arc::new(IlluminanceHandler));
        registry.register_config(ModuleConfig::from_json_str(ROUTER_CONFIG)?);
        Ok(registry)
    }

    /// Bind a specialized handler to `name`. It uses the table registered
    /// under the same name, or an empty one.
    pub fn register_handler(&mut self, name: impl Into<String>, handler: Arc<dyn ModuleHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    /// Register a declarative table under its own name.
    pub fn register_config(&mut self, config: ModuleConfig) {
        self.configs.insert(config.name.clone(), config);
    }

    /// Names with a handler or table registered.
    pub fn module_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().chain(self.configs.keys()).cloned().collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn resolve(&self, name: &str) -> Arc<ResolvedModule> {
        if let Some(hit) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Arc::clone(hit);
        }

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        let resolved = cache
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(self.build(name)));
        Arc::clone(resolved)
    }

    fn build(&self, name: &str) -> ResolvedModule {
        let descriptor = match (self.handlers.get(name), self.configs.get(name)) {
            (Some(handler), config) => ModuleDescriptor::Specialized {
                handler: Arc::clone(handler),
                config: config.cloned().unwrap_or_else(|| ModuleConfig::empty(name)),
            },
            (None, Some(config)) => ModuleDescriptor::Generic(config.clone()),
            (None, None) => ModuleDescriptor::Unknown(ModuleConfig::empty(name)),
        };
        debug!("Resolved module '{name}' as {descriptor:?}");
        ResolvedModule {
            name: name.to_string(),
            descriptor,
        }
    }
}
