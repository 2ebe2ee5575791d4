//! Registry mapping stored migration names to constructors.
//!
//! A migration row stores a name and JSON arguments. The registry turns them back into a
//! [`BackgroundMigration`] by deserializing the arguments into the type the factory was
//! registered with. Names are checked when they are registered; a row whose name is not
//! registered fails with [`Error::UnknownMigration`].

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use serde::de::DeserializeOwned;

use crate::definition::BackgroundMigration;
use crate::error::{Error, Result};

type BoxedFactory =
    Box<dyn Fn(serde_json::Value) -> anyhow::Result<Arc<dyn BackgroundMigration>> + Send + Sync>;

/// Registry of background migration factories.
///
/// # Example
///
/// ```ignore
/// let mut registry = MigrationRegistry::new();
/// registry.register::<CopyColumnArgs, _>("copy_column", move |args| {
///     Ok(Arc::new(CopyColumn::new(pool.clone(), args)?))
/// })?;
///
/// let migration = registry.build("copy_column", &json!({"table": "users", ...}))?;
/// ```
#[derive(Default)]
pub struct MigrationRegistry {
    factories: HashMap<String, BoxedFactory>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register `factory` under `name`, with arguments deserialized as `A`.
    pub fn register<A, F>(&mut self, name: impl Into<String>, factory: F) -> Result<()>
    where
        A: DeserializeOwned + 'static,
        F: Fn(A) -> anyhow::Result<Arc<dyn BackgroundMigration>> + Send + Sync + 'static,
    {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::Validation(
                "background migration name must not be empty".into(),
            ));
        }
        if self.factories.contains_key(&name) {
            return Err(Error::DuplicateRegistration(name));
        }

        let label = name.clone();
        let boxed: BoxedFactory = Box::new(move |value| {
            let args: A = serde_json::from_value(value)
                .with_context(|| format!("Failed to deserialize arguments of {}", label))?;
            factory(args)
        });

        self.factories.insert(name, boxed);
        Ok(())
    }

    /// Construct the migration registered as `name` from stored `arguments`.
    pub fn build(
        &self,
        name: &str,
        arguments: &serde_json::Value,
    ) -> Result<Arc<dyn BackgroundMigration>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::UnknownMigration(name.to_string()))?;

        factory(arguments.clone()).map_err(|e| {
            Error::Configuration(format!("cannot build background migration {}: {:#}", name, e))
        })
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for MigrationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationRegistry")
            .field("names", &self.names())
            .finish()
    }
}

/// Thread-safe registry wrapped in Arc.
pub type SharedMigrationRegistry = Arc<MigrationRegistry>;
