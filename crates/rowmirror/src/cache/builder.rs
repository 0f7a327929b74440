//! Builder for [`ClientCache`].

use std::fmt;
use std::sync::Arc;

use fxhash::FxHashMap;

use super::{ClientCache, ConnectionHooks};
use crate::config::{CacheConfig, ReconnectPolicy};
use crate::schema::{SchemaError, TableSchema};
use crate::session::{CommandSink, DiscardSink, Identity};
use crate::Result;

/// Builder for [`ClientCache`].
///
/// Every table the cache may mirror is declared here. Schemas are immutable
/// afterwards.
#[derive(Default)]
#[must_use = "a builder does nothing until `build` is called"]
pub struct ClientCacheBuilder {
    config: CacheConfig,
    schemas: Vec<TableSchema>,
    sink: Option<Box<dyn CommandSink>>,
    hooks: ConnectionHooks,
}

impl ClientCacheBuilder {
    /// Creates a builder with the default configuration and no tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets how mirrors are cleared on reconnect.
    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect_policy = policy;
        self
    }

    /// Enables or disables merging a delete and insert of the same primary
    /// key into an update.
    pub fn pair_primary_key_updates(mut self, enabled: bool) -> Self {
        self.config.pair_primary_key_updates = enabled;
        self
    }

    /// Declares a table.
    pub fn table(mut self, schema: TableSchema) -> Self {
        self.schemas.push(schema);
        self
    }

    /// Declares several tables.
    pub fn tables(mut self, schemas: impl IntoIterator<Item = TableSchema>) -> Self {
        self.schemas.extend(schemas);
        self
    }

    /// Where subscribe and unsubscribe commands go. Defaults to a sink that
    /// drops them.
    pub fn command_sink(mut self, sink: impl CommandSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    /// Runs `f` with the identity and token of every new session.
    pub fn on_connect(mut self, f: impl FnMut(&Identity, &str) + Send + 'static) -> Self {
        self.hooks.on_connect = Some(Box::new(f));
        self
    }

    /// Runs `f` with the transport error (if any) whenever a session ends.
    pub fn on_disconnect(mut self, f: impl FnMut(Option<&str>) + Send + 'static) -> Self {
        self.hooks.on_disconnect = Some(Box::new(f));
        self
    }

    /// Validates the schemas and builds the cache.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Schema`] if a schema is invalid or a table is
    /// declared twice.
    pub fn build(self) -> Result<ClientCache> {
        let mut schemas: FxHashMap<String, Arc<TableSchema>> = FxHashMap::default();
        for schema in self.schemas {
            schema.validate()?;
            if schemas.contains_key(&schema.name) {
                return Err(SchemaError::DuplicateTable(schema.name).into());
            }
            schemas.insert(schema.name.clone(), Arc::new(schema));
        }
        tracing::debug!(
            tables = schemas.len(),
            policy = ?self.config.reconnect_policy,
            "client cache built"
        );
        let sink = self.sink.unwrap_or_else(|| Box::new(DiscardSink));
        Ok(ClientCache::from_parts(self.config, schemas, sink, self.hooks))
    }
}

impl fmt::Debug for ClientCacheBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCacheBuilder")
            .field("config", &self.config)
            .field(
                "tables",
                &self.schemas.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            )
            .field("sink", &self.sink.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnType;
    use crate::Error;

    fn orders() -> TableSchema {
        TableSchema::new("orders")
            .column("id", ColumnType::Int)
            .primary_key("id")
    }

    #[test]
    fn test_build_rejects_duplicate_tables() {
        let err = ClientCacheBuilder::new()
            .tables([orders(), orders()])
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            Error::Schema(SchemaError::DuplicateTable("orders".into()))
        );
    }

    #[test]
    fn test_build_rejects_invalid_schema() {
        let bad = TableSchema::new("t")
            .column("id", ColumnType::Int)
            .primary_key("missing");
        assert!(matches!(
            ClientCacheBuilder::new().table(bad).build(),
            Err(Error::Schema(SchemaError::UnknownPrimaryKey { .. }))
        ));
    }

    #[test]
    fn test_config_setters() {
        let cache = ClientCacheBuilder::new()
            .table(orders())
            .reconnect_policy(ReconnectPolicy::ClearSilently)
            .pair_primary_key_updates(false)
            .build()
            .unwrap();
        assert_eq!(cache.config().reconnect_policy, ReconnectPolicy::ClearSilently);
        assert!(!cache.config().pair_primary_key_updates);
        assert!(cache.schema("orders").is_some());
        assert!(cache.tables().is_empty());
    }
}
