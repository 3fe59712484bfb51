//! Mapper registry.
//!
//! An explicit registration table from a string alias to a mapper factory,
//! populated at startup. Dynamic mapper kinds (scripted, custom) plug in
//! through `register`; nothing is discovered by reflection.

use crate::connections::model::MapperDefinition;
use crate::mapping::mapper::{
    DuplicatingMapper, MessageMapper, ProtocolJsonMapper, RawPayloadMapper,
};
use crate::protocol::error::GatewayError;
use std::collections::HashMap;
use std::sync::Arc;

/// Builds a configured mapper from its definition.
pub type MapperFactory =
    Arc<dyn Fn(&MapperDefinition) -> Result<Box<dyn MessageMapper>, GatewayError> + Send + Sync>;

#[derive(Clone)]
pub struct MapperRegistry {
    factories: HashMap<String, MapperFactory>,
}

impl MapperRegistry {
    /// Registry holding the built-in mappers.
    pub fn builtin() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(ProtocolJsonMapper::ALIAS, Arc::new(|_| {
            let mapper: Box<dyn MessageMapper> = Box::new(ProtocolJsonMapper);
            Ok(mapper)
        }));
        registry.register(RawPayloadMapper::ALIAS, Arc::new(|_| {
            let mapper: Box<dyn MessageMapper> = Box::new(RawPayloadMapper);
            Ok(mapper)
        }));
        registry.register(DuplicatingMapper::ALIAS, Arc::new(|definition| {
            let mapper: Box<dyn MessageMapper> =
                Box::new(DuplicatingMapper::from_definition(definition)?);
            Ok(mapper)
        }));
        registry
    }

    pub fn register(&mut self, alias: impl Into<String>, factory: MapperFactory) {
        self.factories.insert(alias.into(), factory);
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.factories.contains_key(alias)
    }

    pub fn instantiate(
        &self,
        definition: &MapperDefinition,
    ) -> Result<Box<dyn MessageMapper>, GatewayError> {
        let factory = self.factories.get(&definition.engine).ok_or_else(|| {
            GatewayError::configuration_invalid(format!(
                "unknown mapping engine '{}'",
                definition.engine
            ))
        })?;
        factory(definition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_aliases_present() {
        let registry = MapperRegistry::builtin();
        assert!(registry.contains("protocol-json"));
        assert!(registry.contains("raw"));
        assert!(registry.contains("duplicator"));
        assert!(!registry.contains("javascript"));
    }

    #[test]
    fn test_unknown_engine_is_validation_error() {
        let registry = MapperRegistry::builtin();
        let err = registry
            .instantiate(&MapperDefinition::new("javascript"))
            .err()
            .unwrap();
        assert_eq!(err.code, "connectivity:connection.configuration.invalid");
    }

    #[test]
    fn test_custom_registration() {
        let mut registry = MapperRegistry::builtin();
        registry.register("custom", Arc::new(|_| {
            let mapper: Box<dyn MessageMapper> = Box::new(ProtocolJsonMapper);
            Ok(mapper)
        }));
        assert!(registry.instantiate(&MapperDefinition::new("custom")).is_ok());
    }
}
