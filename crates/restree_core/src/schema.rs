//! Explicit resource type registry.
//!
//! Every resource type is registered up front with the type it extends, its
//! named optional child slots and, for list slots, the element type. The
//! registry answers the questions the index and the overlay ask on every
//! structural operation:
//!
//! - which [`TypeKey`] a type stores its value under,
//! - whether a child name is a declared slot of a type (and of which type),
//! - whether one type may stand in for another (covariance).
//!
//! ```rust
//! use restree_core::schema::{builtin, SchemaRegistry, TypeDef};
//! use restree_core::TypeKey;
//!
//! let mut schema = SchemaRegistry::new();
//! schema
//!     .register(TypeDef::new("TemperatureSensor").slot("reading", builtin::FLOAT))
//!     .unwrap();
//! assert_eq!(schema.slot("TemperatureSensor", "reading").unwrap().type_name, builtin::FLOAT);
//! assert_eq!(schema.type_key(builtin::FLOAT), Some(TypeKey::Float));
//! ```

use crate::error::{CoreError, CoreResult};
use crate::types::TypeKey;
use std::collections::HashMap;

/// Names of the types every registry starts with.
pub mod builtin {
    /// Root of all structured types.
    pub const RESOURCE: &str = "Resource";
    /// Homogeneous list of structured resources.
    pub const RESOURCE_LIST: &str = "ResourceList";
    /// Boolean leaf.
    pub const BOOLEAN: &str = "BooleanResource";
    /// Integer leaf.
    pub const INTEGER: &str = "IntegerResource";
    /// Time stamp leaf (milliseconds).
    pub const TIME: &str = "TimeResource";
    /// Float leaf.
    pub const FLOAT: &str = "FloatResource";
    /// String leaf.
    pub const STRING: &str = "StringResource";
    /// Opaque bytes leaf.
    pub const BYTE_ARRAY: &str = "ByteArrayResource";
    /// Boolean array leaf.
    pub const BOOLEAN_ARRAY: &str = "BooleanArrayResource";
    /// Integer array leaf.
    pub const INTEGER_ARRAY: &str = "IntegerArrayResource";
    /// Time stamp array leaf.
    pub const TIME_ARRAY: &str = "TimeArrayResource";
    /// Float array leaf.
    pub const FLOAT_ARRAY: &str = "FloatArrayResource";
    /// String array leaf.
    pub const STRING_ARRAY: &str = "StringArrayResource";
}

/// A named, typed optional child declared by a resource type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    /// Child name.
    pub name: String,
    /// Declared child type.
    pub type_name: String,
    /// Element type, for slots of list type.
    pub element_type: Option<String>,
}

/// A registered resource type.
#[derive(Debug, Clone)]
pub struct ResourceType {
    name: String,
    extends: Option<String>,
    key: TypeKey,
    slots: Vec<Slot>,
}

impl ResourceType {
    /// Type name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The type this one extends.
    #[must_use]
    pub fn extends(&self) -> Option<&str> {
        self.extends.as_deref()
    }

    /// Storage key.
    #[must_use]
    pub fn key(&self) -> TypeKey {
        self.key
    }

    /// Slots declared by this type itself, in declaration order.
    #[must_use]
    pub fn own_slots(&self) -> &[Slot] {
        &self.slots
    }
}

/// Definition of a type to register.
#[derive(Debug, Clone)]
pub struct TypeDef {
    name: String,
    extends: String,
    slots: Vec<Slot>,
}

impl TypeDef {
    /// Starts a definition extending [`builtin::RESOURCE`].
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extends: builtin::RESOURCE.to_string(),
            slots: Vec::new(),
        }
    }

    /// Sets the extended type. The storage key is inherited from it.
    #[must_use]
    pub fn extends(mut self, parent: impl Into<String>) -> Self {
        self.extends = parent.into();
        self
    }

    /// Declares an optional child.
    #[must_use]
    pub fn slot(mut self, name: impl Into<String>, type_name: impl Into<String>) -> Self {
        self.slots.push(Slot {
            name: name.into(),
            type_name: type_name.into(),
            element_type: None,
        });
        self
    }

    /// Declares an optional child of list type holding `element_type`.
    #[must_use]
    pub fn list_slot(mut self, name: impl Into<String>, element_type: impl Into<String>) -> Self {
        self.slots.push(Slot {
            name: name.into(),
            type_name: builtin::RESOURCE_LIST.to_string(),
            element_type: Some(element_type.into()),
        });
        self
    }
}

/// Registry of all known resource types.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    types: HashMap<String, ResourceType>,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaRegistry {
    /// Creates a registry holding the builtin types.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self {
            types: HashMap::new(),
        };
        registry.insert(builtin::RESOURCE, None, TypeKey::Complex);
        let leaves = [
            (builtin::RESOURCE_LIST, TypeKey::ComplexArr),
            (builtin::BOOLEAN, TypeKey::Boolean),
            (builtin::INTEGER, TypeKey::Int),
            (builtin::TIME, TypeKey::Long),
            (builtin::FLOAT, TypeKey::Float),
            (builtin::STRING, TypeKey::String),
            (builtin::BYTE_ARRAY, TypeKey::Opaque),
            (builtin::BOOLEAN_ARRAY, TypeKey::BooleanArr),
            (builtin::INTEGER_ARRAY, TypeKey::IntArr),
            (builtin::TIME_ARRAY, TypeKey::LongArr),
            (builtin::FLOAT_ARRAY, TypeKey::FloatArr),
            (builtin::STRING_ARRAY, TypeKey::StringArr),
        ];
        for (name, key) in leaves {
            registry.insert(name, Some(builtin::RESOURCE), key);
        }
        registry
    }

    fn insert(&mut self, name: &str, extends: Option<&str>, key: TypeKey) {
        self.types.insert(
            name.to_string(),
            ResourceType {
                name: name.to_string(),
                extends: extends.map(str::to_string),
                key,
                slots: Vec::new(),
            },
        );
    }

    /// Registers a type.
    ///
    /// Slot types may name types registered later; they are checked when a
    /// child is actually added.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidType`] if the name is taken, the extended
    /// type is unknown, or a slot name is declared twice along the
    /// inheritance chain.
    pub fn register(&mut self, def: TypeDef) -> CoreResult<()> {
        if self.types.contains_key(&def.name) {
            return Err(CoreError::invalid_type(format!(
                "type {} is already registered",
                def.name
            )));
        }
        let parent = self.types.get(&def.extends).ok_or_else(|| {
            CoreError::invalid_type(format!(
                "type {} extends unknown type {}",
                def.name, def.extends
            ))
        })?;
        let key = parent.key;
        for (i, slot) in def.slots.iter().enumerate() {
            let redeclared = def.slots[..i].iter().any(|s| s.name == slot.name)
                || self.slot(&def.extends, &slot.name).is_some();
            if redeclared {
                return Err(CoreError::invalid_type(format!(
                    "slot {} declared twice for type {}",
                    slot.name, def.name
                )));
            }
        }
        tracing::debug!(type_name = %def.name, slots = def.slots.len(), "registered resource type");
        self.types.insert(
            def.name.clone(),
            ResourceType {
                name: def.name,
                extends: Some(def.extends),
                key,
                slots: def.slots,
            },
        );
        Ok(())
    }

    /// Looks up a type.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourceType> {
        self.types.get(name)
    }

    /// Returns `true` if the type is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Storage key of a type.
    #[must_use]
    pub fn type_key(&self, name: &str) -> Option<TypeKey> {
        self.types.get(name).map(|t| t.key)
    }

    /// Finds a slot declared by `type_name` or any type it extends.
    #[must_use]
    pub fn slot(&self, type_name: &str, slot_name: &str) -> Option<&Slot> {
        let mut current = self.types.get(type_name);
        while let Some(t) = current {
            if let Some(slot) = t.slots.iter().find(|s| s.name == slot_name) {
                return Some(slot);
            }
            current = t.extends.as_deref().and_then(|p| self.types.get(p));
        }
        None
    }

    /// All slots of a type, inherited ones first.
    #[must_use]
    pub fn slots(&self, type_name: &str) -> Vec<&Slot> {
        let mut chain = Vec::new();
        let mut current = self.types.get(type_name);
        while let Some(t) = current {
            chain.push(t);
            current = t.extends.as_deref().and_then(|p| self.types.get(p));
        }
        chain.iter().rev().flat_map(|t| t.slots.iter()).collect()
    }

    /// Returns `true` if a resource of type `actual` may be used where
    /// `declared` is expected.
    #[must_use]
    pub fn is_assignable(&self, declared: &str, actual: &str) -> bool {
        let mut current = Some(actual);
        while let Some(name) = current {
            if name == declared {
                return true;
            }
            current = self.types.get(name).and_then(|t| t.extends.as_deref());
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SchemaRegistry {
        let mut schema = SchemaRegistry::new();
        schema
            .register(TypeDef::new("TemperatureResource").extends(builtin::FLOAT))
            .unwrap();
        schema
            .register(
                TypeDef::new("GeographicLocation")
                    .slot("latitudeArcMinutes", builtin::FLOAT)
                    .slot("longitudeArcMinutes", builtin::FLOAT),
            )
            .unwrap();
        schema
            .register(TypeDef::new("Location").slot("geographicLocation", "GeographicLocation"))
            .unwrap();
        schema
            .register(
                TypeDef::new("PhysicalElement")
                    .slot("location", "Location")
                    .slot("name", builtin::STRING),
            )
            .unwrap();
        schema
            .register(
                TypeDef::new("Room")
                    .extends("PhysicalElement")
                    .slot("temperature", "TemperatureResource")
                    .list_slot("readings", builtin::FLOAT),
            )
            .unwrap();
        schema
    }

    #[test]
    fn builtin_keys() {
        let schema = SchemaRegistry::new();
        assert_eq!(schema.type_key(builtin::TIME), Some(TypeKey::Long));
        assert_eq!(schema.type_key(builtin::BYTE_ARRAY), Some(TypeKey::Opaque));
        assert_eq!(schema.type_key(builtin::RESOURCE_LIST), Some(TypeKey::ComplexArr));
        assert_eq!(schema.type_key("Nope"), None);
    }

    #[test]
    fn subtypes_inherit_key_and_slots() {
        let schema = registry();
        assert_eq!(schema.type_key("TemperatureResource"), Some(TypeKey::Float));
        assert_eq!(schema.slot("Room", "location").unwrap().type_name, "Location");
        let names: Vec<_> = schema.slots("Room").iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["location", "name", "temperature", "readings"]);
    }

    #[test]
    fn list_slots_carry_element_type() {
        let schema = registry();
        let slot = schema.slot("Room", "readings").unwrap();
        assert_eq!(slot.type_name, builtin::RESOURCE_LIST);
        assert_eq!(slot.element_type.as_deref(), Some(builtin::FLOAT));
    }

    #[test]
    fn assignability_follows_inheritance() {
        let schema = registry();
        assert!(schema.is_assignable(builtin::FLOAT, "TemperatureResource"));
        assert!(schema.is_assignable("PhysicalElement", "Room"));
        assert!(schema.is_assignable(builtin::RESOURCE, "Room"));
        assert!(!schema.is_assignable("Room", "PhysicalElement"));
        assert!(!schema.is_assignable(builtin::FLOAT, builtin::INTEGER));
    }

    #[test]
    fn register_rejects_bad_definitions() {
        let mut schema = registry();
        assert!(schema.register(TypeDef::new("Room")).is_err());
        assert!(schema.register(TypeDef::new("X").extends("Missing")).is_err());
        assert!(schema
            .register(TypeDef::new("Y").extends("Room").slot("location", "Location"))
            .is_err());
        assert!(schema
            .register(TypeDef::new("Z").slot("a", builtin::FLOAT).slot("a", builtin::FLOAT))
            .is_err());
    }
}
