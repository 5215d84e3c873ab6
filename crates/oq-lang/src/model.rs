use std::cell::{Cell, RefCell};

use compact_str::CompactString;
use rustc_hash::FxHashMap;
#[cfg(feature = "ast-json")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::eval::value::Value;

#[cfg_attr(feature = "ast-json", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    Type,
    Attribute,
    Classifier,
    Singleton,
    Object,
}

/// An opaque reference into the external object model. The engine
/// never interprets the name beyond diagnostics; all access goes
/// through [`ObjectAccess`].
#[cfg_attr(feature = "ast-json", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelHandle {
    pub qualified_name: CompactString,
    pub kind: ModelKind,
    pub id: u64,
}

impl std::fmt::Display for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "`{}`", self.qualified_name)
    }
}

#[derive(Error, Debug, PartialEq, Clone)]
pub enum AccessError {
    #[error("Unknown object {0}")]
    UnknownObject(CompactString),
    #[error("No attribute `{attribute}` on {target}")]
    UnknownAttribute {
        target: CompactString,
        attribute: CompactString,
    },
    #[error("No active transaction for `{0}`")]
    NoTransaction(&'static str),
    #[error("{0}")]
    Other(String),
}

/// Maps backtick-quoted qualified names to live model entities.
pub trait ModelResolver {
    fn resolve(&self, qualified_name: &str) -> Option<ModelHandle>;
}

/// Value access into the object model. Mutating operations assume the
/// caller already opened a transaction on this thread; a missing
/// transaction is reported as [`AccessError::NoTransaction`] and is
/// never retried by the engine.
pub trait ObjectAccess {
    fn get(&self, handle: &ModelHandle, attribute: &str) -> Result<Value, AccessError>;
    fn set(&self, handle: &ModelHandle, attribute: &str, value: Value)
    -> Result<Value, AccessError>;
    fn add(&self, handle: &ModelHandle, attribute: &str, value: Value)
    -> Result<Value, AccessError>;
    fn new_object(&self, type_handle: &ModelHandle) -> Result<Value, AccessError>;
    fn delete(&self, handle: &ModelHandle) -> Result<Value, AccessError>;
    fn copy(&self, handle: &ModelHandle) -> Result<Value, AccessError>;
    fn instance_of(
        &self,
        handle: &ModelHandle,
        type_handle: &ModelHandle,
    ) -> Result<bool, AccessError>;
    fn referers(&self, handle: &ModelHandle, attribute: &str) -> Result<Value, AccessError>;
}

/// Sink for template rendering.
pub trait OutputWriter {
    fn write(&mut self, text: &str);
}

impl OutputWriter for String {
    fn write(&mut self, text: &str) {
        self.push_str(text);
    }
}

#[derive(Debug, Clone)]
struct ObjectRecord {
    type_name: CompactString,
    attrs: Vec<(CompactString, Value)>,
}

/// A small in-memory object model, used by the CLI and by tests. Not a
/// persistence layer: objects live for the lifetime of the model.
#[derive(Default)]
pub struct MemoryModel {
    entities: RefCell<FxHashMap<CompactString, ModelHandle>>,
    objects: RefCell<FxHashMap<u64, ObjectRecord>>,
    next_id: Cell<u64>,
    in_transaction: Cell<bool>,
}

impl MemoryModel {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_id(&self) -> u64 {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);
        id
    }

    /// Registers a named entity (type, attribute, classifier or
    /// singleton) so that model literals can resolve to it.
    pub fn register(&self, qualified_name: &str, kind: ModelKind) -> ModelHandle {
        let handle = ModelHandle {
            qualified_name: CompactString::new(qualified_name),
            kind,
            id: self.fresh_id(),
        };
        self.entities
            .borrow_mut()
            .insert(handle.qualified_name.clone(), handle.clone());
        handle
    }

    /// Creates an object of the named type without requiring a
    /// transaction; test fixture setup goes through here.
    pub fn create_object(&self, type_name: &str) -> ModelHandle {
        let id = self.fresh_id();
        let handle = ModelHandle {
            qualified_name: CompactString::new(format!("{type_name}@{id}")),
            kind: ModelKind::Object,
            id,
        };
        self.objects.borrow_mut().insert(
            id,
            ObjectRecord {
                type_name: CompactString::new(type_name),
                attrs: Vec::new(),
            },
        );
        handle
    }

    pub fn set_attr(&self, handle: &ModelHandle, attribute: &str, value: Value) {
        if let Some(record) = self.objects.borrow_mut().get_mut(&handle.id) {
            upsert(&mut record.attrs, attribute, value);
        }
    }

    pub fn begin_transaction(&self) {
        self.in_transaction.set(true);
    }

    pub fn end_transaction(&self) {
        self.in_transaction.set(false);
    }

    fn require_transaction(&self, op: &'static str) -> Result<(), AccessError> {
        if self.in_transaction.get() {
            Ok(())
        } else {
            Err(AccessError::NoTransaction(op))
        }
    }
}

fn upsert(attrs: &mut Vec<(CompactString, Value)>, attribute: &str, value: Value) {
    match attrs.iter_mut().find(|(k, _)| k == attribute) {
        Some((_, v)) => *v = value,
        None => attrs.push((CompactString::new(attribute), value)),
    }
}

impl ModelResolver for MemoryModel {
    fn resolve(&self, qualified_name: &str) -> Option<ModelHandle> {
        self.entities.borrow().get(qualified_name).cloned()
    }
}

impl ObjectAccess for MemoryModel {
    fn get(&self, handle: &ModelHandle, attribute: &str) -> Result<Value, AccessError> {
        let objects = self.objects.borrow();
        let record = objects
            .get(&handle.id)
            .ok_or_else(|| AccessError::UnknownObject(handle.qualified_name.clone()))?;
        Ok(record
            .attrs
            .iter()
            .find(|(k, _)| k == attribute)
            .map(|(_, v)| v.clone())
            .unwrap_or(Value::Null))
    }

    fn set(
        &self,
        handle: &ModelHandle,
        attribute: &str,
        value: Value,
    ) -> Result<Value, AccessError> {
        self.require_transaction("set")?;
        let mut objects = self.objects.borrow_mut();
        let record = objects
            .get_mut(&handle.id)
            .ok_or_else(|| AccessError::UnknownObject(handle.qualified_name.clone()))?;
        upsert(&mut record.attrs, attribute, value);
        Ok(Value::Model(handle.clone()))
    }

    fn add(
        &self,
        handle: &ModelHandle,
        attribute: &str,
        value: Value,
    ) -> Result<Value, AccessError> {
        self.require_transaction("add")?;
        let mut objects = self.objects.borrow_mut();
        let record = objects
            .get_mut(&handle.id)
            .ok_or_else(|| AccessError::UnknownObject(handle.qualified_name.clone()))?;
        match record.attrs.iter_mut().find(|(k, _)| k == attribute) {
            Some((_, Value::List(items))) => items.push(value),
            Some((_, existing)) => {
                let previous = std::mem::replace(existing, Value::Null);
                *existing = match previous {
                    Value::Null => value,
                    other => Value::List(vec![other, value]),
                };
            }
            None => record
                .attrs
                .push((CompactString::new(attribute), Value::List(vec![value]))),
        }
        Ok(Value::Model(handle.clone()))
    }

    fn new_object(&self, type_handle: &ModelHandle) -> Result<Value, AccessError> {
        self.require_transaction("new")?;
        let handle = self.create_object(type_handle.qualified_name.as_str());
        Ok(Value::Model(handle))
    }

    fn delete(&self, handle: &ModelHandle) -> Result<Value, AccessError> {
        self.require_transaction("delete")?;
        self.objects
            .borrow_mut()
            .remove(&handle.id)
            .ok_or_else(|| AccessError::UnknownObject(handle.qualified_name.clone()))?;
        Ok(Value::Null)
    }

    fn copy(&self, handle: &ModelHandle) -> Result<Value, AccessError> {
        self.require_transaction("copy")?;
        let record = self
            .objects
            .borrow()
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| AccessError::UnknownObject(handle.qualified_name.clone()))?;
        let id = self.fresh_id();
        let copy = ModelHandle {
            qualified_name: CompactString::new(format!("{}@{id}", record.type_name)),
            kind: ModelKind::Object,
            id,
        };
        self.objects.borrow_mut().insert(id, record);
        Ok(Value::Model(copy))
    }

    fn instance_of(
        &self,
        handle: &ModelHandle,
        type_handle: &ModelHandle,
    ) -> Result<bool, AccessError> {
        let objects = self.objects.borrow();
        let record = objects
            .get(&handle.id)
            .ok_or_else(|| AccessError::UnknownObject(handle.qualified_name.clone()))?;
        Ok(record.type_name == type_handle.qualified_name)
    }

    fn referers(&self, handle: &ModelHandle, attribute: &str) -> Result<Value, AccessError> {
        let objects = self.objects.borrow();
        let mut result = Vec::new();
        for (id, record) in objects.iter() {
            let refers = record.attrs.iter().any(|(k, v)| {
                k == attribute
                    && match v {
                        Value::Model(m) => m.id == handle.id,
                        Value::List(items) => items
                            .iter()
                            .any(|v| matches!(v, Value::Model(m) if m.id == handle.id)),
                        _ => false,
                    }
            });
            if refers {
                result.push(Value::Model(ModelHandle {
                    qualified_name: CompactString::new(format!("{}@{id}", record.type_name)),
                    kind: ModelKind::Object,
                    id: *id,
                }));
            }
        }
        Ok(Value::Set(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_registered_entity() {
        let model = MemoryModel::new();
        let handle = model.register("Accounts:User", ModelKind::Type);
        assert_eq!(model.resolve("Accounts:User"), Some(handle));
        assert_eq!(model.resolve("Accounts:Missing"), None);
    }

    #[test]
    fn test_get_missing_attribute_is_null() {
        let model = MemoryModel::new();
        let user = model.create_object("Accounts:User");
        assert_eq!(model.get(&user, "name"), Ok(Value::Null));
    }

    #[test]
    fn test_set_requires_transaction() {
        let model = MemoryModel::new();
        let user = model.create_object("Accounts:User");
        assert_eq!(
            model.set(&user, "name", Value::String("u".into())),
            Err(AccessError::NoTransaction("set"))
        );
        model.begin_transaction();
        model
            .set(&user, "name", Value::String("u".into()))
            .unwrap();
        assert_eq!(model.get(&user, "name"), Ok(Value::String("u".into())));
    }

    #[test]
    fn test_referers_finds_back_references() {
        let model = MemoryModel::new();
        let group = model.create_object("Accounts:Group");
        let user = model.create_object("Accounts:User");
        model.set_attr(&user, "group", Value::Model(group.clone()));
        match model.referers(&group, "group").unwrap() {
            Value::Set(members) => {
                assert_eq!(members.len(), 1);
                assert!(matches!(&members[0], Value::Model(m) if m.id == user.id));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
