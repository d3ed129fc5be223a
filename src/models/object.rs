//! Key/value object model
//!
//! Properties are overwritten by whichever mutation is applied last. Since
//! every peer applies mutations in the same order, every peer ends up with the
//! same properties.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{Model, StateMachine};

/// A property value
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn int(n: i64) -> Self {
        Value::Int(n)
    }

    pub fn bool(b: bool) -> Self {
        Value::Bool(b)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ObjectMutation {
    Set { key: String, value: Value },
    Remove { key: String },
}

impl ObjectMutation {
    pub fn set(key: impl Into<String>, value: Value) -> Self {
        ObjectMutation::Set {
            key: key.into(),
            value,
        }
    }

    pub fn remove(key: impl Into<String>) -> Self {
        ObjectMutation::Remove { key: key.into() }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectModel {
    properties: BTreeMap<String, Value>,
}

impl ObjectModel {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn properties(&self) -> &BTreeMap<String, Value> {
        &self.properties
    }
}

impl StateMachine for ObjectModel {
    type Mutation = ObjectMutation;
    type Snapshot = BTreeMap<String, Value>;

    fn process(&mut self, mutation: ObjectMutation) {
        match mutation {
            ObjectMutation::Set { key, value } => {
                self.properties.insert(key, value);
            }
            ObjectMutation::Remove { key } => {
                self.properties.remove(&key);
            }
        }
    }

    fn snapshot(&self) -> Option<Self::Snapshot> {
        Some(self.properties.clone())
    }

    fn reset(&mut self, snapshot: Self::Snapshot) {
        self.properties = snapshot;
    }
}

impl Model for ObjectModel {
    const TYPE_NAME: &'static str = "feedspace:object";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_set_wins() {
        let mut model = ObjectModel::default();
        model.process(ObjectMutation::set("name", Value::string("a")));
        model.process(ObjectMutation::set("name", Value::string("b")));
        assert_eq!(model.get("name").and_then(Value::as_str), Some("b"));

        model.process(ObjectMutation::remove("name"));
        assert!(model.get("name").is_none());
    }

    #[test]
    fn test_nested_values_survive_cbor() {
        let mut map = BTreeMap::new();
        map.insert("xs".to_string(), Value::List(vec![Value::int(1), Value::Null]));
        let value = Value::Map(map);
        let bytes = crate::codec::encode(&value).unwrap();
        let back: Value = crate::codec::decode(&bytes).unwrap();
        assert_eq!(back, value);
    }
}
