use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

// Stable string identifier for a registered type; replaces ambient reflection
// with an explicit lookup.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeTag(Arc<str>);

impl TypeTag {
    pub fn new(tag: impl Into<Arc<str>>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TypeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TypeTag {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

impl From<String> for TypeTag {
    fn from(tag: String) -> Self {
        Self::new(tag)
    }
}

pub struct TypeRegistry<T> {
    entries: HashMap<TypeTag, T>,
}

impl<T> Default for TypeRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TypeRegistry<T> {
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    pub fn register(&mut self, tag: impl Into<TypeTag>, value: T) -> Option<T> {
        self.entries.insert(tag.into(), value)
    }

    pub fn contains(&self, tag: &TypeTag) -> bool {
        self.entries.contains_key(tag)
    }

    pub fn get(&self, tag: &TypeTag) -> Option<&T> {
        self.entries.get(tag)
    }

    // Unknown tags degrade to None; callers leave the field unset.
    pub fn resolve(&self, tag: &TypeTag) -> Option<&T> {
        let entry = self.entries.get(tag);
        if entry.is_none() {
            eprintln!("[registry] unknown type tag '{tag}'");
        }
        entry
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
