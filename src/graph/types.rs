// src/graph/types.rs

//! Named data types and the pluggable compatibility check used by the
//! compiler when it type-checks edges.

use std::collections::BTreeSet;
use std::fmt::Debug;

/// Compatible with every other type, in both directions.
pub const ANY: &str = "Any";

/// Ordering-only type: the consumer waits for the producer but receives no
/// value.
pub const NOTHING: &str = "Nothing";

/// `List[T]` for a given item type.
pub fn list_of(item: &str) -> String {
    format!("List[{item}]")
}

/// Item type of a `List[T]` type name, if it is one.
pub fn list_item_type(type_name: &str) -> Option<&str> {
    type_name
        .trim()
        .strip_prefix("List[")
        .and_then(|rest| rest.strip_suffix(']'))
        .map(|s| s.trim())
}

/// Decides whether values produced as `producer` may flow into an input
/// declared as `consumer`.
pub trait TypeCompatibility: Send + Sync + Debug {
    fn is_compatible(&self, producer: &str, consumer: &str) -> bool;
}

/// Default compatibility check: exact match, `Any` on either side, `Nothing`
/// consumers, element-wise lists, plus explicitly registered coercions.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    coercions: BTreeSet<(String, String)>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow values of type `from` to feed inputs of type `to`.
    pub fn with_coercion(mut self, from: &str, to: &str) -> Self {
        self.register_coercion(from, to);
        self
    }

    pub fn register_coercion(&mut self, from: &str, to: &str) {
        self.coercions.insert((from.to_string(), to.to_string()));
    }
}

impl TypeCompatibility for TypeRegistry {
    fn is_compatible(&self, producer: &str, consumer: &str) -> bool {
        if producer == consumer || consumer == ANY || consumer == NOTHING || producer == ANY {
            return true;
        }
        if producer == NOTHING {
            return false;
        }
        if self
            .coercions
            .contains(&(producer.to_string(), consumer.to_string()))
        {
            return true;
        }
        match (list_item_type(producer), list_item_type(consumer)) {
            (Some(p), Some(c)) => self.is_compatible(p, c),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_any_and_nothing() {
        let reg = TypeRegistry::new();
        assert!(reg.is_compatible("Int", "Int"));
        assert!(reg.is_compatible("Int", ANY));
        assert!(reg.is_compatible(ANY, "String"));
        assert!(reg.is_compatible("Int", NOTHING));
        assert!(!reg.is_compatible(NOTHING, "Int"));
        assert!(!reg.is_compatible("Int", "String"));
    }

    #[test]
    fn registered_coercions_and_lists() {
        let reg = TypeRegistry::new().with_coercion("Int", "Float");
        assert!(reg.is_compatible("Int", "Float"));
        assert!(!reg.is_compatible("Float", "Int"));
        assert!(reg.is_compatible("List[Int]", "List[Float]"));
        assert_eq!(list_item_type("List[ String ]"), Some("String"));
        assert_eq!(list_item_type("String"), None);
    }
}
