//! Operation types shared by all connectors: object identifiers, attribute
//! sets and search filters.
//!
//! Attribute values are modeled as ordered lists per attribute name, so a
//! multi-valued attribute preserves the order in which the target system
//! reported its values.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::ids::ResourceId;

/// Identifier of an object in a target system.
///
/// Different systems key their objects differently (LDAP DN, database
/// primary key, REST resource id); the attribute name records which scheme
/// is in use.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Uid {
    attribute_name: String,
    value: String,
}

impl Uid {
    /// Create a new UID with the given attribute name and value.
    pub fn new(attribute_name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            attribute_name: attribute_name.into(),
            value: value.into(),
        }
    }

    /// Create a UID using the default "uid" attribute name.
    pub fn from_value(value: impl Into<String>) -> Self {
        Self::new("uid", value)
    }

    /// Get the attribute name.
    #[must_use]
    pub fn attribute_name(&self) -> &str {
        &self.attribute_name
    }

    /// Get the value.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.attribute_name, self.value)
    }
}

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// No value.
    Null,
    /// String value.
    String(String),
    /// Integer value.
    Integer(i64),
    /// Boolean value.
    Boolean(bool),
}

impl AttributeValue {
    /// Get as a string if this is a string value.
    #[must_use]
    pub fn as_string(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as an integer if this is an integer value.
    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            AttributeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as a boolean if this is a boolean value.
    #[must_use]
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            AttributeValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Check if this is a null value.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::String(s)
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::String(s.to_string())
    }
}

impl From<i64> for AttributeValue {
    fn from(i: i64) -> Self {
        AttributeValue::Integer(i)
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        AttributeValue::Boolean(b)
    }
}

/// A set of attributes: attribute name mapped to an ordered list of values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeSet {
    #[serde(flatten)]
    attributes: HashMap<String, Vec<AttributeValue>>,
}

impl AttributeSet {
    /// Create a new empty attribute set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            attributes: HashMap::new(),
        }
    }

    /// Replace an attribute with a single value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes.insert(name.into(), vec![value.into()]);
    }

    /// Replace an attribute with an ordered list of values.
    pub fn set_values(&mut self, name: impl Into<String>, values: Vec<AttributeValue>) {
        self.attributes.insert(name.into(), values);
    }

    /// Append a value to an attribute, preserving existing values.
    pub fn add_value(&mut self, name: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes
            .entry(name.into())
            .or_default()
            .push(value.into());
    }

    /// Set an attribute using the builder pattern.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Get all values of an attribute, in order.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[AttributeValue]> {
        self.attributes.get(name).map(Vec::as_slice)
    }

    /// Get the first value of an attribute.
    #[must_use]
    pub fn get_single(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name).and_then(|v| v.first())
    }

    /// Get the first value of an attribute as a string.
    #[must_use]
    pub fn get_string(&self, name: &str) -> Option<&str> {
        self.get_single(name).and_then(AttributeValue::as_string)
    }

    /// Check if an attribute exists.
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    /// Remove an attribute, returning its values.
    pub fn remove(&mut self, name: &str) -> Option<Vec<AttributeValue>> {
        self.attributes.remove(name)
    }

    /// Iterate over all attribute names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }

    /// Iterate over all attributes and their values.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<AttributeValue>)> {
        self.attributes.iter()
    }

    /// Get the number of attributes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// Check if the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

impl FromIterator<(String, Vec<AttributeValue>)> for AttributeSet {
    fn from_iter<T: IntoIterator<Item = (String, Vec<AttributeValue>)>>(iter: T) -> Self {
        Self {
            attributes: iter.into_iter().collect(),
        }
    }
}

/// Filter for search operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Filter {
    /// Match objects where the attribute equals the value.
    Equals { attribute: String, value: String },

    /// Match objects where the attribute contains the value as a substring.
    Contains { attribute: String, value: String },

    /// Match objects where the attribute has any value.
    Present { attribute: String },

    /// Logical AND of multiple filters.
    And { filters: Vec<Filter> },

    /// Logical OR of multiple filters.
    Or { filters: Vec<Filter> },

    /// Logical NOT of a filter.
    Not { filter: Box<Filter> },
}

impl Filter {
    /// Create an equals filter.
    pub fn eq(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Equals {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// Create a contains filter.
    pub fn contains(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Contains {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// Create a present filter.
    pub fn present(attribute: impl Into<String>) -> Self {
        Filter::Present {
            attribute: attribute.into(),
        }
    }

    /// Combine this filter with another using AND.
    #[must_use]
    pub fn and_with(self, other: Filter) -> Self {
        match self {
            Filter::And { mut filters } => {
                filters.push(other);
                Filter::And { filters }
            }
            _ => Filter::And {
                filters: vec![self, other],
            },
        }
    }
}

/// Reference to an external resource reachable through a connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    /// Resource identifier.
    pub id: ResourceId,
    /// Human-readable resource name.
    pub name: String,
    /// Object class provisioned on this resource (e.g. "user").
    pub object_class: String,
}

impl ResourceRef {
    /// Create a new resource reference.
    pub fn new(id: ResourceId, name: impl Into<String>, object_class: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            object_class: object_class.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid() {
        let uid = Uid::new("dn", "cn=alice,ou=people,dc=example,dc=org");
        assert_eq!(uid.attribute_name(), "dn");
        assert_eq!(uid.to_string(), "dn=cn=alice,ou=people,dc=example,dc=org");

        let uid = Uid::from_value("alice");
        assert_eq!(uid.attribute_name(), "uid");
        assert_eq!(uid.value(), "alice");
    }

    #[test]
    fn test_attribute_set_single_values() {
        let attrs = AttributeSet::new()
            .with("email", "alice@example.org")
            .with("active", true)
            .with("logins", 42i64);

        assert_eq!(attrs.get_string("email"), Some("alice@example.org"));
        assert_eq!(
            attrs.get_single("active").and_then(AttributeValue::as_boolean),
            Some(true)
        );
        assert_eq!(
            attrs.get_single("logins").and_then(AttributeValue::as_integer),
            Some(42)
        );
        assert!(!attrs.has("missing"));
    }

    #[test]
    fn test_attribute_set_value_order() {
        let mut attrs = AttributeSet::new();
        attrs.add_value("groups", "admins");
        attrs.add_value("groups", "users");
        attrs.add_value("groups", "auditors");

        let groups: Vec<&str> = attrs
            .get("groups")
            .unwrap()
            .iter()
            .filter_map(AttributeValue::as_string)
            .collect();
        assert_eq!(groups, vec!["admins", "users", "auditors"]);
    }

    #[test]
    fn test_attribute_set_equality() {
        let a = AttributeSet::new().with("email", "a@example.org").with("n", 1i64);
        let b = AttributeSet::new().with("n", 1i64).with("email", "a@example.org");
        assert_eq!(a, b);

        let c = b.clone().with("email", "other@example.org");
        assert_ne!(a, c);
    }

    #[test]
    fn test_filter_and_with() {
        let filter = Filter::eq("email", "alice@example.org")
            .and_with(Filter::present("active"))
            .and_with(Filter::contains("name", "ali"));

        if let Filter::And { filters } = filter {
            assert_eq!(filters.len(), 3);
        } else {
            panic!("expected AND filter");
        }
    }

    #[test]
    fn test_attribute_set_serialization() {
        let attrs = AttributeSet::new().with("email", "alice@example.org");
        let json = serde_json::to_string(&attrs).unwrap();
        let parsed: AttributeSet = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.get_string("email"), Some("alice@example.org"));
    }
}
