//! Property Attributes
//!
//! A property value always travels together with the constraint describing
//! which values the backend currently accepts.

use serde::{Deserialize, Serialize};

/// Constraint attached to a property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PropertyAttribute<T> {
    /// The property is not supported by the backend
    Unavailable,
    /// Any value is accepted
    NoConstraint,
    /// Values within `min..=max`
    Range { min: T, max: T },
    /// Only the listed values
    AvailableValues { values: Vec<T> },
}

impl<T> Default for PropertyAttribute<T> {
    fn default() -> Self {
        PropertyAttribute::Unavailable
    }
}

impl<T: PartialOrd> PropertyAttribute<T> {
    pub fn range(min: T, max: T) -> Self {
        PropertyAttribute::Range { min, max }
    }

    pub fn is_available(&self) -> bool {
        !matches!(self, PropertyAttribute::Unavailable)
    }

    /// Whether `value` satisfies this constraint
    pub fn permits(&self, value: &T) -> bool {
        match self {
            PropertyAttribute::Unavailable => false,
            PropertyAttribute::NoConstraint => true,
            PropertyAttribute::Range { min, max } => value >= min && value <= max,
            PropertyAttribute::AvailableValues { values } => values.contains(value),
        }
    }
}

/// A value paired with its current constraint
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Property<T> {
    pub value: T,
    pub attribute: PropertyAttribute<T>,
}

impl<T: PartialOrd> Property<T> {
    pub fn new(value: T, attribute: PropertyAttribute<T>) -> Self {
        Self { value, attribute }
    }

    pub fn unconstrained(value: T) -> Self {
        Self::new(value, PropertyAttribute::NoConstraint)
    }

    /// Replace the value if the attribute permits it.
    pub fn try_set(&mut self, value: T) -> bool {
        if self.attribute.permits(&value) {
            self.value = value;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_permits() {
        let attr = PropertyAttribute::range(0, 10);
        assert!(attr.permits(&0));
        assert!(attr.permits(&10));
        assert!(!attr.permits(&11));
        assert!(!attr.permits(&-1));
    }

    #[test]
    fn test_available_values() {
        let attr = PropertyAttribute::AvailableValues {
            values: vec!["am".to_string(), "fm".to_string()],
        };
        assert!(attr.permits(&"fm".to_string()));
        assert!(!attr.permits(&"dab".to_string()));
    }

    #[test]
    fn test_unavailable_rejects_everything() {
        let mut prop = Property::new(3, PropertyAttribute::Unavailable);
        assert!(!prop.try_set(4));
        assert_eq!(prop.value, 3);
        assert!(!prop.attribute.is_available());
    }

    #[test]
    fn test_try_set_within_range() {
        let mut prop = Property::new(2, PropertyAttribute::range(0, 10));
        assert!(prop.try_set(7));
        assert!(!prop.try_set(12));
        assert_eq!(prop.value, 7);
    }
}
