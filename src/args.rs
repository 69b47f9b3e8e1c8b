use std::any::Any;

use crate::core::Dynamic;
use crate::engine::Require;

/// A single positional argument handed to a callback.
#[derive(Clone)]
pub enum Argument {
    /// The produced value of the dependency at this position.
    Value(Dynamic),
    /// The dependency produced nothing, or it is a cyclic peer that has not
    /// finished executing yet.
    Undefined,
    /// The dynamic resolution capability, injected at the sentinel position.
    Require(Require),
}

impl std::fmt::Debug for Argument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Argument::Value(_) => write!(f, "Value(..)"),
            Argument::Undefined => write!(f, "Undefined"),
            Argument::Require(_) => write!(f, "Require"),
        }
    }
}

/// Arguments of a callback, in the order the dependencies were declared.
///
/// The order is independent of the order in which the underlying fetches
/// completed.
#[derive(Clone, Debug, Default)]
pub struct Arguments {
    items: Vec<Argument>,
}

impl Arguments {
    pub(crate) fn new(items: Vec<Argument>) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn argument(&self, index: usize) -> Option<&Argument> {
        self.items.get(index)
    }

    /// Returns the produced value at `index` downcast to `T`.
    pub fn get<T: Any>(&self, index: usize) -> Option<&T> {
        self.value(index).and_then(|value| value.downcast_ref::<T>())
    }

    pub fn value(&self, index: usize) -> Option<&Dynamic> {
        match self.items.get(index) {
            Some(Argument::Value(value)) => Some(value),
            _ => None,
        }
    }

    pub fn is_undefined(&self, index: usize) -> bool {
        matches!(self.items.get(index), Some(Argument::Undefined))
    }

    /// Returns the first injected require capability, if the sentinel was
    /// declared.
    pub fn require(&self) -> Option<&Require> {
        self.items.iter().find_map(|item| match item {
            Argument::Require(require) => Some(require),
            _ => None,
        })
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Argument> {
        self.items.iter()
    }
}

impl<'a> IntoIterator for &'a Arguments {
    type Item = &'a Argument;
    type IntoIter = std::slice::Iter<'a, Argument>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
