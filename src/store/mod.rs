//! Run-scoped shared store.
//!
//! A [`Store`] is created at the start of every run and handed to each task
//! at construction and for every phase. Tasks publish facts (for example the
//! list of routers found during introspection) under keys namespaced by the
//! producing task so that successors can resolve names to provider
//! identifiers. Nothing in the store survives the run.

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

/// Errors raised when reading from the [`Store`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StoreError {
    /// Raised when no value has been published under the key.
    #[error("store key `{key}` has not been published")]
    Missing {
        /// Key that was requested.
        key: String,
    },
    /// Raised when the key holds a value of a different type.
    #[error("store key `{key}` does not hold a value of type `{expected}`")]
    TypeMismatch {
        /// Key that was requested.
        key: String,
        /// Type name the caller asked for.
        expected: &'static str,
    },
}

/// Builds a store key namespaced by the producing task identity.
///
/// ```
/// assert_eq!(contractor::store::key("router", "existing"), "router.existing");
/// ```
#[must_use]
pub fn key(namespace: &str, name: &str) -> String {
    format!("{namespace}.{name}")
}

/// Mutable key/value table shared by every task within one run.
#[derive(Default)]
pub struct Store {
    entries: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl Store {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes `value` under `key`, returning `true` when an earlier value
    /// was replaced.
    pub fn insert<T>(&mut self, key: impl Into<String>, value: T) -> bool
    where
        T: Any + Send + Sync,
    {
        self.entries.insert(key.into(), Box::new(value)).is_some()
    }

    /// Borrows the value published under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Missing`] when nothing was published and
    /// [`StoreError::TypeMismatch`] when the value has another type.
    pub fn get<T: Any>(&self, key: &str) -> Result<&T, StoreError> {
        let value = self.entries.get(key).ok_or_else(|| StoreError::Missing {
            key: key.to_owned(),
        })?;
        value
            .downcast_ref::<T>()
            .ok_or_else(|| Self::mismatch::<T>(key))
    }

    /// Mutably borrows the value published under `key`.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Store::get`].
    pub fn get_mut<T: Any>(&mut self, key: &str) -> Result<&mut T, StoreError> {
        let value = self
            .entries
            .get_mut(key)
            .ok_or_else(|| StoreError::Missing {
                key: key.to_owned(),
            })?;
        value
            .downcast_mut::<T>()
            .ok_or_else(|| Self::mismatch::<T>(key))
    }

    /// Removes and returns the value published under `key`.
    ///
    /// The value stays in place when its type does not match.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Store::get`].
    pub fn remove<T: Any>(&mut self, key: &str) -> Result<T, StoreError> {
        self.get::<T>(key)?;
        let value = self.entries.remove(key).ok_or_else(|| StoreError::Missing {
            key: key.to_owned(),
        })?;
        value
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| Self::mismatch::<T>(key))
    }

    /// Returns `true` when a value has been published under `key`.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of published keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing has been published.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Published keys in lexical order.
    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    fn mismatch<T>(key: &str) -> StoreError {
        StoreError::TypeMismatch {
            key: key.to_owned(),
            expected: type_name::<T>(),
        }
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").field("keys", &self.keys()).finish()
    }
}

#[cfg(test)]
mod tests;
