use std::{
    fmt,
    sync::{Mutex, OnceLock},
};

use super::ListFactory;
use crate::Result;

/// A list whose elements are produced all at once on first access.
pub struct LazyList<T> {
    items: OnceLock<Vec<T>>,
    factory: Option<ListFactory<T>>,
    init: Mutex<()>,
}

impl<T> LazyList<T> {
    /// Creates an empty, initialized list.
    #[must_use]
    pub fn new() -> Self {
        Self::from_vec(Vec::new())
    }

    /// Creates an initialized list over `items`.
    #[must_use]
    pub fn from_vec(items: Vec<T>) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(items);
        LazyList {
            items: cell,
            factory: None,
            init: Mutex::new(()),
        }
    }

    /// Creates a list that calls `factory` on first access.
    pub fn with_factory<F>(factory: F) -> Self
    where
        F: Fn() -> Result<Vec<T>> + Send + Sync + 'static,
    {
        LazyList {
            items: OnceLock::new(),
            factory: Some(Box::new(factory)),
            init: Mutex::new(()),
        }
    }

    /// Whether the elements have been produced.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.items.get().is_some()
    }

    /// The elements.
    ///
    /// # Errors
    /// Returns the factory's error.
    pub fn items(&self) -> Result<&[T]> {
        if let Some(items) = self.items.get() {
            return Ok(items);
        }

        let _guard = lock!(self.init);
        if let Some(items) = self.items.get() {
            return Ok(items);
        }

        let items = match &self.factory {
            Some(factory) => factory()?,
            None => Vec::new(),
        };
        Ok(self.items.get_or_init(|| items))
    }

    /// The elements, for modification.
    ///
    /// # Errors
    /// Returns the factory's error.
    pub fn items_mut(&mut self) -> Result<&mut Vec<T>> {
        self.items()?;
        self.factory = None;
        self.items
            .get_mut()
            .ok_or_else(|| crate::Error::Error("Lazy list was not initialized".to_string()))
    }

    /// Number of elements.
    ///
    /// # Errors
    /// Returns the factory's error.
    pub fn len(&self) -> Result<usize> {
        Ok(self.items()?.len())
    }

    /// Whether the list has no elements.
    ///
    /// # Errors
    /// Returns the factory's error.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.items()?.is_empty())
    }

    /// Appends an element.
    ///
    /// # Errors
    /// Returns the factory's error.
    pub fn push(&mut self, item: T) -> Result<()> {
        self.items_mut()?.push(item);
        Ok(())
    }
}

impl<T> Default for LazyList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for LazyList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.items.get() {
            Some(items) => f.debug_list().entries(items).finish(),
            None => f.write_str("LazyList(<uninitialized>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn materialized_on_first_access() {
        let mut list = LazyList::with_factory(|| Ok(vec![1, 2, 3]));
        assert!(!list.is_initialized());
        assert_eq!(list.len().unwrap(), 3);
        assert!(list.is_initialized());

        list.push(4).unwrap();
        assert_eq!(list.items().unwrap(), &[1, 2, 3, 4]);
    }

    #[test]
    fn empty_without_factory() {
        let list: LazyList<u8> = LazyList::default();
        assert!(list.is_empty().unwrap());
    }
}
