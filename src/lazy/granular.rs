use std::{
    fmt,
    sync::{Mutex, OnceLock},
};

use super::ItemFactory;
use crate::{Error, Result};

/// A list of known length whose elements are produced individually on first access.
///
/// Used for row-indexed data where reading one element must not force reading the others,
/// such as method bodies referenced by a metadata table.
///
/// Structural edits ([`GranularLazyList::insert`], [`GranularLazyList::remove`]) shift
/// indices, so they materialize every element first.
pub struct GranularLazyList<T> {
    items: Vec<OnceLock<T>>,
    factory: Option<ItemFactory<T>>,
    init: Mutex<()>,
}

impl<T> GranularLazyList<T> {
    /// Creates a list of `count` elements, each produced by `factory(index)` when first read.
    pub fn with_factory<F>(count: usize, factory: F) -> Self
    where
        F: Fn(usize) -> Result<T> + Send + Sync + 'static,
    {
        GranularLazyList {
            items: (0..count).map(|_| OnceLock::new()).collect(),
            factory: Some(Box::new(factory)),
            init: Mutex::new(()),
        }
    }

    /// Creates an initialized list over `items`.
    #[must_use]
    pub fn from_vec(items: Vec<T>) -> Self {
        GranularLazyList {
            items: items.into_iter().map(OnceLock::from).collect(),
            factory: None,
            init: Mutex::new(()),
        }
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the list has no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether the element at `index` has been produced.
    #[must_use]
    pub fn is_initialized(&self, index: usize) -> bool {
        self.items.get(index).is_some_and(|item| item.get().is_some())
    }

    /// The element at `index`.
    ///
    /// # Errors
    /// Returns [`Error::IndexOutOfRange`] for an invalid index, or the factory's error.
    pub fn get(&self, index: usize) -> Result<&T> {
        let cell = self.items.get(index).ok_or(Error::IndexOutOfRange {
            index,
            count: self.items.len(),
        })?;

        if let Some(item) = cell.get() {
            return Ok(item);
        }

        let _guard = lock!(self.init);
        if let Some(item) = cell.get() {
            return Ok(item);
        }

        let factory = self
            .factory
            .as_ref()
            .ok_or_else(|| Error::Error(format!("No factory for lazy element {index}")))?;
        let item = factory(index)?;
        Ok(cell.get_or_init(|| item))
    }

    /// The element at `index`, for modification.
    ///
    /// # Errors
    /// Returns [`Error::IndexOutOfRange`] for an invalid index, or the factory's error.
    pub fn get_mut(&mut self, index: usize) -> Result<&mut T> {
        self.get(index)?;
        let count = self.items.len();
        self.items
            .get_mut(index)
            .and_then(OnceLock::get_mut)
            .ok_or(Error::IndexOutOfRange { index, count })
    }

    /// Replaces the element at `index` without calling the factory for it.
    ///
    /// # Errors
    /// Returns [`Error::IndexOutOfRange`] for an invalid index.
    pub fn set(&mut self, index: usize, item: T) -> Result<()> {
        let count = self.items.len();
        let cell = self
            .items
            .get_mut(index)
            .ok_or(Error::IndexOutOfRange { index, count })?;
        *cell = OnceLock::from(item);
        Ok(())
    }

    /// Appends an element.
    pub fn push(&mut self, item: T) {
        self.items.push(OnceLock::from(item));
    }

    /// Inserts an element at `index`, materializing every other element first.
    ///
    /// # Errors
    /// Returns [`Error::IndexOutOfRange`] for an invalid index, or the factory's error.
    pub fn insert(&mut self, index: usize, item: T) -> Result<()> {
        if index > self.items.len() {
            return Err(Error::IndexOutOfRange {
                index,
                count: self.items.len(),
            });
        }
        self.initialize_all()?;
        self.items.insert(index, OnceLock::from(item));
        Ok(())
    }

    /// Removes the element at `index`, materializing every other element first.
    ///
    /// # Errors
    /// Returns [`Error::IndexOutOfRange`] for an invalid index, or the factory's error.
    pub fn remove(&mut self, index: usize) -> Result<T> {
        if index >= self.items.len() {
            return Err(Error::IndexOutOfRange {
                index,
                count: self.items.len(),
            });
        }
        self.initialize_all()?;
        self.items
            .remove(index)
            .into_inner()
            .ok_or_else(|| Error::Error(format!("Lazy element {index} was not initialized")))
    }

    /// Produces every element that has not been read yet and drops the factory.
    ///
    /// # Errors
    /// Returns the first factory error.
    pub fn initialize_all(&mut self) -> Result<()> {
        for index in 0..self.items.len() {
            self.get(index)?;
        }
        self.factory = None;
        Ok(())
    }

    /// Iterates over all elements, producing them as needed.
    pub fn iter(&self) -> impl Iterator<Item = Result<&T>> {
        (0..self.items.len()).map(move |index| self.get(index))
    }
}

impl<T: fmt::Debug> fmt::Debug for GranularLazyList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let initialized = self.items.iter().filter(|item| item.get().is_some()).count();
        f.debug_struct("GranularLazyList")
            .field("len", &self.items.len())
            .field("initialized", &initialized)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    fn counted(count: usize) -> (GranularLazyList<usize>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let list = GranularLazyList::with_factory(count, move |index| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(index * 10)
        });
        (list, calls)
    }

    #[test]
    fn elements_are_independent() {
        let (list, calls) = counted(4);
        assert_eq!(*list.get(2).unwrap(), 20);
        assert_eq!(*list.get(2).unwrap(), 20);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(list.is_initialized(2));
        assert!(!list.is_initialized(0));
    }

    #[test]
    fn set_skips_factory() {
        let (mut list, calls) = counted(2);
        list.set(0, 7).unwrap();
        assert_eq!(*list.get(0).unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn structural_edits_materialize() {
        let (mut list, calls) = counted(3);
        list.insert(1, 99).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let items: Vec<usize> = list.iter().map(|item| *item.unwrap()).collect();
        assert_eq!(items, vec![0, 99, 10, 20]);

        assert_eq!(list.remove(0).unwrap(), 0);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn out_of_range() {
        let (list, _) = counted(1);
        assert!(matches!(
            list.get(5),
            Err(Error::IndexOutOfRange { index: 5, count: 1 })
        ));
    }
}
