use std::{
    fmt,
    sync::{Mutex, OnceLock},
};

use super::ValueFactory;
use crate::Result;

/// A value that is computed on first access.
pub struct LazyVariable<T> {
    value: OnceLock<T>,
    factory: Option<ValueFactory<T>>,
    init: Mutex<()>,
}

impl<T> LazyVariable<T> {
    /// Creates an initialized variable.
    #[must_use]
    pub fn new(value: T) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(value);
        LazyVariable {
            value: cell,
            factory: None,
            init: Mutex::new(()),
        }
    }

    /// Creates a variable that calls `factory` on first access.
    pub fn with_factory<F>(factory: F) -> Self
    where
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        LazyVariable {
            value: OnceLock::new(),
            factory: Some(Box::new(factory)),
            init: Mutex::new(()),
        }
    }

    /// Whether the value has been computed or assigned.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.value.get().is_some()
    }

    /// Returns the value, computing it if needed.
    ///
    /// # Errors
    /// Returns the factory's error, or [`crate::Error::LockError`] if another initializer
    /// panicked.
    pub fn get(&self) -> Result<&T> {
        if let Some(value) = self.value.get() {
            return Ok(value);
        }

        let _guard = lock!(self.init);
        if let Some(value) = self.value.get() {
            return Ok(value);
        }

        let Some(factory) = &self.factory else {
            return Err(crate::Error::Error(
                "Lazy variable has neither a value nor a factory".to_string(),
            ));
        };

        let value = factory()?;
        Ok(self.value.get_or_init(|| value))
    }

    /// Returns the value mutably, computing it if needed.
    ///
    /// # Errors
    /// Returns the factory's error.
    pub fn get_mut(&mut self) -> Result<&mut T> {
        if self.value.get().is_none() {
            self.get()?;
        }
        self.value
            .get_mut()
            .ok_or_else(|| crate::Error::Error("Lazy variable was not initialized".to_string()))
    }

    /// Replaces the value; the factory is never called afterwards.
    pub fn set(&mut self, value: T) {
        self.value = OnceLock::new();
        let _ = self.value.set(value);
        self.factory = None;
    }

    /// Consumes the variable, returning the value.
    ///
    /// # Errors
    /// Returns the factory's error.
    pub fn into_inner(self) -> Result<T> {
        self.get()?;
        self.value
            .into_inner()
            .ok_or_else(|| crate::Error::Error("Lazy variable was not initialized".to_string()))
    }
}

impl<T: Default> Default for LazyVariable<T> {
    fn default() -> Self {
        LazyVariable::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for LazyVariable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value.get() {
            Some(value) => f.debug_tuple("LazyVariable").field(value).finish(),
            None => f.write_str("LazyVariable(<uninitialized>)"),
        }
    }
}
