//! Init-once containers for global kernel state.
//!
//! A single-CPU kernel unavoidably has globals (current thread, mount
//! table, page allocator free lists). These wrappers make the
//! initialization discipline explicit instead of hiding it behind
//! `static mut`.

use spin::{Mutex, Once};

/// A cell written exactly once, readable lock-free afterwards.
pub struct OnceLock<T> {
    inner: Once<T>,
}

impl<T> OnceLock<T> {
    pub const fn new() -> Self {
        Self { inner: Once::new() }
    }

    /// The value, if initialized.
    pub fn get(&self) -> Option<&T> {
        self.inner.get()
    }

    /// Initialize the cell. Returns `Err(value)` if already initialized.
    pub fn set(&self, value: T) -> Result<(), T> {
        let mut taken = Some(value);
        self.inner.call_once(|| taken.take().expect("value consumed twice"));
        match taken {
            None => Ok(()),
            Some(value) => Err(value),
        }
    }

    /// The value, initializing it with `f` if empty.
    pub fn get_or_init<F: FnOnce() -> T>(&self, f: F) -> &T {
        self.inner.call_once(f)
    }
}

impl<T> Default for OnceLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutex-guarded global initialized at boot.
///
/// Accessors hand out closures instead of guards so callers cannot hold
/// the lock across a yield by accident.
pub struct GlobalState<T> {
    inner: Mutex<Option<T>>,
}

impl<T> GlobalState<T> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Install the value. Returns `Err(value)` if already initialized.
    pub fn init(&self, value: T) -> Result<(), T> {
        let mut slot = self.inner.lock();
        if slot.is_some() {
            Err(value)
        } else {
            *slot = Some(value);
            Ok(())
        }
    }

    /// Run `f` with a shared borrow. `None` if not yet initialized.
    pub fn with<R, F: FnOnce(&T) -> R>(&self, f: F) -> Option<R> {
        self.inner.lock().as_ref().map(f)
    }

    /// Run `f` with an exclusive borrow. `None` if not yet initialized.
    pub fn with_mut<R, F: FnOnce(&mut T) -> R>(&self, f: F) -> Option<R> {
        self.inner.lock().as_mut().map(f)
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().is_some()
    }
}

impl<T> Default for GlobalState<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_once_lock_single_init() {
        let lock: OnceLock<u32> = OnceLock::new();
        assert!(lock.get().is_none());
        assert!(lock.set(42).is_ok());
        assert_eq!(lock.get(), Some(&42));
        assert_eq!(lock.set(7), Err(7));
        assert_eq!(lock.get(), Some(&42));
    }

    #[test]
    fn test_once_lock_get_or_init() {
        let lock: OnceLock<u32> = OnceLock::new();
        assert_eq!(*lock.get_or_init(|| 5), 5);
        assert_eq!(*lock.get_or_init(|| 9), 5);
    }

    #[test]
    fn test_global_state() {
        let state: GlobalState<u32> = GlobalState::new();
        assert!(!state.is_initialized());
        assert_eq!(state.with(|v| *v), None);

        assert!(state.init(1).is_ok());
        assert_eq!(state.init(2), Err(2));

        state.with_mut(|v| *v += 10);
        assert_eq!(state.with(|v| *v), Some(11));
    }
}
