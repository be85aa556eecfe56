//! Utility types and functions for g7-core.

use std::sync::{Mutex, MutexGuard, PoisonError};

use btleplug::platform::PeripheralId as BtPeripheralId;

/// A value behind its own mutex, readable and writable from any context.
///
/// Each independently observed flag gets its own cell so readers never
/// contend with unrelated state and never see a torn value. A poisoned lock
/// still yields the last written value.
#[derive(Debug, Default)]
pub struct Locked<T> {
    inner: Mutex<T>,
}

impl<T> Locked<T> {
    /// Create a cell holding `value`.
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the value.
    pub fn set(&self, value: T) {
        *self.lock() = value;
    }

    /// Replace the value, returning the previous one.
    pub fn replace(&self, value: T) -> T {
        std::mem::replace(&mut *self.lock(), value)
    }

    /// Run `f` with exclusive access to the value.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.lock())
    }
}

impl<T: Clone> Locked<T> {
    /// A copy of the current value.
    pub fn get(&self) -> T {
        self.lock().clone()
    }
}

/// Format a btleplug peripheral ID as a string.
///
/// On macOS, peripheral IDs are UUIDs. On other platforms, they may be
/// MAC addresses or D-Bus paths. This extracts the useful identifier.
pub fn format_peripheral_id(id: &BtPeripheralId) -> String {
    format!("{:?}", id)
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}
