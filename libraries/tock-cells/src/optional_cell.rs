// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! OptionalCell convenience type

use core::cell::Cell;

/// A `Cell<Option<T>>` with the `Option` combinators driver state needs.
///
/// Drivers keep things that only exist in some states, such as the TRB a
/// transfer is waiting on or an installed client, in an `OptionalCell` so
/// they can be set and cleared through `&self`.
pub struct OptionalCell<T: Copy> {
    value: Cell<Option<T>>,
}

impl<T: Copy> OptionalCell<T> {
    pub const fn new(val: T) -> OptionalCell<T> {
        OptionalCell {
            value: Cell::new(Some(val)),
        }
    }

    /// Create an empty `OptionalCell` (contains just `None`).
    pub const fn empty() -> OptionalCell<T> {
        OptionalCell {
            value: Cell::new(None),
        }
    }

    pub fn set(&self, val: T) {
        self.value.set(Some(val));
    }

    /// Store `val`, returning what the cell held before.
    pub fn replace(&self, val: T) -> Option<T> {
        self.value.replace(Some(val))
    }

    pub fn clear(&self) {
        self.value.set(None);
    }

    pub fn is_some(&self) -> bool {
        self.value.get().is_some()
    }

    pub fn is_none(&self) -> bool {
        self.value.get().is_none()
    }

    // Note: Explicitly do not support unwrap, as we do not to encourage
    // panic'ing in the Tock kernel.

    pub fn unwrap_or(&self, default: T) -> T {
        self.value.get().unwrap_or(default)
    }

    /// Call `closure` on a copy of the value, if there is one. Changes the
    /// closure makes through the reference are not stored back.
    pub fn map<F, R>(&self, closure: F) -> Option<R>
    where
        F: FnOnce(&mut T) -> R,
    {
        self.value.get().map(|mut val| closure(&mut val))
    }

    /// Like [`OptionalCell::map`], returning `default` when the cell is
    /// empty.
    pub fn map_or<F, R>(&self, default: R, closure: F) -> R
    where
        F: FnOnce(&mut T) -> R,
    {
        self.value.get().map_or(default, |mut val| closure(&mut val))
    }

    /// Return the contained value and leave the cell empty.
    pub fn take(&self) -> Option<T> {
        self.value.take()
    }
}

#[cfg(test)]
mod tests {
    use super::OptionalCell;

    #[test]
    fn set_take_clear() {
        let cell = OptionalCell::empty();
        assert!(cell.is_none());
        cell.set(7usize);
        assert!(cell.is_some());
        assert_eq!(cell.replace(8), Some(7));
        assert_eq!(cell.take(), Some(8));
        assert!(cell.is_none());

        cell.set(3);
        cell.clear();
        assert_eq!(cell.unwrap_or(9), 9);
    }

    #[test]
    fn map_works_on_a_copy() {
        let cell = OptionalCell::new(5u32);
        assert_eq!(
            cell.map(|v| {
                *v += 1;
                *v
            }),
            Some(6)
        );
        assert_eq!(cell.unwrap_or(0), 5);
        assert!(cell.map_or(false, |v| *v == 5));

        let empty: OptionalCell<u32> = OptionalCell::empty();
        assert_eq!(empty.map(|v| *v), None);
        assert!(!empty.map_or(false, |v| *v == 5));
    }
}
