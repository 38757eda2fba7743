/*
 * Copyright 2022 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use schemars::JsonSchema;

type Watcher<T> = Box<dyn Fn(&T) + Send + Sync>;

/// A shared value that is replaced atomically as a whole, notifying its
/// watchers on every change.
///
/// Readers get an `Arc` snapshot and never block writers, which makes slots
/// suitable for configuration read on every connection.
pub struct Slot<T> {
    inner: Arc<ArcSwap<T>>,
    watchers: Arc<RwLock<Vec<Watcher<T>>>>,
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            watchers: self.watchers.clone(),
        }
    }
}

impl<T> Slot<T> {
    /// Creates a new slot for `value`.
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(value)),
            watchers: <_>::default(),
        }
    }

    /// Adds a watcher to the slot, called with the new value whenever the
    /// slot changes.
    pub fn watch(&self, watcher: impl Fn(&T) + Send + Sync + 'static) {
        tracing::trace!("adding new watcher");
        self.watchers.write().push(Box::new(watcher));
    }

    /// A snapshot of the current value.
    pub fn load(&self) -> Arc<T> {
        self.inner.load_full()
    }

    fn notify(&self) {
        let value = self.inner.load_full();
        for watcher in self.watchers.read().iter() {
            (watcher)(&*value);
        }
    }

    /// Replaces the value in the slot with `value`.
    pub fn store(&self, value: Arc<T>) {
        tracing::trace!("storing new value");
        self.inner.store(value);
        self.notify();
    }
}

impl<T: PartialEq> Slot<T> {
    /// Replaces the value if it differs from the current one, returning
    /// whether it was replaced.
    pub fn replace_if_changed(&self, value: T) -> bool {
        if *self.inner.load_full() == value {
            return false;
        }

        self.store(Arc::new(value));
        true
    }
}

impl<T: Clone> Slot<T> {
    /// Provides a mutable copy of the current value, which is stored back
    /// once `modify` returns.
    pub fn modify(&self, mut modify: impl FnMut(&mut T)) {
        self.inner.rcu(|current| {
            let mut value = T::clone(current);
            (modify)(&mut value);
            value
        });
        self.notify();
    }
}

impl<T: Default> Default for Slot<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Debug::fmt(&**self.inner.load(), f)
    }
}

impl<T: PartialEq> PartialEq for Slot<T> {
    fn eq(&self, rhs: &Self) -> bool {
        **self.inner.load() == **rhs.inner.load()
    }
}

impl<T> From<T> for Slot<T> {
    fn from(data: T) -> Self {
        Self::new(data)
    }
}

impl<T: serde::Serialize> serde::Serialize for Slot<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.inner.load().serialize(serializer)
    }
}

impl<T: JsonSchema> JsonSchema for Slot<T> {
    fn schema_name() -> String {
        T::schema_name()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        T::json_schema(gen)
    }

    fn is_referenceable() -> bool {
        T::is_referenceable()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::mesh::{Route, RouteTable};

    #[test]
    fn modify_notifies_every_watcher() {
        let calls = Arc::new(AtomicUsize::new(0));
        let slot = Slot::<RouteTable>::default();

        for _ in 0..2 {
            let calls = calls.clone();
            slot.watch(move |table| {
                assert!(table.contains("reviews"));
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        slot.modify(|table| table.insert(Route::default_for("reviews")));
        assert_eq!(2, calls.load(Ordering::SeqCst));
        assert_eq!(1, slot.load().len());
    }

    #[test]
    fn replace_if_changed_skips_equal_values() {
        let calls = Arc::new(AtomicUsize::new(0));
        let slot = Slot::new(5u32);
        {
            let calls = calls.clone();
            slot.watch(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert!(!slot.replace_if_changed(5));
        assert_eq!(0, calls.load(Ordering::SeqCst));
        assert!(slot.replace_if_changed(6));
        assert_eq!(1, calls.load(Ordering::SeqCst));
        assert_eq!(6, *slot.load());
    }

    #[test]
    fn clones_share_the_value() {
        let slot = Slot::new(String::from("a"));
        let clone = slot.clone();
        clone.store(Arc::new("b".into()));
        assert_eq!("b", slot.load().as_str());
        assert_eq!(slot, clone);
    }
}
