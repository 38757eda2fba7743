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

pub mod fs;

use std::sync::Arc;

use tokio::sync::watch;

/// A value with interior mutability whose subscribers are woken whenever a
/// modification made through [`Watch::modify`] actually changed it.
#[derive(Clone, Debug)]
pub struct Watch<T> {
    value: Arc<T>,
    watchers: Arc<watch::Sender<Arc<T>>>,
}

impl<T> Watch<T> {
    pub fn new(value: T) -> Self {
        let value = Arc::new(value);
        Self {
            watchers: Arc::new(watch::channel(value.clone()).0),
            value,
        }
    }

    #[inline]
    pub fn watch(&self) -> watch::Receiver<Arc<T>> {
        self.watchers.subscribe()
    }

    /// The value without a [`ReadGuard`], for values that are safe to read
    /// while other tasks modify them, such as the registry.
    #[inline]
    pub fn load(&self) -> &T {
        &self.value
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Marker {
    Version(u64),
}

/// Values that can tell whether they changed since a [`Marker`] was taken.
pub trait Watchable {
    fn mark(&self) -> Marker;
    fn has_changed(&self, marker: Marker) -> bool;
}

impl<T: Watchable> Watch<T> {
    pub fn read(&self) -> ReadGuard<T> {
        ReadGuard {
            inner: self,
            marker: self.value.mark(),
        }
    }

    /// Runs `func` against the value, notifying subscribers afterwards if
    /// the value changed.
    #[inline]
    pub fn modify<R>(&self, func: impl FnOnce(&T) -> R) -> R {
        let guard = WatchGuard {
            inner: self,
            marker: self.value.mark(),
        };
        (func)(&guard)
    }

    fn check_for_changes(&self, marker: Marker) {
        if self.value.has_changed(marker) {
            tracing::trace!(watchers = self.watchers.receiver_count(), "change detected");
            self.watchers.send_modify(|value| *value = self.value.clone());
        } else {
            tracing::trace!("no change detected");
        }
    }
}

impl<T: serde::Serialize> serde::Serialize for Watch<T> {
    fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        self.value.serialize(ser)
    }
}

impl<T: Default> Default for Watch<T> {
    fn default() -> Self {
        Watch::new(<_>::default())
    }
}

impl<T: schemars::JsonSchema> schemars::JsonSchema for Watch<T> {
    fn schema_name() -> String {
        <T>::schema_name()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        <T>::json_schema(gen)
    }

    fn is_referenceable() -> bool {
        <T>::is_referenceable()
    }
}

impl<T: PartialEq> PartialEq for Watch<T> {
    fn eq(&self, rhs: &Self) -> bool {
        self.value.eq(&rhs.value)
    }
}

/// Read access that asserts, in debug builds, nothing changed underneath it.
pub struct ReadGuard<'inner, T: Watchable> {
    inner: &'inner Watch<T>,
    marker: Marker,
}

impl<'inner, T: Watchable> Drop for ReadGuard<'inner, T> {
    fn drop(&mut self) {
        debug_assert!(!self.inner.value.has_changed(self.marker));
    }
}

impl<'inner, T: Watchable> std::ops::Deref for ReadGuard<'inner, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner.value
    }
}

/// Write access that notifies subscribers on drop if the value changed.
pub struct WatchGuard<'inner, T: Watchable> {
    inner: &'inner Watch<T>,
    marker: Marker,
}

impl<'inner, T: Watchable> Drop for WatchGuard<'inner, T> {
    fn drop(&mut self) {
        self.inner.check_for_changes(self.marker);
    }
}

impl<'inner, T: Watchable> std::ops::Deref for WatchGuard<'inner, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner.value
    }
}
