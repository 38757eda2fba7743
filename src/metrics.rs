/*
 * Copyright 2020 Google LLC All Rights Reserved.
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

use once_cell::sync::Lazy;
use prometheus::core::Collector;
pub use prometheus::Result;
use prometheus::{HistogramOpts, IntGauge, Opts, Registry, DEFAULT_BUCKETS};

pub const NAMESPACE: &str = "trellis";

/// Label used for the direction of a proxied connection.
pub const DIRECTION_LABEL: &str = "direction";
/// Label used for the service on the other end of a connection.
pub const SERVICE_LABEL: &str = "service";

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::default);

/// The process wide registry all of trellis' metrics are registered with.
pub fn registry() -> &'static Registry {
    &REGISTRY
}

/// Registers `collector` with [`registry`], returning it for further use.
///
/// Panics when the collector cannot be registered, which only happens when two
/// metrics with conflicting descriptions are defined.
pub fn register<T: Collector + Clone + 'static>(collector: T) -> T {
    collector
        .register_if_not_exists(registry())
        .unwrap_or_else(|error| panic!("failed to register metric: {error}"))
}

pub fn opts(name: &str, subsystem: &str, description: &str) -> Opts {
    Opts::new(name, description)
        .namespace(NAMESPACE)
        .subsystem(subsystem)
}

pub fn histogram_opts(
    name: &str,
    subsystem: &str,
    description: &str,
    buckets: Option<Vec<f64>>,
) -> HistogramOpts {
    HistogramOpts {
        common_opts: opts(name, subsystem, description),
        buckets: buckets.unwrap_or(Vec::from(DEFAULT_BUCKETS as &'static [f64])),
    }
}

pub(crate) fn shutdown_initiated() -> &'static IntGauge {
    static SHUTDOWN_INITATED: Lazy<IntGauge> = Lazy::new(|| {
        register(
            IntGauge::with_opts(opts(
                "shutdown_initiated",
                "",
                "Shutdown process has been started",
            ))
            .unwrap(),
        )
    });

    &SHUTDOWN_INITATED
}

pub trait CollectorExt: Collector + Clone + Sized + 'static {
    fn register_if_not_exists(self, registry: &Registry) -> Result<Self> {
        match registry.register(Box::new(self.clone())) {
            Ok(_) | Err(prometheus::Error::AlreadyReg) => Ok(self),
            Err(prometheus::Error::Msg(msg)) if msg.contains("already exists") => {
                // `AlreadyReg` is not always returned for duplicates.
                //  https://github.com/tikv/rust-prometheus/issues/247
                Ok(self)
            }
            Err(err) => Err(err),
        }
    }
}

impl<C: Collector + Clone + 'static> CollectorExt for C {}

#[cfg(test)]
mod tests {
    use prometheus::IntCounter;

    use super::*;

    #[test]
    fn registering_twice_returns_the_collector() {
        let counter = IntCounter::with_opts(opts("twice", "test", "registered twice")).unwrap();
        let first = register(counter.clone());
        let second = register(counter);
        first.inc();
        assert_eq!(second.get(), 1);
    }

    #[test]
    fn metric_names_are_namespaced() {
        let opts = opts("connections", "sidecar", "doc");
        assert_eq!(opts.fq_name(), "trellis_sidecar_connections");
    }
}
