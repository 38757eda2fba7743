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

//! Per connection telemetry. Sidecars buffer a [`ConnectionRecord`] for every
//! connection they proxy and report them periodically; the control plane
//! folds the reports into a service graph.

pub mod aggregator;
pub(crate) mod metrics;
pub mod record;
pub mod reporter;

pub use crate::generated::trellis::telemetry::v1 as proto;

pub use self::{
    aggregator::{Aggregator, ServiceGraph},
    record::{ConnectionRecord, Direction, Outcome, Recorder},
    reporter::Reporter,
};
