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

//! The mesh discovery protocol: a bidirectional gRPC stream over which the
//! control plane pushes services, routes and policies to sidecars.

pub mod client;
pub(crate) mod metrics;
pub mod resource;
pub mod server;

pub use crate::generated::trellis::mesh::v1 as proto;

pub use self::{
    client::{Client, DiscoveryStream},
    resource::{Resource, ResourceError, ResourceType},
    server::ControlPlane,
};
