/*
 * Copyright 2023 Google LLC All Rights Reserved.
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

//! The mesh's data model: who workloads are, where services live, how
//! traffic to them is routed and who may talk to them.

pub mod endpoint;
pub mod identity;
pub mod policy;
pub mod route;
pub mod service;

pub use self::{
    endpoint::Endpoint,
    identity::{Identity, PrincipalMatcher},
    policy::{MtlsMode, Policy, PolicySet},
    route::{LoadBalancerPolicy, Route, RouteTable},
    service::{RegistrationError, ServiceDefinition, ServiceMap},
};
