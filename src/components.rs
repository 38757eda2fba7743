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

pub mod admin;
pub mod control_plane;
pub mod sidecar;

/// Args common across all components
pub struct RunArgs<T> {
    /// Config
    pub config: std::sync::Arc<crate::Config>,
    /// The ready check and idle duration
    pub ready: T,
    /// Channel used to indicate graceful shutdown requests
    pub shutdown_rx: crate::signal::ShutdownRx,
}
