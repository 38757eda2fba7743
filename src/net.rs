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

//! Networking shared by the sidecar and the control plane.

pub mod xds;

use std::net::SocketAddr;

use tokio::net::TcpListener;

/// Binds a TCP listener on `address`, logging the address actually bound
/// (which differs from `address` when port `0` was requested).
pub async fn bind(address: SocketAddr) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(address).await?;
    tracing::debug!(address = %listener.local_addr()?, "bound tcp listener");
    Ok(listener)
}
