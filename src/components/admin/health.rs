/*
 * Copyright 2021 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *       http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

use std::{
    panic,
    sync::{
        atomic::{AtomicBool, Ordering::Relaxed},
        Arc,
    },
};

use hyper::{Body, Response, StatusCode};

use crate::signal::{ShutdownKind, ShutdownTx};

#[derive(Clone)]
pub struct Health {
    healthy: Arc<AtomicBool>,
}

impl Health {
    /// Installs a panic hook which marks the process as unhealthy and
    /// requests a shutdown.
    pub fn new(shutdown_tx: Option<ShutdownTx>) -> Self {
        let health = Self {
            healthy: Arc::new(AtomicBool::new(true)),
        };

        let healthy = health.healthy.clone();
        let default_hook = panic::take_hook();
        panic::set_hook(Box::new(move |panic_info| {
            tracing::error!(%panic_info, "Panic has occurred. Moving to Unhealthy");
            healthy.swap(false, Relaxed);
            if let Some(shutdown_tx) = &shutdown_tx {
                let _ = shutdown_tx.send(ShutdownKind::Normal);
            }
            default_hook(panic_info);
        }));

        health
    }

    /// returns a HTTP 200 response if the process is healthy.
    pub fn check_liveness(&self) -> Response<Body> {
        if self.healthy.load(Relaxed) {
            return Response::new("ok".into());
        };

        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_hook() {
        let (shutdown_tx, shutdown_rx) = crate::signal::channel(ShutdownKind::Testing);
        let health = Health::new(Some(shutdown_tx));

        let response = health.check_liveness();
        assert_eq!(response.status(), StatusCode::OK);

        let _unused = std::panic::catch_unwind(|| {
            panic!("oh no!");
        });

        let response = health.check_liveness();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ShutdownKind::Normal, *shutdown_rx.borrow());
    }
}
