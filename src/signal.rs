/*
 * Copyright 2022 Google LLC All Rights Reserved.
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

/// Receiver for a shutdown event.
pub type ShutdownRx = tokio::sync::watch::Receiver<ShutdownKind>;
/// Shared so both the signal handler and the admin panic hook can request a
/// shutdown.
pub type ShutdownTx = std::sync::Arc<tokio::sync::watch::Sender<ShutdownKind>>;

/// Creates a new handler for shutdown signals (SIGTERM, SIGINT), and returns a
/// receiver that observes an event once a shutdown has been requested.
pub fn spawn_handler() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = channel(ShutdownKind::default());
    ShutdownKind::spawn_signal_handler(tx.clone());
    (tx, rx)
}

pub fn channel(kind: ShutdownKind) -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = tokio::sync::watch::channel(kind);
    (std::sync::Arc::new(tx), rx)
}

/// Waits until `shutdown_rx` observes a shutdown, or its sender is dropped.
pub async fn wait_for(shutdown_rx: &mut ShutdownRx) {
    // A dropped sender means nobody can request a shutdown any more, which
    // we treat the same as being asked to stop.
    let _ = shutdown_rx.changed().await;
}

#[derive(Copy, Clone, PartialEq, Default, Debug)]
pub enum ShutdownKind {
    /// Normal shutdown, the receiver should drain and close its listeners.
    #[default]
    Normal,
    /// In a testing environment, some or all shutdown behavior may be skipped.
    Testing,
}

impl ShutdownKind {
    #[inline]
    fn spawn_signal_handler(shutdown_tx: ShutdownTx) {
        crate::metrics::shutdown_initiated().set(false as _);

        tokio::spawn(async move {
            #[cfg(unix)]
            let sig_term = async {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut stream) => {
                        stream.recv().await;
                    }
                    Err(error) => {
                        tracing::warn!(%error, "unable to listen for SIGTERM");
                        std::future::pending::<()>().await;
                    }
                }
            };
            #[cfg(not(unix))]
            let sig_term = std::future::pending::<()>();

            let signal = tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT",
                _ = sig_term => "SIGTERM",
            };

            crate::metrics::shutdown_initiated().set(true as _);
            tracing::info!(%signal, "shutting down from signal");
            // Don't unwrap, so any subsequent shutdown tasks still run.
            shutdown_tx.send(Self::Normal).ok();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_for_returns_on_send_and_on_drop() {
        let (tx, mut rx) = channel(ShutdownKind::Testing);
        let waiter = tokio::spawn(async move {
            wait_for(&mut rx).await;
            *rx.borrow()
        });
        tx.send(ShutdownKind::Normal).unwrap();
        assert_eq!(ShutdownKind::Normal, waiter.await.unwrap());

        let (tx, mut rx) = channel(ShutdownKind::Testing);
        drop(tx);
        tokio::time::timeout(std::time::Duration::from_secs(1), wait_for(&mut rx))
            .await
            .expect("dropped sender should end the wait");
    }
}
