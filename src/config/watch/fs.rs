/*
 * Copyright 2022 Google LLC
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

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use notify::Watcher;
use tracing::Instrument;

use crate::Config;

/// Applies the config file at `path` and re-applies it whenever it is
/// modified. Invalid revisions are logged and skipped, leaving the last
/// valid configuration in place.
pub async fn watch(
    config: Arc<Config>,
    health_check: Arc<AtomicBool>,
    path: impl Into<std::path::PathBuf>,
    trust_domain: Option<String>,
) -> crate::Result<()> {
    let path = path.into();
    let span = tracing::info_span!("config_provider", path = %path.display(), id = %config.id());
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    async fn watch_inner(
        config: &Config,
        path: &std::path::Path,
        trust_domain: Option<&str>,
        tx: tokio::sync::mpsc::UnboundedSender<Result<notify::Event, notify::Error>>,
    ) -> crate::Result<notify::RecommendedWatcher> {
        tracing::info!("discovering configuration through filesystem");
        let mut watcher = notify::RecommendedWatcher::new(
            move |res| {
                // The receiver only goes away once the provider stopped.
                let _ = tx.send(res);
            },
            Default::default(),
        )?;

        tracing::info!("applying initial configuration");
        config.apply_path(path, trust_domain).await?;
        watcher.watch(path, notify::RecursiveMode::NonRecursive)?;
        tracing::info!("watching file");
        Ok(watcher)
    }

    let _watcher = watch_inner(&config, &path, trust_domain.as_deref(), tx)
        .instrument(span.clone())
        .await?;

    health_check.store(true, Ordering::SeqCst);

    while let Some(event) = rx.recv().instrument(span.clone()).await.transpose()? {
        tracing::trace!(event = ?event.kind, "new file event");

        if !matches!(
            event.kind,
            notify::EventKind::Modify(notify::event::ModifyKind::Data(_))
                | notify::EventKind::Modify(notify::event::ModifyKind::Any)
        ) {
            continue;
        }

        for path in event.paths {
            // Reading immediately after the event can observe a partially
            // written file on some platforms.
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            let result = async {
                tracing::info!(path = %path.display(), "file changed, updating config");
                config.apply_path(&path, trust_domain.as_deref()).await
            }
            .instrument(span.clone())
            .await;

            if let Err(error) = result {
                tracing::warn!(%error, "ignoring invalid configuration");
            }
        }
    }

    Err(eyre::eyre!("filesystem watch unexpectedly stopped"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ConfigFile, mesh::ServiceDefinition};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn basic() {
        let dest = Arc::new(crate::Config::default());
        let tmp_dir = tempfile::tempdir().unwrap();
        let file_path = tmp_dir.path().join("config.yaml");

        let mut file = ConfigFile::default();
        tokio::fs::write(&file_path, serde_yaml::to_string(&file).unwrap())
            .await
            .unwrap();

        let health = Arc::new(AtomicBool::new(false));
        let _handle = tokio::spawn(watch(dest.clone(), health.clone(), file_path.clone(), None));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(health.load(Ordering::SeqCst));
        assert!(dest.services.read().is_empty());

        let mut changes = dest.services.watch();
        file.services.push(ServiceDefinition {
            name: "reviews".into(),
            endpoints: [crate::mesh::Endpoint::new(
                (std::net::Ipv4Addr::LOCALHOST, 4321).into(),
            )]
            .into(),
        });
        tokio::fs::write(&file_path, serde_yaml::to_string(&file).unwrap())
            .await
            .unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(5), changes.changed())
            .await
            .expect("config should have been reloaded")
            .unwrap();

        assert_eq!(1, dest.services.read().num_of_endpoints());
    }
}
