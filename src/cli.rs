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

mod control_plane;
mod generate_config_schema;
mod sidecar;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    components::admin::Admin,
    config::{Config, ConfigFile},
};

pub use self::{
    control_plane::ControlPlane, generate_config_schema::GenerateConfigSchema, sidecar::Sidecar,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const ETC_CONFIG_PATH: &str = "/etc/trellis/trellis.yaml";
const GIT_COMMIT_HASH: Option<&str> = option_env!("GIT_COMMIT_HASH");

/// The Command-Line Interface for Trellis.
#[derive(Debug, clap::Parser)]
#[command(version)]
#[non_exhaustive]
pub struct Cli {
    /// Whether to spawn the admin server or not.
    #[clap(env, long)]
    pub no_admin: bool,
    /// The path to the configuration file for the Trellis instance.
    #[clap(short, long, env = "TRELLIS_CONFIG", default_value = "trellis.yaml")]
    pub config: PathBuf,
    /// The address to bind for the admin server.
    #[clap(long, env = "TRELLIS_ADMIN_ADDRESS")]
    pub admin_address: Option<std::net::SocketAddr>,
    /// Whether Trellis will report any results to stdout/stderr.
    #[clap(short, long, env)]
    pub quiet: bool,
    #[clap(subcommand)]
    pub command: Commands,
}

/// The various Trellis commands.
#[derive(Clone, Debug, clap::Subcommand)]
pub enum Commands {
    Sidecar(Sidecar),
    ControlPlane(ControlPlane),
    GenerateConfigSchema(GenerateConfigSchema),
}

impl Commands {
    fn trust_domain(&self) -> Option<&str> {
        match self {
            Self::Sidecar(sidecar) => Some(&sidecar.trust_domain),
            Self::ControlPlane(control_plane) => Some(&control_plane.trust_domain),
            Self::GenerateConfigSchema(_) => None,
        }
    }
}

impl Cli {
    /// Drives the main trellis application lifecycle using the command line
    /// arguments.
    #[tracing::instrument(skip_all)]
    pub async fn drive(self) -> crate::Result<()> {
        let version: std::borrow::Cow<'static, str> = if cfg!(debug_assertions) {
            format!("{VERSION}+debug").into()
        } else {
            VERSION.into()
        };

        if !self.quiet {
            let env_filter = tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .from_env_lossy();
            tracing_subscriber::fmt()
                .json()
                .with_file(true)
                .with_env_filter(env_filter)
                .init();
        }

        tracing::info!(
            version = &*version,
            commit = GIT_COMMIT_HASH.unwrap_or("unknown"),
            "Starting Trellis"
        );

        let mode = match &self.command {
            Commands::GenerateConfigSchema(generator) => return generator.generate_config_schema(),
            Commands::Sidecar(sidecar) => Admin::Sidecar(sidecar.ready()),
            Commands::ControlPlane(control_plane) => Admin::ControlPlane(control_plane.ready()),
        };

        let (config, config_path) = Self::read_config(&self.config, self.command.trust_domain())?;
        let config = Arc::new(config);
        let (shutdown_tx, shutdown_rx) = crate::signal::spawn_handler();

        let _admin_task = if self.no_admin {
            None
        } else {
            Some(mode.server(config.clone(), self.admin_address, Some(shutdown_tx)))
                .transpose()?
        };

        match self.command {
            Commands::Sidecar(sidecar) => {
                sidecar
                    .run(config, mode.unwrap_sidecar().clone(), shutdown_rx)
                    .await
            }
            Commands::ControlPlane(control_plane) => {
                control_plane
                    .run(
                        config,
                        config_path,
                        mode.unwrap_control_plane().clone(),
                        shutdown_rx,
                    )
                    .await
            }
            Commands::GenerateConfigSchema(_) => Ok(()),
        }
    }

    /// Searches for the configuration file, falling back to `/etc` and then
    /// to an empty configuration. Returns the path that was found, if any.
    fn read_config(
        path: &Path,
        trust_domain: Option<&str>,
    ) -> crate::Result<(Config, Option<PathBuf>)> {
        let from_path = |path: &Path, file: std::fs::File| -> crate::Result<(Config, Option<PathBuf>)> {
            let config = Config::default();
            config.apply(ConfigFile::from_reader(file)?, trust_domain)?;
            tracing::info!(path = %path.display(), "loaded configuration file");
            Ok((config, Some(path.to_owned())))
        };

        match std::fs::File::open(path) {
            Ok(file) => from_path(path, file),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "provided path not found");
                let etc = Path::new(ETC_CONFIG_PATH);
                match cfg!(unix).then(|| std::fs::File::open(etc)) {
                    Some(Ok(file)) => from_path(etc, file),
                    Some(Err(error)) if error.kind() == std::io::ErrorKind::NotFound => {
                        tracing::debug!(path = %etc.display(), "/etc path not found");
                        Ok((Config::default(), None))
                    }
                    Some(Err(error)) => Err(error.into()),
                    None => Ok((Config::default(), None)),
                }
            }
            Err(error) => Err(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn read_config_falls_back_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (config, path) = Cli::read_config(&dir.path().join("missing.yaml"), None).unwrap();
        assert!(config.services.read().is_empty());
        // Only a machine with an /etc/trellis config would find one.
        assert!(path.is_none() || path == Some(PathBuf::from(ETC_CONFIG_PATH)));
    }

    #[test]
    fn read_config_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trellis.yaml");
        std::fs::write(
            &path,
            r#"
services:
  - name: reviews
    endpoints:
      - address: 127.0.0.1:9080
        identity: reviews.default.serviceaccount.identity.example.org
"#,
        )
        .unwrap();

        assert!(Cli::read_config(&path, Some("cluster.local")).is_err());
        let (config, found) = Cli::read_config(&path, Some("example.org")).unwrap();
        assert_eq!(Some(path), found);
        assert_eq!(1, config.services.read().num_of_endpoints());
    }

    #[test]
    fn parses_sidecar_arguments() {
        let cli = Cli::try_parse_from([
            "trellis",
            "--no-admin",
            "sidecar",
            "--service",
            "reviews",
            "--app-address",
            "127.0.0.1:9080",
            "--upstream",
            "ratings=127.0.0.1:15001",
            "--label",
            "version=v2",
            "--control-plane",
            "http://127.0.0.1:7800",
        ])
        .unwrap();

        assert!(cli.no_admin);
        let Commands::Sidecar(sidecar) = cli.command else {
            panic!("expected sidecar command");
        };
        assert_eq!("reviews", sidecar.service);
        assert_eq!(1, sidecar.upstream.len());
        assert_eq!("ratings", sidecar.upstream[0].service);
        assert_eq!(Some(&"v2".to_owned()), sidecar.labels().get("version"));
        assert_eq!("reviews", sidecar.identity().unwrap().account());
    }

    #[test]
    fn zero_intervals_are_rejected() {
        for flag in ["--report-interval-secs", "--idle-request-interval-secs"] {
            let result = Cli::try_parse_from([
                "trellis",
                "sidecar",
                "--service",
                "reviews",
                "--app-address",
                "127.0.0.1:9080",
                flag,
                "0",
            ]);
            assert!(result.is_err(), "{flag} accepted 0");
        }

        assert!(Cli::try_parse_from([
            "trellis",
            "control-plane",
            "--idle-request-interval-secs",
            "0",
        ])
        .is_err());
    }
}
