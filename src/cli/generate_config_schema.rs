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

use crate::config::ConfigFile;

const SCHEMA_FILE: &str = "trellis.schema.json";

/// Generates the JSON schema of the configuration file.
#[derive(clap::Args, Clone, Debug)]
pub struct GenerateConfigSchema {
    /// The directory to write the schema to.
    #[clap(short, long, default_value = ".")]
    pub output_directory: std::path::PathBuf,
}

impl GenerateConfigSchema {
    pub fn generate_config_schema(&self) -> crate::Result<()> {
        let schema = schemars::schema_for!(ConfigFile);
        let path = self.output_directory.join(SCHEMA_FILE);

        tracing::info!("Writing config schema to {}", path.display());
        std::fs::write(path, serde_json::to_string_pretty(&schema)?)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_schema() {
        let dir = tempfile::tempdir().unwrap();
        GenerateConfigSchema {
            output_directory: dir.path().to_owned(),
        }
        .generate_config_schema()
        .unwrap();

        let schema: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join(SCHEMA_FILE)).unwrap()).unwrap();
        assert_eq!("ConfigFile", schema["title"]);
        for field in ["services", "routes", "policies"] {
            assert!(schema["properties"].get(field).is_some(), "missing {field}");
        }
    }
}
