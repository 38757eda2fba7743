/*
 * Copyright 2020 Google LLC
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

use std::io::{Error, ErrorKind, Result as IoResult};

/// Embed the git commit hash into the binary, so `trellis --version` and the
/// startup log can name the exact build.
fn embed_commit_hash() -> IoResult<()> {
    let output = std::process::Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .map_err(|e| Error::new(e.kind(), "failed to run `git`"))?;

    if !output.status.success() {
        return Err(Error::new(
            ErrorKind::Other,
            format!(
                "`git` exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            ),
        ));
    }

    let commit = String::from_utf8(output.stdout)
        .map_err(|_e| Error::new(ErrorKind::InvalidData, "stdout was not utf-8"))?;

    println!("cargo:rustc-env=GIT_COMMIT_HASH={}", commit.trim());

    Ok(())
}

// The gRPC bindings live in `src/generated` and are regenerated from
// `proto/` by hand, so the build only needs to stamp the commit.
fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    if let Err(err) = embed_commit_hash() {
        println!("cargo:warning={err}");
    }
}
