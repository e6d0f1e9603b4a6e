//! Binary builder.
//!
//! A [`Binary`] compiles one artifact for the cluster platform, copies it to
//! a stable output path and remembers its content digest. Builds of the same
//! binary are serialized; cancelling the token kills the compiler.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{BinaryTarget, BuildRecipe, Platform};
use crate::digest::ContentDigest;
use crate::error::BuildError;

/// One artifact and its last successful digest.
#[derive(Debug)]
pub struct Binary {
    name: String,
    program: String,
    args: Vec<String>,
    cwd: PathBuf,
    artifact: PathBuf,
    output_path: PathBuf,
    platform: Platform,
    build_lock: tokio::sync::Mutex<()>,
    hash: Mutex<Option<ContentDigest>>,
}

impl Binary {
    /// Prepare a binary from its target description.
    pub fn from_target(
        target: &BinaryTarget,
        workspace: &Path,
        output_dir: &Path,
        platform: &Platform,
    ) -> Result<Self, BuildError> {
        let (program, args, artifact) = match &target.recipe {
            BuildRecipe::Cargo { package, bin } => {
                let triple =
                    platform
                        .target_triple()
                        .ok_or_else(|| BuildError::UnsupportedPlatform {
                            name: target.name.clone(),
                            platform: platform.to_string(),
                        })?;
                let args: Vec<String> = [
                    "build",
                    "--release",
                    "--package",
                    package.as_str(),
                    "--bin",
                    bin.as_str(),
                    "--target",
                    triple,
                ]
                .iter()
                .map(|s| s.to_string())
                .collect();
                let artifact = workspace
                    .join("target")
                    .join(triple)
                    .join("release")
                    .join(bin);
                ("cargo".to_string(), args, artifact)
            }
            BuildRecipe::Command {
                program,
                args,
                artifact,
            } => (program.clone(), args.clone(), workspace.join(artifact)),
        };

        Ok(Self {
            name: target.name.clone(),
            program,
            args,
            cwd: workspace.to_path_buf(),
            artifact,
            output_path: output_dir.join(&target.name),
            platform: platform.clone(),
            build_lock: tokio::sync::Mutex::new(()),
            hash: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Where the last successful build was copied to.
    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Digest of the last successful build, `None` before the first one.
    pub fn hash(&self) -> Option<ContentDigest> {
        *self.hash.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Compile, copy the artifact to the output path and return its digest.
    ///
    /// Concurrent calls wait for each other. On failure the previous digest
    /// is kept.
    pub async fn build(&self, token: &CancellationToken) -> Result<ContentDigest, BuildError> {
        let _guard = tokio::select! {
            _ = token.cancelled() => return Err(BuildError::Cancelled(self.name.clone())),
            guard = self.build_lock.lock() => guard,
        };

        debug!(binary = %self.name, program = %self.program, args = ?self.args, "building");
        let child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.cwd)
            .env("DEVBOX_TARGET_OS", &self.platform.os)
            .env("DEVBOX_TARGET_ARCH", &self.platform.arch)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BuildError::Spawn {
                name: self.name.clone(),
                source,
            })?;

        let output = tokio::select! {
            _ = token.cancelled() => return Err(BuildError::Cancelled(self.name.clone())),
            output = child.wait_with_output() => output.map_err(|source| BuildError::Spawn {
                name: self.name.clone(),
                source,
            })?,
        };

        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(BuildError::Failed {
                name: self.name.clone(),
                output: combined,
            });
        }

        let artifact_error = |path: &Path| {
            let path = path.display().to_string();
            move |source: std::io::Error| BuildError::Artifact { path, source }
        };
        if let Some(parent) = self.output_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(artifact_error(parent))?;
        }
        tokio::fs::copy(&self.artifact, &self.output_path)
            .await
            .map_err(artifact_error(&self.artifact))?;
        let digest = ContentDigest::from_file(&self.output_path)
            .await
            .map_err(artifact_error(&self.output_path))?;

        *self.hash.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(digest);
        info!(binary = %self.name, hash = %digest.short(), "built");
        Ok(digest)
    }
}
