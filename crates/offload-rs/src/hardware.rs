//! On-demand builds of simulated hardware libraries.
//!
//! Artifacts are cached on disk as `<app_dir>/lib{name}_{lanes}.so` and rebuilt only when
//! missing. The existence check and the build are not atomic: two processes asking for
//! the same configuration at once may both run the build. There is no lock file.

use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;

use crate::compiler::lib_ext;

/// One build variant of the simulated hardware.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HardwareConfig {
    pub lanes: u32,
    pub library_name: String,
}

impl HardwareConfig {
    pub fn new(library_name: impl Into<String>, lanes: u32) -> Self {
        Self {
            lanes,
            library_name: library_name.into(),
        }
    }

    /// File stem passed to the build as `LIB_NAME`.
    pub fn artifact_stem(&self) -> String {
        format!("lib{}_{}", self.library_name, self.lanes)
    }

    pub fn artifact_file_name(&self) -> String {
        format!("{}{}", self.artifact_stem(), lib_ext())
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("lane count must be positive")]
    ZeroLanes,
    #[error("failed to launch `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("hardware build exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("build succeeded but {} was not produced", .0.display())]
    MissingArtifact(PathBuf),
}

/// Runs the external build for one configuration and blocks until it exits.
pub trait BuildRunner: Send + Sync {
    fn build(&self, app_dir: &Path, config: &HardwareConfig) -> Result<(), BuildError>;
}

/// `make --directory <app_dir> LIB_NAME=<stem> LANES=<n>`.
#[derive(Debug, Clone)]
pub struct MakeRunner {
    program: String,
}

impl MakeRunner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Default for MakeRunner {
    fn default() -> Self {
        Self::new(crate::env::make_program())
    }
}

impl BuildRunner for MakeRunner {
    fn build(&self, app_dir: &Path, config: &HardwareConfig) -> Result<(), BuildError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--directory")
            .arg(app_dir)
            .arg(format!("LIB_NAME={}", config.artifact_stem()))
            .arg(format!("LANES={}", config.lanes));
        tracing::info!(
            program = %self.program,
            app_dir = %app_dir.display(),
            lanes = config.lanes,
            "building hardware library"
        );
        let output = cmd.output().map_err(|source| BuildError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        if !output.status.success() {
            return Err(BuildError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }
}

pub struct HardwareBuildManager {
    app_dir: PathBuf,
    runner: Box<dyn BuildRunner>,
}

impl HardwareBuildManager {
    pub fn new(app_dir: impl Into<PathBuf>) -> Self {
        Self::with_runner(app_dir, MakeRunner::default())
    }

    pub fn with_runner(app_dir: impl Into<PathBuf>, runner: impl BuildRunner + 'static) -> Self {
        Self {
            app_dir: app_dir.into(),
            runner: Box::new(runner),
        }
    }

    pub fn app_dir(&self) -> &Path {
        &self.app_dir
    }

    pub fn artifact_path(&self, config: &HardwareConfig) -> PathBuf {
        self.app_dir.join(config.artifact_file_name())
    }

    /// Returns the library for `config`, building it first if it is not on disk.
    pub fn ensure_built(&self, config: &HardwareConfig) -> Result<PathBuf, BuildError> {
        if config.lanes == 0 {
            return Err(BuildError::ZeroLanes);
        }
        let path = self.artifact_path(config);
        if path.is_file() {
            tracing::debug!(path = %path.display(), "hardware library cached");
            return Ok(path);
        }
        self.runner.build(&self.app_dir, config)?;
        if !path.is_file() {
            return Err(BuildError::MissingArtifact(path));
        }
        tracing::info!(path = %path.display(), "hardware library built");
        Ok(path)
    }
}
