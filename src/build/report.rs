//! Per-architecture build results and the aggregated report.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::arch::Architecture;
use crate::artifact::iso::ComposedImage;
use crate::error::RemasterError;

/// Pipeline state of one architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Pending,
    Fetching,
    Verifying,
    Mounting,
    Staging,
    Customizing,
    Composing,
    Done,
    Failed,
}

impl BuildState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildState::Done | BuildState::Failed)
    }

    /// The state after this one completes successfully.
    pub fn next(&self) -> BuildState {
        match self {
            BuildState::Pending => BuildState::Fetching,
            BuildState::Fetching => BuildState::Verifying,
            BuildState::Verifying => BuildState::Mounting,
            BuildState::Mounting => BuildState::Staging,
            BuildState::Staging => BuildState::Customizing,
            BuildState::Customizing => BuildState::Composing,
            BuildState::Composing | BuildState::Done => BuildState::Done,
            BuildState::Failed => BuildState::Failed,
        }
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuildState::Pending => "pending",
            BuildState::Fetching => "fetching",
            BuildState::Verifying => "verifying",
            BuildState::Mounting => "mounting",
            BuildState::Staging => "staging",
            BuildState::Customizing => "customizing",
            BuildState::Composing => "composing",
            BuildState::Done => "done",
            BuildState::Failed => "failed",
        };
        f.pad(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildFailure {
    /// State the pipeline was in when the error arose.
    pub stage: BuildState,
    pub kind: String,
    pub message: String,
}

/// Outcome of one architecture's pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct BuildResult {
    arch: Architecture,
    state: BuildState,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    checksum: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<BuildFailure>,
    elapsed_secs: f64,
}

impl BuildResult {
    pub(crate) fn done(arch: Architecture, image: &ComposedImage, elapsed: Duration) -> Self {
        Self {
            arch,
            state: BuildState::Done,
            output: Some(image.path.clone()),
            checksum: Some(image.checksum.clone()),
            failure: None,
            elapsed_secs: elapsed.as_secs_f64(),
        }
    }

    pub(crate) fn failed(
        arch: Architecture,
        stage: BuildState,
        error: &RemasterError,
        elapsed: Duration,
    ) -> Self {
        Self {
            arch,
            state: BuildState::Failed,
            output: None,
            checksum: None,
            failure: Some(BuildFailure {
                stage,
                kind: error.kind().to_string(),
                message: error.chain_message(),
            }),
            elapsed_secs: elapsed.as_secs_f64(),
        }
    }

    pub fn arch(&self) -> Architecture {
        self.arch
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    pub fn output(&self) -> Option<&Path> {
        self.output.as_deref()
    }

    pub fn failure(&self) -> Option<&BuildFailure> {
        self.failure.as_ref()
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_secs_f64(self.elapsed_secs)
    }

    pub fn succeeded(&self) -> bool {
        self.state == BuildState::Done
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    distro: String,
    version: String,
    finished_at: String,
    results: Vec<BuildResult>,
}

impl BuildReport {
    pub fn new(distro: &str, version: &str, mut results: Vec<BuildResult>) -> Self {
        results.sort_by_key(|r| r.arch);
        let finished_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        Self {
            distro: distro.to_string(),
            version: version.to_string(),
            finished_at,
            results,
        }
    }

    pub fn results(&self) -> &[BuildResult] {
        &self.results
    }

    pub fn result_for(&self, arch: Architecture) -> Option<&BuildResult> {
        self.results.iter().find(|r| r.arch == arch)
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(BuildResult::succeeded)
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("serializing build report")?;
        fs::write(path, json + "\n")
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    /// One line per architecture, for the terminal.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for result in &self.results {
            let line = match (&result.output, &result.failure) {
                (Some(output), _) => format!(
                    "  {:<6} done    {} ({:.1}s)",
                    result.arch,
                    output.display(),
                    result.elapsed_secs
                ),
                (None, Some(failure)) => format!(
                    "  {:<6} FAILED  at {}: [{}] {}",
                    result.arch, failure.stage, failure.kind, failure.message
                ),
                (None, None) => format!("  {:<6} {}", result.arch, result.state),
            };
            out.push_str(&line);
            out.push('\n');
        }
        out
    }
}
