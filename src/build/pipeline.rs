//! Build orchestrator.
//!
//! Drives fetch, verify, mount, stage, customize and compose for each
//! requested architecture. Architectures never share a working directory or
//! mount point, so one failing leaves the others untouched.

use anyhow::Result;
use std::fs;
use std::time::Instant;
use tracing::{error, info, info_span, warn};

use crate::artifact::fetch::fetch;
use crate::artifact::filesystem::stage_tree;
use crate::artifact::image::verify;
use crate::artifact::iso::{compose, ComposedImage, IsoOptions};
use crate::build::context::{ArchPaths, BuildContext};
use crate::build::report::{BuildReport, BuildResult, BuildState};
use crate::config::ImageSource;
use crate::customize::{customize, CustomizationBundle, WorkingTree};
use crate::error::RemasterError;
use crate::host::Host;
use crate::interrupt;
use crate::mount::MountSession;

pub struct Pipeline<'a> {
    ctx: &'a BuildContext,
    host: &'a dyn Host,
    bundle: &'a CustomizationBundle,
}

impl<'a> Pipeline<'a> {
    pub fn new(ctx: &'a BuildContext, host: &'a dyn Host, bundle: &'a CustomizationBundle) -> Self {
        Self { ctx, host, bundle }
    }

    /// Build every image, sequentially or on one scoped thread each, and
    /// write the JSON report.
    pub fn run_all(&self, images: &[ImageSource], parallel: bool) -> Result<BuildReport> {
        self.ctx.ensure_layout()?;

        let results: Vec<BuildResult> = if parallel && images.len() > 1 {
            std::thread::scope(|scope| {
                let handles: Vec<_> = images
                    .iter()
                    .map(|image| scope.spawn(move || self.run_architecture(image)))
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| {
                        handle
                            .join()
                            .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
                    })
                    .collect()
            })
        } else {
            images
                .iter()
                .map(|image| self.run_architecture(image))
                .collect()
        };

        let report = BuildReport::new(&self.ctx.distro.name, &self.ctx.distro.version, results);
        report.write_json(&self.ctx.report_path())?;
        Ok(report)
    }

    /// Run one architecture to a terminal state.
    pub fn run_architecture(&self, image: &ImageSource) -> BuildResult {
        let _span = info_span!("build", arch = %image.arch).entered();
        let started = Instant::now();
        let paths = self.ctx.paths_for(image);
        let mut state = BuildState::Pending;

        match self.drive(image, &paths, &mut state) {
            Ok(composed) => {
                info!(elapsed_secs = started.elapsed().as_secs(), "build done");
                BuildResult::done(image.arch, &composed, started.elapsed())
            }
            Err(e) => {
                error!(stage = %state, kind = e.kind(), error = %e.chain_message(), "build failed");
                if matches!(state, BuildState::Staging | BuildState::Customizing | BuildState::Composing) {
                    warn!(path = %paths.working_tree.display(), "working tree left for inspection");
                }
                BuildResult::failed(image.arch, state, &e, started.elapsed())
            }
        }
    }

    fn drive(
        &self,
        image: &ImageSource,
        paths: &ArchPaths,
        state: &mut BuildState,
    ) -> Result<ComposedImage, RemasterError> {
        let profile = image.boot_profile;

        advance(state)?;
        let fetched = fetch(image, &paths.cache, self.ctx.skip_download)?;

        advance(state)?;
        let verified = verify(&fetched, image.sha256.as_deref())?;

        advance(state)?;
        let mut session = MountSession::open(self.host, &verified, &paths.mount_point)?;

        advance(state)?;
        stage_tree(session.root(), &paths.working_tree, profile)?;
        session.close()?;
        drop(session);

        advance(state)?;
        let mut tree = WorkingTree::new(&paths.working_tree, image.arch);
        customize(&mut tree, self.bundle, &self.ctx.distro, profile)?;

        advance(state)?;
        let options = IsoOptions {
            label: &self.ctx.distro.volume_label,
            profile,
        };
        let composed = compose(self.host, &tree, &paths.output, &options)?;

        *state = BuildState::Done;
        if !self.ctx.keep_work {
            if let Err(e) = fs::remove_dir_all(&paths.working_tree) {
                warn!(path = %paths.working_tree.display(), error = %e, "failed to remove working tree");
            }
        }
        Ok(composed)
    }
}

/// Move to the next state, unless a signal arrived.
fn advance(state: &mut BuildState) -> Result<(), RemasterError> {
    interrupt::check()?;
    *state = state.next();
    info!(state = %state, "stage");
    Ok(())
}
