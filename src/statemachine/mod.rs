//! Resumable build engine.
//!
//! A build is an ordered catalog of steps. [`StateMachine::setup`] validates
//! the configuration and the layout, claims the workspace and either starts
//! fresh or picks up a saved run. [`StateMachine::run`] executes the
//! remaining steps and writes a checkpoint after each one, so a run that
//! dies at step N resumes at step N. [`StateMachine::teardown`] releases the
//! workspace and cleans up after a completed build.

pub mod report;
pub mod state;
pub mod variant;
pub mod workspace;

use std::path::Path;

use log::{debug, error, info, warn};

use crate::config::BuildConfig;
use crate::error::{BuildError, BuildResult};
use crate::layout::{self, ResolveOptions};
use crate::steps::{artifacts, StepContext, StepDefinition};
use crate::tools::{CommandRunner, HostRunner};

use report::{LogReporter, Reporter};
use state::{StateFile, WorkState};
use variant::BuildVariant;
use workspace::{Workspace, WorkspaceLock};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineState {
    NotStarted,
    /// Set up, or executing; `ordinal` is the next step to run.
    Running { ordinal: usize },
    /// Stopped by `--until`/`--thru` before the end of the catalog.
    Paused { ordinal: usize },
    Completed,
    Failed { ordinal: usize, step: String },
}

pub struct StateMachine {
    config: BuildConfig,
    catalog: Vec<StepDefinition>,
    runner: Box<dyn CommandRunner>,
    reporter: Box<dyn Reporter>,
    status: MachineState,
    workspace: Option<Workspace>,
    lock: Option<WorkspaceLock>,
    state_file: Option<StateFile>,
    work: Option<WorkState>,
}

impl StateMachine {
    pub fn new(config: BuildConfig) -> Self {
        Self::with_collaborators(config, Box::new(HostRunner), Box::new(LogReporter))
    }

    pub fn with_collaborators(
        config: BuildConfig,
        runner: Box<dyn CommandRunner>,
        reporter: Box<dyn Reporter>,
    ) -> Self {
        let catalog = config.mode.catalog();
        Self {
            config,
            catalog,
            runner,
            reporter,
            status: MachineState::NotStarted,
            workspace: None,
            lock: None,
            state_file: None,
            work: None,
        }
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.catalog.iter().map(|s| s.name).collect()
    }

    pub fn status(&self) -> &MachineState {
        &self.status
    }

    pub fn work_state(&self) -> Option<&WorkState> {
        self.work.as_ref()
    }

    pub fn workspace(&self) -> Option<&Path> {
        self.workspace.as_ref().map(Workspace::root)
    }

    pub fn setup(&mut self) -> BuildResult<()> {
        if self.status != MachineState::NotStarted {
            return Err(BuildError::Lifecycle("setup has already run".into()));
        }
        self.config.validate()?;
        self.check_step_bounds()?;
        self.validate_layout()?;

        let workspace = Workspace::prepare(self.config.workdir.as_deref())?;
        let lock = WorkspaceLock::acquire(workspace.root())?;
        let state_file = StateFile::in_workspace(workspace.root());

        let work = match self.initial_work_state(&state_file) {
            Ok(work) => work,
            Err(e) => {
                if let Err(release) = lock.release() {
                    warn!("failed to release workspace lock: {release}");
                }
                return Err(e);
            }
        };

        info!(
            "{} build in {}, starting at step {} of {}",
            self.config.image_type(),
            workspace.root().display(),
            work.step_ordinal + 1,
            self.catalog.len()
        );
        self.status = MachineState::Running {
            ordinal: work.step_ordinal,
        };
        self.workspace = Some(workspace);
        self.lock = Some(lock);
        self.state_file = Some(state_file);
        self.work = Some(work);
        Ok(())
    }

    pub fn run(&mut self) -> BuildResult<()> {
        match self.status {
            MachineState::NotStarted => {
                return Err(BuildError::Lifecycle("run called before setup".into()));
            }
            MachineState::Completed => return Ok(()),
            _ => {}
        }
        let stop = self.stop_ordinal();

        let Self {
            catalog,
            runner,
            reporter,
            status,
            workspace,
            state_file,
            work,
            ..
        } = self;
        let (Some(workspace), Some(state_file), Some(work)) = (workspace, state_file, work) else {
            return Err(BuildError::Lifecycle("workspace is not set up".into()));
        };

        let total = catalog.len();
        while work.step_ordinal < stop {
            let ordinal = work.step_ordinal;
            let step = catalog[ordinal];
            *status = MachineState::Running { ordinal };
            reporter.step_started(ordinal, total, step.name);

            let mut next = work.clone();
            let mut ctx = StepContext {
                state: &mut next,
                workspace,
                runner: &**runner,
            };
            if let Err(cause) = (step.run)(&mut ctx) {
                reporter.step_failed(ordinal, step.name, &cause);
                *status = MachineState::Failed {
                    ordinal,
                    step: step.name.to_string(),
                };
                return Err(BuildError::StepExecution {
                    step: step.name.to_string(),
                    cause,
                });
            }

            next.completed_steps.push(step.name.to_string());
            next.step_ordinal = ordinal + 1;
            if let Err(e) = state_file.save(&next.to_record()) {
                *status = MachineState::Failed {
                    ordinal,
                    step: step.name.to_string(),
                };
                return Err(e);
            }
            debug!("checkpoint {} written", next.step_ordinal);
            *work = next;
            reporter.step_completed(ordinal, step.name);
        }

        *status = if work.step_ordinal >= total {
            MachineState::Completed
        } else {
            info!(
                "paused before {}; resume with --resume",
                catalog[work.step_ordinal].name
            );
            MachineState::Paused {
                ordinal: work.step_ordinal,
            }
        };
        Ok(())
    }

    /// Release the workspace. A completed build also loses its state record
    /// and intermediate artifacts unless they were asked to be preserved.
    pub fn teardown(&mut self) -> BuildResult<()> {
        let mut first_error: Option<BuildError> = None;
        let completed = self.status == MachineState::Completed;
        let preserve = self.config.run.preserve_artifacts;

        if let (Some(workspace), Some(work)) = (&self.workspace, &self.work) {
            if completed && !preserve {
                for (name, path) in &work.artifacts {
                    if artifacts::OUTPUTS.contains(&name.as_str()) {
                        continue;
                    }
                    if let Err(e) = workspace.remove_path(path) {
                        first_error.get_or_insert(e);
                    }
                }
                if let Some(state_file) = &self.state_file
                    && let Err(e) = state_file.remove()
                {
                    first_error.get_or_insert(BuildError::Cleanup {
                        path: state_file.path().to_path_buf(),
                        source: e,
                    });
                }
            } else {
                info!("keeping workspace {}", workspace.root().display());
            }
        }

        if let Some(lock) = self.lock.take() {
            let path = lock.path().to_path_buf();
            if let Err(e) = lock.release() {
                first_error.get_or_insert(BuildError::Cleanup { path, source: e });
            }
        }

        if completed
            && !preserve
            && let Some(workspace) = &self.workspace
            && workspace.is_temporary()
            && let Err(e) = workspace.remove_all()
        {
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Setup, Run and Teardown in one go. A run failure wins over a cleanup
    /// failure; the latter is only logged then.
    pub fn execute(&mut self) -> BuildResult<()> {
        self.setup()?;
        let run = self.run();
        let teardown = self.teardown();
        prefer_run_error(run, teardown)
    }

    fn check_step_bounds(&self) -> BuildResult<()> {
        let run = &self.config.run;
        for (flag, name) in [("--until", &run.until), ("--thru", &run.thru)] {
            if let Some(name) = name
                && !self.catalog.iter().any(|s| s.name == name.as_str())
            {
                return Err(BuildError::config(format!(
                    "{flag} {name}: no such step, expected one of {}",
                    self.step_names().join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Exclusive upper bound on the ordinals this invocation may run.
    fn stop_ordinal(&self) -> usize {
        let position = |name: &str| self.catalog.iter().position(|s| s.name == name);
        let run = &self.config.run;
        if let Some(i) = run.until.as_deref().and_then(position) {
            i
        } else if let Some(i) = run.thru.as_deref().and_then(position) {
            i + 1
        } else {
            self.catalog.len()
        }
    }

    /// Parse and check the layout against the caller's inputs before the
    /// workspace is touched, so an invalid layout never leaves an image
    /// behind.
    fn validate_layout(&self) -> BuildResult<()> {
        let sources = self.config.mode.original_layout();
        let opts = ResolveOptions {
            sector_size: self.config.sector_size,
            architecture: &self.config.architecture,
            image_size: self.config.image_size,
            content_root: &sources.content_root,
        };
        layout::load_volume(&sources.layout_file, &opts).map(|_| ())
    }

    fn initial_work_state(&self, state_file: &StateFile) -> BuildResult<WorkState> {
        if self.config.run.resume {
            return self.resume_work_state(state_file);
        }
        if state_file.exists() {
            warn!(
                "discarding saved state {} from a previous run",
                state_file.path().display()
            );
            state_file
                .remove()
                .map_err(|e| BuildError::io("failed to remove stale state", e))?;
        }
        let work = self.config.mode.initial_state(&self.config);
        state_file.save(&work.to_record())?;
        Ok(work)
    }

    fn resume_work_state(&self, state_file: &StateFile) -> BuildResult<WorkState> {
        if !state_file.exists() {
            return Err(BuildError::config(format!(
                "nothing to resume: {} does not exist",
                state_file.path().display()
            )));
        }
        let record = state_file.load()?;
        self.config
            .check_resumable_from(&record.configuration_snapshot)?;

        let names = self.step_names();
        let done = &record.completed_step_names;
        if done.len() > names.len() || done.iter().zip(&names).any(|(a, b)| a != b) {
            return Err(BuildError::CorruptState {
                path: state_file.path().to_path_buf(),
                reason: format!(
                    "completed steps [{}] are not a prefix of the {} catalog",
                    done.join(", "),
                    self.config.image_type()
                ),
            });
        }
        info!(
            "resuming after {} completed steps",
            record.current_step_ordinal
        );
        Ok(record.into_work_state(&self.config))
    }
}

fn prefer_run_error(run: BuildResult<()>, teardown: BuildResult<()>) -> BuildResult<()> {
    match (run, teardown) {
        (Err(e), Err(cleanup)) => {
            error!("{cleanup}");
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Ok(()), result) => result,
    }
}
