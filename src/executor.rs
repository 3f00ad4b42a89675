//! The pipeline executor: one OS process per stage, wired with anonymous pipes and
//! sharing one process group.
//!
//! Every fallible step that does not need a running process (executable lookup,
//! opening redirect targets, creating pipes) happens before the first spawn, so a
//! bad redirection never leaves half a pipeline running. All stages are started
//! before any is waited on; waiting reaps every stage unconditionally.

use crate::cancel::{CancelToken, ExecContext, StopReason};
use crate::command::{Command, ExitCode, pipeline_text};
use crate::external::find_command_path;
use crate::registry::{GroupHandle, JobId, JobStatus, Registry, SignalKind, signal_group};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{Pid, pipe2};
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("pipeline stage {index} has no command")]
    EmptyCommand { index: usize },
    #[error("{program}: command not found")]
    CommandNotFound { program: String },
    #[error("cannot open {}: {}", .path.display(), .source)]
    Redirection {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to create pipe: {0}")]
    Pipe(#[source] nix::Error),
    #[error("{program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("pipeline {pgid} was cancelled")]
    Cancelled { pgid: Pid },
    #[error("pipeline {pgid} timed out")]
    TimedOut { pgid: Pid },
}

impl ExecError {
    /// The exit status a shell reports for this failure.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            ExecError::CommandNotFound { .. } => 127,
            ExecError::Spawn { source, .. } if source.kind() == io::ErrorKind::NotFound => 127,
            ExecError::Spawn { source, .. }
                if source.kind() == io::ErrorKind::PermissionDenied =>
            {
                126
            }
            ExecError::Cancelled { .. } | ExecError::TimedOut { .. } => 130,
            _ => 1,
        }
    }

    /// Whether the pipeline was stopped on request rather than failing by itself.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ExecError::Cancelled { .. } | ExecError::TimedOut { .. })
    }
}

/// Observed state of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Running,
    Stopped,
    Exited(ExitCode),
    Signaled(Signal),
    /// The process could no longer be waited on; its status is unknown.
    Lost,
}

impl StageStatus {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            StageStatus::Exited(_) | StageStatus::Signaled(_) | StageStatus::Lost
        )
    }

    /// Exit code for a finished stage; signal deaths map to `128 + signo`.
    pub fn code(self) -> Option<ExitCode> {
        match self {
            StageStatus::Exited(code) => Some(code),
            StageStatus::Signaled(signal) => Some(128 + signal as i32),
            StageStatus::Lost => Some(1),
            StageStatus::Running | StageStatus::Stopped => None,
        }
    }
}

/// Final result of a pipeline whose stages have all been reaped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStatus {
    pgid: Option<Pid>,
    stages: Vec<StageStatus>,
}

impl PipelineStatus {
    /// The status of a pipeline with no stages: success.
    pub fn empty() -> Self {
        Self {
            pgid: None,
            stages: Vec::new(),
        }
    }

    pub fn pgid(&self) -> Option<Pid> {
        self.pgid
    }

    pub fn stages(&self) -> &[StageStatus] {
        &self.stages
    }

    /// Exit code of the first failing stage in pipeline order, or 0.
    pub fn code(&self) -> ExitCode {
        self.stages
            .iter()
            .filter_map(|s| s.code())
            .find(|&code| code != 0)
            .unwrap_or(0)
    }

    pub fn success(&self) -> bool {
        self.code() == 0
    }
}

/// How a pipeline is admitted.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Foreground groups receive signals forwarded by the relay.
    pub foreground: bool,
    /// Create a job in the registry for this pipeline.
    pub track_job: bool,
    /// Text shown in job listings; defaults to the rendered pipeline.
    pub command_text: Option<String>,
}

#[derive(Debug)]
struct Stage {
    pid: Pid,
    program: String,
    status: StageStatus,
}

/// The live processes of one pipeline, owned by its [`RunningPipeline`].
#[derive(Debug)]
pub struct ProcessGroup {
    stages: Vec<Stage>,
    pgid: Pid,
    cancel: CancelToken,
}

impl ProcessGroup {
    pub fn pgid(&self) -> Pid {
        self.pgid
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.stages.iter().map(|s| s.pid).collect()
    }

    fn all_finished(&self) -> bool {
        self.stages.iter().all(|s| s.status.is_finished())
    }

    /// True when nothing is running and at least one stage is stopped.
    fn all_stopped(&self) -> bool {
        let mut any_stopped = false;
        for stage in &self.stages {
            match stage.status {
                StageStatus::Running => return false,
                StageStatus::Stopped => any_stopped = true,
                _ => {}
            }
        }
        any_stopped
    }

    /// Sends `kind` to the whole group, falling back to the individual stages.
    fn signal(&self, kind: SignalKind) {
        if signal_group(self.pgid, kind).is_err() {
            for stage in self.stages.iter().filter(|s| !s.status.is_finished()) {
                let _ = kill(stage.pid, kind.as_signal());
            }
        }
    }
}

/// Outcome of [`RunningPipeline::wait_foreground`].
#[derive(Debug)]
pub enum WaitOutcome {
    Finished(PipelineStatus),
    /// Every live stage stopped; the pipeline is handed back to the caller.
    Stopped(RunningPipeline),
}

enum Progress {
    Finished(PipelineStatus),
    Stopped,
}

struct Escalation {
    reason: StopReason,
    kill_at: Instant,
    killed: bool,
}

/// A started pipeline. Dropping it without waiting kills and reaps every stage.
#[derive(Debug)]
pub struct RunningPipeline {
    group: ProcessGroup,
    registry: Arc<Registry>,
    job: Option<JobId>,
    stopped: bool,
    finished: bool,
    kill_grace: Duration,
    poll_interval: Duration,
}

impl RunningPipeline {
    pub fn pgid(&self) -> Pid {
        self.group.pgid
    }

    pub fn group(&self) -> &ProcessGroup {
        &self.group
    }

    pub fn job(&self) -> Option<JobId> {
        self.job
    }

    /// Stops relaying foreground signals to this pipeline.
    pub fn detach(&self) {
        if let Err(e) = self.registry.set_foreground(self.group.pgid, false) {
            warn!("{}", e);
        }
    }

    /// Waits until every stage has been reaped, through any number of stops.
    pub fn wait(mut self, ctx: &ExecContext) -> Result<PipelineStatus, ExecError> {
        match self.wait_inner(ctx, false)? {
            Progress::Finished(status) => Ok(status),
            Progress::Stopped => Ok(self.snapshot()),
        }
    }

    /// Waits until every stage has been reaped or the whole group is stopped.
    pub fn wait_foreground(mut self, ctx: &ExecContext) -> Result<WaitOutcome, ExecError> {
        match self.wait_inner(ctx, true)? {
            Progress::Finished(status) => Ok(WaitOutcome::Finished(status)),
            Progress::Stopped => Ok(WaitOutcome::Stopped(self)),
        }
    }

    fn wait_inner(&mut self, ctx: &ExecContext, return_on_stop: bool) -> Result<Progress, ExecError> {
        let mut escalation: Option<Escalation> = None;
        loop {
            self.poll_stages();

            if self.group.all_finished() {
                self.finish();
                let pgid = self.group.pgid;
                return match escalation.map(|e| e.reason) {
                    Some(StopReason::Cancelled) => Err(ExecError::Cancelled { pgid }),
                    Some(StopReason::DeadlineExceeded) => Err(ExecError::TimedOut { pgid }),
                    None => Ok(Progress::Finished(self.snapshot())),
                };
            }
            self.sync_job_status();

            match escalation.as_mut() {
                None => {
                    let requested = ctx.stop_reason().or_else(|| {
                        self.group
                            .cancel
                            .is_cancelled()
                            .then_some(StopReason::Cancelled)
                    });
                    if let Some(reason) = requested {
                        info!(
                            "terminating process group {} ({:?})",
                            self.group.pgid, reason
                        );
                        self.group.signal(SignalKind::Terminate);
                        // Stopped processes only see SIGTERM once continued.
                        self.group.signal(SignalKind::Continue);
                        escalation = Some(Escalation {
                            reason,
                            kill_at: Instant::now() + self.kill_grace,
                            killed: false,
                        });
                    } else if return_on_stop && self.stopped {
                        return Ok(Progress::Stopped);
                    }
                }
                Some(e) if !e.killed && Instant::now() >= e.kill_at => {
                    warn!(
                        "process group {} ignored SIGTERM for {:?}, killing",
                        self.group.pgid, self.kill_grace
                    );
                    self.group.signal(SignalKind::Kill);
                    e.killed = true;
                }
                Some(_) => {}
            }

            thread::sleep(self.poll_interval);
        }
    }

    fn poll_stages(&mut self) {
        let flags = WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED;
        for stage in self.group.stages.iter_mut() {
            if stage.status.is_finished() {
                continue;
            }
            match waitpid(stage.pid, Some(flags)) {
                Ok(WaitStatus::Exited(_, code)) => {
                    debug!("{} ({}) exited with {}", stage.program, stage.pid, code);
                    stage.status = StageStatus::Exited(code);
                }
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    debug!("{} ({}) killed by {}", stage.program, stage.pid, signal);
                    stage.status = StageStatus::Signaled(signal);
                }
                Ok(WaitStatus::Stopped(..)) => stage.status = StageStatus::Stopped,
                Ok(WaitStatus::Continued(_)) => stage.status = StageStatus::Running,
                Ok(_) => {}
                Err(Errno::EINTR) => {}
                Err(e) => {
                    warn!("cannot wait for {} ({}): {}", stage.program, stage.pid, e);
                    stage.status = StageStatus::Lost;
                }
            }
        }
    }

    /// Mirrors group-level stop/continue events into the job table.
    fn sync_job_status(&mut self) {
        let stopped = self.group.all_stopped();
        if stopped == self.stopped {
            return;
        }
        self.stopped = stopped;
        if let Some(id) = self.job {
            let to = if stopped {
                JobStatus::Stopped
            } else {
                JobStatus::Running
            };
            if let Err(e) = self.registry.transition(id, to) {
                warn!("{}", e);
            }
        }
    }

    fn snapshot(&self) -> PipelineStatus {
        PipelineStatus {
            pgid: Some(self.group.pgid),
            stages: self.group.stages.iter().map(|s| s.status).collect(),
        }
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.registry.remove(self.group.pgid);
        if let Some(id) = self.job {
            if let Err(e) = self.registry.transition(id, JobStatus::Done) {
                warn!("{}", e);
            }
        }
    }

    /// Terminates a partially started pipeline, escalating like a cancellation.
    fn abort(&mut self) {
        self.group.cancel.cancel();
        let _ = self.wait_inner(&ExecContext::new(), false);
    }
}

impl Drop for RunningPipeline {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        for stage in self.group.stages.iter().filter(|s| !s.status.is_finished()) {
            debug!("killing unreaped stage {} ({})", stage.program, stage.pid);
            let _ = kill(stage.pid, Signal::SIGKILL);
            while let Err(Errno::EINTR) = waitpid(stage.pid, None) {}
        }
        self.finish();
    }
}

/// Runs pipelines. Cheap to clone; clones share the registry.
#[derive(Debug, Clone)]
pub struct Executor {
    registry: Arc<Registry>,
    kill_grace: Duration,
    poll_interval: Duration,
}

impl Executor {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            kill_grace: DEFAULT_KILL_GRACE,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Delay between SIGTERM and SIGKILL when a pipeline is cancelled.
    pub fn with_kill_grace(mut self, kill_grace: Duration) -> Self {
        self.kill_grace = kill_grace;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Runs `pipeline` in the foreground and waits for every stage.
    ///
    /// An empty pipeline succeeds without doing anything.
    pub fn execute(
        &self,
        ctx: &ExecContext,
        pipeline: &[Command],
    ) -> Result<PipelineStatus, ExecError> {
        if pipeline.is_empty() {
            return Ok(PipelineStatus::empty());
        }
        let running = self.spawn(
            pipeline,
            SpawnOptions {
                foreground: true,
                ..SpawnOptions::default()
            },
        )?;
        running.wait(ctx)
    }

    /// Starts every stage of a non-empty pipeline and registers its group.
    pub fn spawn(
        &self,
        pipeline: &[Command],
        options: SpawnOptions,
    ) -> Result<RunningPipeline, ExecError> {
        if pipeline.is_empty() {
            return Err(ExecError::EmptyCommand { index: 0 });
        }
        let programs = pipeline
            .iter()
            .enumerate()
            .map(|(index, command)| resolve_program(index, command))
            .collect::<Result<Vec<_>, _>>()?;

        let mut commands = self.prepare(pipeline, &programs)?;

        let mut stages: Vec<Stage> = Vec::with_capacity(commands.len());
        let mut pgid: Option<Pid> = None;
        let mut spawn_error = None;
        for (command, source) in commands.iter_mut().zip(pipeline) {
            // Stage 0 leads a new group; the rest join it.
            command.process_group(pgid.map_or(0, Pid::as_raw));
            match command.spawn() {
                Ok(child) => {
                    let pid = Pid::from_raw(child.id() as i32);
                    let leader = *pgid.get_or_insert(pid);
                    debug!("started {} as {} in group {}", source.args[0], pid, leader);
                    stages.push(Stage {
                        pid,
                        program: source.args[0].clone(),
                        status: StageStatus::Running,
                    });
                }
                Err(e) => {
                    spawn_error = Some(ExecError::Spawn {
                        program: source.args[0].clone(),
                        source: e,
                    });
                    break;
                }
            }
        }
        // Release the parent's pipe ends and redirect files.
        drop(commands);

        let Some(pgid) = pgid else {
            return Err(spawn_error.unwrap_or(ExecError::EmptyCommand { index: 0 }));
        };
        let mut running = RunningPipeline {
            group: ProcessGroup {
                stages,
                pgid,
                cancel: CancelToken::new(),
            },
            registry: Arc::clone(&self.registry),
            job: None,
            stopped: false,
            finished: false,
            kill_grace: self.kill_grace,
            poll_interval: self.poll_interval,
        };
        if let Some(e) = spawn_error {
            warn!("{}; terminating the stages already started", e);
            running.abort();
            return Err(e);
        }

        let command_text = options
            .command_text
            .unwrap_or_else(|| pipeline_text(pipeline));
        self.registry.register(GroupHandle {
            pgid,
            pids: running.group.pids(),
            cancel: running.group.cancel.clone(),
            foreground: options.foreground,
            command_text: command_text.clone(),
        });
        if options.track_job {
            let background = pipeline.iter().any(|c| c.background);
            running.job = Some(self.registry.add_job(command_text, pgid, background));
        }
        Ok(running)
    }

    /// Builds one `std::process::Command` per stage with all stdio wired.
    fn prepare(
        &self,
        pipeline: &[Command],
        programs: &[PathBuf],
    ) -> Result<Vec<std::process::Command>, ExecError> {
        let last = pipeline.len() - 1;
        let mut stdin_file = match &pipeline[0].stdin {
            Some(path) => Some(open_input(path)?),
            None => None,
        };
        let mut stdout_file = match &pipeline[last].stdout {
            Some(path) => Some(open_output(path, pipeline[last].append_stdout)?),
            None => None,
        };

        let mut readers: Vec<Option<OwnedFd>> = vec![None];
        let mut writers: Vec<Option<OwnedFd>> = Vec::with_capacity(pipeline.len());
        for _ in 0..last {
            let (read, write) = pipe2(OFlag::O_CLOEXEC).map_err(ExecError::Pipe)?;
            readers.push(Some(read));
            writers.push(Some(write));
        }
        writers.push(None);

        let mut commands = Vec::with_capacity(pipeline.len());
        let stages = pipeline.iter().zip(programs).zip(readers).zip(writers);
        for (index, (((source, program), reader), writer)) in stages.enumerate() {
            let mut command = std::process::Command::new(program);
            command.arg0(&source.args[0]).args(&source.args[1..]);
            if let Some(env) = &source.env {
                command.env_clear();
                command.envs(env.iter().map(|(k, v)| (k, v)));
            }
            if let Some(dir) = &source.working_dir {
                command.current_dir(dir);
            }

            let stdin = match (reader, index) {
                (Some(fd), _) => Stdio::from(fd),
                (None, 0) => stdin_file.take().map_or_else(Stdio::inherit, Stdio::from),
                (None, _) => Stdio::null(),
            };
            let stdout = match writer {
                Some(fd) => Stdio::from(fd),
                None => stdout_file.take().map_or_else(Stdio::inherit, Stdio::from),
            };
            command.stdin(stdin).stdout(stdout).stderr(Stdio::inherit());
            commands.push(command);
        }
        Ok(commands)
    }
}

/// Finds the executable for a stage along the stage's own `PATH`.
fn resolve_program(index: usize, command: &Command) -> Result<PathBuf, ExecError> {
    let Some(name) = command.args.first() else {
        return Err(ExecError::EmptyCommand { index });
    };
    let search_paths: OsString = match &command.env {
        Some(env) => env
            .iter()
            .find(|(k, _)| k == "PATH")
            .map(|(_, v)| OsString::from(v))
            .unwrap_or_default(),
        None => std::env::var_os("PATH").unwrap_or_default(),
    };
    let base_dir = match &command.working_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    };
    find_command_path(&search_paths, &base_dir, Path::new(name))
        .map(|p| p.into_owned())
        .ok_or_else(|| ExecError::CommandNotFound {
            program: name.clone(),
        })
}

pub(crate) fn open_input(path: &Path) -> Result<File, ExecError> {
    File::open(path).map_err(|source| ExecError::Redirection {
        path: path.to_path_buf(),
        source,
    })
}

pub(crate) fn open_output(path: &Path, append: bool) -> Result<File, ExecError> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).mode(0o600);
    if append {
        options.append(true);
    } else {
        options.truncate(true);
    }
    options.open(path).map_err(|source| ExecError::Redirection {
        path: path.to_path_buf(),
        source,
    })
}
