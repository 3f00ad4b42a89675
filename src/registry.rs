//! The process/job registry: the one piece of shared mutable state in the engine.
//!
//! Groups are registered by the executor for as long as their pipeline runs. The
//! registry is the only way for an outside party (a signal relay, a `jobs` builtin)
//! to find a running group. A single reader/writer lock guards both tables and is
//! never held while waiting on a process.

use crate::cancel::CancelToken;
use log::{debug, info};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

pub type JobId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Stopped,
    Done,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Running => "Running",
            JobStatus::Stopped => "Stopped",
            JobStatus::Done => "Done",
        }
    }

    fn can_become(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Running, JobStatus::Stopped)
                | (JobStatus::Running, JobStatus::Done)
                | (JobStatus::Stopped, JobStatus::Running)
                | (JobStatus::Stopped, JobStatus::Done)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Signals the registry can deliver to a process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Interrupt,
    Terminate,
    Kill,
    Stop,
    Continue,
}

impl SignalKind {
    pub fn as_signal(self) -> Signal {
        match self {
            SignalKind::Interrupt => Signal::SIGINT,
            SignalKind::Terminate => Signal::SIGTERM,
            SignalKind::Kill => Signal::SIGKILL,
            SignalKind::Stop => Signal::SIGTSTP,
            SignalKind::Continue => Signal::SIGCONT,
        }
    }
}

/// Delivers `kind` to every process in the group `pgid`.
pub fn signal_group(pgid: Pid, kind: SignalKind) -> nix::Result<()> {
    killpg(pgid, kind.as_signal())
}

/// The shared view of a running process group.
#[derive(Debug, Clone)]
pub struct GroupHandle {
    pub pgid: Pid,
    pub pids: Vec<Pid>,
    pub cancel: CancelToken,
    /// Foreground groups receive signals forwarded by the relay.
    pub foreground: bool,
    pub command_text: String,
}

/// A user-visible handle to a pipeline invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub command_text: String,
    /// Pid of the group leader.
    pub pid: Pid,
    pub status: JobStatus,
    pub background: bool,
    pub pgid: Pid,
}

/// One row of [`Registry::list_groups`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub pgid: Pid,
    pub status: JobStatus,
    pub command_text: String,
    pub foreground: bool,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no such process group: {0}")]
    UnknownGroup(Pid),
    #[error("no such job: {0}")]
    UnknownJob(JobId),
    #[error("job {id} cannot go from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("failed to signal process group {pgid}: {source}")]
    Signal {
        pgid: Pid,
        #[source]
        source: nix::Error,
    },
}

#[derive(Debug)]
struct Inner {
    groups: HashMap<Pid, GroupHandle>,
    jobs: BTreeMap<JobId, Job>,
    next_job_id: JobId,
}

impl Inner {
    fn job_for_group(&self, pgid: Pid) -> Option<&Job> {
        self.jobs.values().find(|job| job.pgid == pgid)
    }
}

/// Concurrency-safe directory of in-flight process groups and their jobs.
#[derive(Debug)]
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                groups: HashMap::new(),
                jobs: BTreeMap::new(),
                next_job_id: 1,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, group: GroupHandle) {
        debug!("registering process group {} ({})", group.pgid, group.command_text);
        self.write().groups.insert(group.pgid, group);
    }

    pub fn lookup(&self, pgid: Pid) -> Option<GroupHandle> {
        self.read().groups.get(&pgid).cloned()
    }

    pub fn remove(&self, pgid: Pid) -> Option<GroupHandle> {
        debug!("removing process group {}", pgid);
        self.write().groups.remove(&pgid)
    }

    pub fn contains(&self, pgid: Pid) -> bool {
        self.read().groups.contains_key(&pgid)
    }

    pub fn set_foreground(&self, pgid: Pid, foreground: bool) -> Result<(), RegistryError> {
        let mut inner = self.write();
        let group = inner
            .groups
            .get_mut(&pgid)
            .ok_or(RegistryError::UnknownGroup(pgid))?;
        group.foreground = foreground;
        Ok(())
    }

    /// Group ids currently registered, with the status of their job (Running if untracked).
    pub fn list_groups(&self) -> Vec<GroupInfo> {
        let inner = self.read();
        let mut groups: Vec<GroupInfo> = inner
            .groups
            .values()
            .map(|group| GroupInfo {
                pgid: group.pgid,
                status: inner
                    .job_for_group(group.pgid)
                    .map_or(JobStatus::Running, |job| job.status),
                command_text: group.command_text.clone(),
                foreground: group.foreground,
            })
            .collect();
        groups.sort_by_key(|g| g.pgid.as_raw());
        groups
    }

    pub fn foreground_groups(&self) -> Vec<Pid> {
        self.read()
            .groups
            .values()
            .filter(|group| group.foreground)
            .map(|group| group.pgid)
            .collect()
    }

    /// Delivers a signal to every process of a registered group.
    pub fn signal(&self, pgid: Pid, kind: SignalKind) -> Result<(), RegistryError> {
        if !self.contains(pgid) {
            return Err(RegistryError::UnknownGroup(pgid));
        }
        debug!("sending {:?} to process group {}", kind, pgid);
        signal_group(pgid, kind).map_err(|source| RegistryError::Signal { pgid, source })
    }

    /// Asks the executor that owns `pgid` to terminate it.
    pub fn cancel(&self, pgid: Pid) -> Result<(), RegistryError> {
        let group = self.lookup(pgid).ok_or(RegistryError::UnknownGroup(pgid))?;
        group.cancel.cancel();
        Ok(())
    }

    pub fn add_job(&self, command_text: impl Into<String>, pgid: Pid, background: bool) -> JobId {
        let mut inner = self.write();
        let id = inner.next_job_id;
        inner.next_job_id += 1;
        let job = Job {
            id,
            command_text: command_text.into(),
            pid: pgid,
            status: JobStatus::Running,
            background,
            pgid,
        };
        info!("[{}] {} started: {}", id, pgid, job.command_text);
        inner.jobs.insert(id, job);
        id
    }

    pub fn job(&self, id: JobId) -> Option<Job> {
        self.read().jobs.get(&id).cloned()
    }

    pub fn job_for_group(&self, pgid: Pid) -> Option<Job> {
        self.read().job_for_group(pgid).cloned()
    }

    /// All jobs, ordered by id.
    pub fn jobs(&self) -> Vec<Job> {
        self.read().jobs.values().cloned().collect()
    }

    /// Atomically moves a job to `to`, returning its previous status.
    pub fn transition(&self, id: JobId, to: JobStatus) -> Result<JobStatus, RegistryError> {
        let mut inner = self.write();
        let job = inner.jobs.get_mut(&id).ok_or(RegistryError::UnknownJob(id))?;
        let from = job.status;
        if !from.can_become(to) {
            return Err(RegistryError::InvalidTransition { id, from, to });
        }
        job.status = to;
        info!("[{}] {} -> {}", id, from, to);
        Ok(from)
    }

    pub fn remove_job(&self, id: JobId) -> Option<Job> {
        self.write().jobs.remove(&id)
    }

    /// Removes and returns every job that has reached `Done`.
    pub fn take_finished(&self) -> Vec<Job> {
        let mut inner = self.write();
        let done: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Done)
            .map(|job| job.id)
            .collect();
        done.iter().filter_map(|id| inner.jobs.remove(id)).collect()
    }
}
