//! Pidfile management and the signal matrix.
//!
//! The stale-pidfile detection is grounded on the reference daemon module's
//! `is_hub_running`/`read_pid_file` pair (`kill(pid, 0)` liveness probe),
//! generalized from a plain text-file `fs::write` to the same
//! exclusive-create-plus-advisory-lock contract the other rendezvous files
//! in this crate use.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tokio::signal::unix::{signal, SignalKind};

use crate::error::BrokerError;

/// Events the signal handlers hand off to the control loop. Signal
/// handlers only ever produce these; they never touch the queue, listener,
/// upstream, or spool directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Shutdown,
    RestartUpstream,
    Reload,
    WriteStatus,
}

/// A merged stream over the full signal matrix the broker responds to.
/// `PIPE` is registered and immediately discarded on every tick — on most
/// platforms that's enough to drop the default disposition for `SIGPIPE`,
/// since a broken upstream pipe must surface as a write error, not a
/// process-killing signal.
pub struct SignalListener {
    int: tokio::signal::unix::Signal,
    term: tokio::signal::unix::Signal,
    quit: tokio::signal::unix::Signal,
    hup: tokio::signal::unix::Signal,
    usr1: tokio::signal::unix::Signal,
    usr2: tokio::signal::unix::Signal,
    pipe: tokio::signal::unix::Signal,
}

impl SignalListener {
    pub fn register() -> Result<Self, BrokerError> {
        let mk = |kind: SignalKind| {
            signal(kind).map_err(|e| BrokerError::Lifecycle(format!("register signal: {e}")))
        };
        Ok(Self {
            int: mk(SignalKind::interrupt())?,
            term: mk(SignalKind::terminate())?,
            quit: mk(SignalKind::quit())?,
            hup: mk(SignalKind::hangup())?,
            usr1: mk(SignalKind::user_defined1())?,
            usr2: mk(SignalKind::user_defined2())?,
            pipe: mk(SignalKind::pipe())?,
        })
    }

    /// Wait for the next signal that maps to a [`LifecycleEvent`]. `PIPE`
    /// is consumed and looped past rather than returned.
    pub async fn next_event(&mut self) -> LifecycleEvent {
        loop {
            tokio::select! {
                _ = self.int.recv() => return LifecycleEvent::Shutdown,
                _ = self.term.recv() => return LifecycleEvent::Shutdown,
                _ = self.quit.recv() => return LifecycleEvent::Shutdown,
                _ = self.hup.recv() => return LifecycleEvent::RestartUpstream,
                _ = self.usr1.recv() => return LifecycleEvent::Reload,
                _ = self.usr2.recv() => return LifecycleEvent::WriteStatus,
                _ = self.pipe.recv() => continue,
            }
        }
    }
}

/// RAII handle for the pidfile: created during startup, unlinked on drop
/// (covers both the ordinary shutdown path and an early-return error
/// path, mirroring `cleanup_on_shutdown`).
pub struct Pidfile {
    path: PathBuf,
}

impl Pidfile {
    /// Acquire the pidfile at `path`. If it already exists and names a
    /// live PID, returns [`BrokerError::Lifecycle`] — fatal at startup,
    /// since a second broker instance must never run against the same
    /// pidfile. A stale pidfile (dead PID) is unlinked and replaced.
    pub fn acquire(path: &Path) -> Result<Self, BrokerError> {
        if let Some(existing_pid) = read_pid(path) {
            if process_is_alive(existing_pid) {
                return Err(BrokerError::Lifecycle(format!(
                    "pidfile {} names live pid {existing_pid}",
                    path.display()
                )));
            }
            log::warn!(
                "removing stale pidfile {} (pid {existing_pid} not running)",
                path.display()
            );
            let _ = std::fs::remove_file(path);
        }

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| {
                BrokerError::Lifecycle(format!("create pidfile {}: {e}", path.display()))
            })?;
        crate::spool::lock_exclusive_nonblocking(&file)
            .map_err(|e| BrokerError::Lifecycle(format!("lock pidfile {}: {e}", path.display())))?;

        let mut file = file;
        file.write_all(std::process::id().to_string().as_bytes())
            .map_err(|e| BrokerError::Lifecycle(format!("write pidfile {}: {e}", path.display())))?;

        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for Pidfile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    let mut contents = String::new();
    File::open(path).ok()?.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

/// Probe liveness via `kill(pid, 0)` — sends no signal, just checks
/// whether the process exists and is owned by us (or we have permission
/// to signal it).
fn process_is_alive(pid: u32) -> bool {
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0
}
