use std::io;
use std::process::{Child, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

/// Two-phase stop for a process group.
pub trait Terminator: Send + Sync {
    /// Ask the group to exit (SIGTERM).
    fn request_stop(&self, pgid: i32) -> io::Result<()>;
    /// Make the group exit (SIGKILL).
    fn force_stop(&self, pgid: i32) -> io::Result<()>;
    /// Whether any member of the group still exists.
    fn group_alive(&self, pgid: i32) -> bool;
}

/// Signals the whole process group with `killpg`.
#[derive(Debug, Default, Clone, Copy)]
pub struct GroupSignaller;

impl GroupSignaller {
    fn signal(pgid: i32, signal: libc::c_int) -> io::Result<()> {
        if pgid <= 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid process group"));
        }
        let rc = unsafe { libc::killpg(pgid, signal) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

impl Terminator for GroupSignaller {
    fn request_stop(&self, pgid: i32) -> io::Result<()> {
        Self::signal(pgid, libc::SIGTERM)
    }

    fn force_stop(&self, pgid: i32) -> io::Result<()> {
        Self::signal(pgid, libc::SIGKILL)
    }

    fn group_alive(&self, pgid: i32) -> bool {
        match Self::signal(pgid, 0) {
            Ok(()) => true,
            Err(e) => e.raw_os_error() == Some(libc::EPERM),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Graceful,
    Forced,
}

#[derive(Debug)]
pub struct Escalation {
    pub stage: Stage,
    /// `None` if the child never reported back within the kill wait.
    pub status: Option<ExitStatus>,
}

const POLL: Duration = Duration::from_millis(20);

/// Poll `try_wait` until the child exits or `limit` elapses.
pub fn wait_bounded(child: &mut Child, limit: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + limit;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {}
            Err(e) => {
                warn!("Failed to poll child {}: {}", child.id(), e);
                return None;
            }
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(POLL);
    }
}

/// Wait up to `limit` for the leader to be reaped and every other member of
/// its group to be gone. Returns true once the whole group has exited.
fn wait_group(
    child: &mut Child,
    pgid: i32,
    terminator: &dyn Terminator,
    limit: Duration,
    status: &mut Option<ExitStatus>,
) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if status.is_none() {
            match child.try_wait() {
                Ok(reaped) => *status = reaped,
                Err(e) => {
                    warn!("Failed to poll child {}: {}", child.id(), e);
                    return false;
                }
            }
        }
        if status.is_some() && !terminator.group_alive(pgid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(POLL);
    }
}

/// SIGTERM the group, wait out the grace window, then SIGKILL the group if
/// the leader or any other member is still around. A failure in one stage
/// never skips the next.
pub fn escalate(
    child: &mut Child,
    pgid: i32,
    terminator: &dyn Terminator,
    grace: Duration,
    kill_wait: Duration,
) -> Escalation {
    if let Err(e) = terminator.request_stop(pgid) {
        warn!("Graceful stop of group {} failed: {}", pgid, e);
    }
    let mut status = None;
    if wait_group(child, pgid, terminator, grace, &mut status) {
        info!("Process group {} exited after graceful stop", pgid);
        return Escalation {
            stage: Stage::Graceful,
            status,
        };
    }
    if status.is_some() {
        warn!("Process group {} outlived its leader; forcing", pgid);
    }

    if let Err(e) = terminator.force_stop(pgid) {
        warn!("Forced stop of group {} failed: {}; killing leader", pgid, e);
        if status.is_none() {
            if let Err(e) = child.kill() {
                warn!("Kill of leader {} failed: {}", pgid, e);
            }
        }
    }
    if status.is_none() {
        status = wait_bounded(child, kill_wait);
    }
    if status.is_none() {
        warn!("Process group {} did not exit within {:?} of SIGKILL", pgid, kill_wait);
    } else {
        info!("Process group {} killed", pgid);
    }
    Escalation {
        stage: Stage::Forced,
        status,
    }
}

/// Reap `child` on a detached thread once it finally exits, so a leader that
/// outlived the kill wait does not linger as a zombie.
pub fn reap_detached(mut child: Child) {
    let pid = child.id();
    let spawned = thread::Builder::new()
        .name(format!("reap-{pid}"))
        .spawn(move || match child.wait() {
            Ok(status) => debug!("Reaped straggler {}: {}", pid, status),
            Err(e) => warn!("Could not reap {}: {}", pid, e),
        });
    if let Err(e) = spawned {
        warn!("No reaper thread for {}: {}", pid, e);
    }
}
