//! Platform-specific process probing.
//!
//! The registry decides whether a row is live by asking the OS whether its
//! PID still belongs to the running process that claimed it.

use std::time::{Duration, Instant};
#[cfg(not(unix))]
use tracing::warn;

/// Check if a process with the given PID is alive.
///
/// # Platform Behavior
/// - **Linux**: `kill(pid, 0)`, then zombies (state `Z`/`X` in
///   `/proc/<pid>/stat`) are reported dead since they no longer run
/// - **Other Unix**: `kill(pid, 0)`; `EPERM` still means the PID exists
/// - **Elsewhere**: assumed alive
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }

        let exists = match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        };

        exists && !is_zombie(pid)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        warn!("Process alive check not implemented for this platform");
        true
    }
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    // The command name is parenthesised and may itself contain spaces or ')'.
    stat.rfind(')')
        .and_then(|idx| stat[idx + 1..].trim_start().chars().next())
        .map(|state| state == 'Z' || state == 'X')
        .unwrap_or(false)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Kernel start time of `pid`, in clock ticks since boot.
///
/// Together with the PID this identifies one process, so a recycled PID
/// can be told apart from the process that registered it. `None` where
/// the platform does not expose it.
pub fn process_start_time(pid: u32) -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
        let idx = stat.rfind(')')?;
        // Field 3 (state) is the first after the command name; starttime is 22.
        stat[idx + 1..].split_whitespace().nth(19)?.parse().ok()
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        None
    }
}

/// Send `SIGKILL` to `pid`. Returns `false` if the signal could not be sent.
///
/// The caller still owns reaping the process.
pub fn kill_process(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match i32::try_from(pid) {
            Ok(raw) if raw > 0 => kill(Pid::from_raw(raw), Signal::SIGKILL).is_ok(),
            _ => false,
        }
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        warn!("Process kill not implemented for this platform");
        false
    }
}

/// Send `SIGKILL` to every process in the group led by `pgid`.
///
/// Used for children spawned into their own process group, so whatever
/// they started goes down with them.
pub fn kill_process_group(pgid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        match i32::try_from(pgid) {
            Ok(raw) if raw > 1 => killpg(Pid::from_raw(raw), Signal::SIGKILL).is_ok(),
            _ => false,
        }
    }

    #[cfg(not(unix))]
    {
        let _ = pgid;
        warn!("Process group kill not implemented for this platform");
        false
    }
}

/// Poll until `pid` is gone or `timeout` elapses.
///
/// Returns `true` if the process exited within the window.
pub async fn wait_for_exit(pid: u32, timeout: Duration, poll_interval: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !is_process_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll_interval).await;
    }
}
