//! Child process supervision: wait, timeout, cancellation and grace kill.
//!
//! The child leads its own process group. Termination signals go to the
//! whole group so helpers spawned by the command do not outlive it.

use crate::types::{SandboxError, SandboxResult};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Why supervision stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Termination {
    Exited,
    TimedOut,
    Cancelled,
}

#[derive(Debug)]
pub(crate) struct ChildReport {
    pub termination: Termination,
    pub status: ExitStatus,
    pub forced_kill: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Prepare `command` for supervised execution.
fn configure(command: &mut Command) {
    let _ = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    let _ = command.process_group(0);
}

/// Run `command` until it exits, times out or is cancelled.
///
/// After a timeout or cancellation the group receives a termination request
/// and gets `grace` to exit before it is killed.
pub(crate) async fn supervise(
    mut command: Command,
    program: &str,
    timeout: Option<Duration>,
    grace: Duration,
    cancel: &CancellationToken,
) -> SandboxResult<ChildReport> {
    configure(&mut command);
    let mut child = command.spawn().map_err(|source| SandboxError::Startup {
        program: program.to_string(),
        source,
    })?;
    let pid = child.id();
    debug!("Started {} (pid {:?})", program, pid);

    let stdout = child.stdout.take().map(|mut pipe| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf).await;
            buf
        })
    });
    let stderr = child.stderr.take().map(|mut pipe| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf).await;
            buf
        })
    });

    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };

    let (termination, exited) = tokio::select! {
        status = child.wait() => (Termination::Exited, Some(status?)),
        () = deadline => (Termination::TimedOut, None),
        () = cancel.cancelled() => (Termination::Cancelled, None),
    };

    let (status, forced_kill) = match exited {
        Some(status) => {
            // The leader is gone; take down anything it left behind
            signal_group(pid, Signal::Kill);
            (status, false)
        }
        None => {
            debug!("Terminating {} after {:?}", program, termination);
            terminate(&mut child, pid, grace).await?
        }
    };

    Ok(ChildReport {
        termination,
        status,
        forced_kill,
        stdout: collect(stdout).await,
        stderr: collect(stderr).await,
    })
}

async fn collect(reader: Option<tokio::task::JoinHandle<Vec<u8>>>) -> Vec<u8> {
    match reader {
        Some(handle) => handle.await.unwrap_or_default(),
        None => Vec::new(),
    }
}

/// Ask the group to stop, then kill it once `grace` has elapsed.
async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) -> SandboxResult<(ExitStatus, bool)> {
    signal_group(pid, Signal::Terminate);

    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        let status = status?;
        signal_group(pid, Signal::Kill);
        return Ok((status, false));
    }

    warn!("Process {:?} ignored termination for {:?}, killing", pid, grace);
    signal_group(pid, Signal::Kill);
    let _ = child.start_kill();
    let status = child.wait().await?;
    Ok((status, true))
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: Signal) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal as NixSignal};
    use nix::unistd::Pid;

    let Some(raw) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    let signal = match signal {
        Signal::Terminate => NixSignal::SIGTERM,
        Signal::Kill => NixSignal::SIGKILL,
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("Failed to send {:?} to process group {}: {}", signal, raw, e),
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: Signal) {}

/// Exit code of a finished process; signal deaths map to `128 + signal`.
pub(crate) fn exit_code(status: ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.code().or_else(|| status.signal().map(|signal| 128 + signal))
    }
    #[cfg(not(unix))]
    {
        status.code()
    }
}
