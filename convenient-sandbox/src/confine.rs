//! Filesystem confinement of spawned commands
//!
//! With [`IsolationMode::Namespace`] the command enters a private mount
//! namespace before it executes. Inside it:
//!
//! 1. the sandbox root is covered by an empty tmpfs, hiding every other
//!    spawn's scratch directory,
//! 2. the spawn's own scratch directory is bound back to its usual path,
//! 3. every staged input is remounted read-only.
//!
//! Processes without the privilege to create a mount namespace create a
//! user namespace first, mapping their own uid and gid. Setup runs between
//! fork and exec, so it only issues syscalls on data prepared beforehand.

use crate::options::{InputMode, IsolationMode};
use crate::scratch::ScratchDir;
use crate::types::{SandboxError, SandboxResult};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

/// Tag on the errno of a failed setup step, telling it apart from exec errors
const SETUP_FAILED: i32 = 0x4000_0000;

/// Mount namespace setup for one spawn
#[derive(Debug, Clone)]
pub(crate) struct Confinement {
    sandbox_root: PathBuf,
    scratch_root: PathBuf,
    exec_root: PathBuf,
    read_only: Vec<ReadOnly>,
    uid_map: String,
    gid_map: String,
}

#[derive(Debug, Clone)]
struct ReadOnly {
    path: PathBuf,
    /// Flags of the underlying mount that a remount has to keep
    #[cfg(target_os = "linux")]
    kept: nix::mount::MsFlags,
}

/// Confinement for a spawn running in `scratch`, or `None` when `isolation`
/// asks for none.
///
/// Fails when the combination cannot keep the host safe: linked inputs
/// without a namespace, or a namespace on a platform without one.
pub(crate) fn prepare(
    isolation: IsolationMode,
    input_mode: InputMode,
    sandbox_root: &Path,
    scratch: &ScratchDir,
    inputs: &BTreeMap<PathBuf, PathBuf>,
) -> SandboxResult<Option<Confinement>> {
    match isolation {
        IsolationMode::Directory if input_mode == InputMode::Copy => Ok(None),
        IsolationMode::Directory => Err(SandboxError::Confinement(
            "linked inputs are writable without namespace isolation; use copied inputs".to_string(),
        )),
        IsolationMode::Namespace => Confinement::new(sandbox_root, scratch, inputs).map(Some),
    }
}

impl Confinement {
    #[cfg(target_os = "linux")]
    fn new(sandbox_root: &Path, scratch: &ScratchDir, inputs: &BTreeMap<PathBuf, PathBuf>) -> SandboxResult<Self> {
        use nix::mount::MsFlags;
        use nix::sys::statvfs::{statvfs, FsFlags};
        use nix::unistd::{getgid, getuid};

        // Mount targets are resolved after the working directory changed
        let canonical = |path: &Path| {
            path.canonicalize()
                .map_err(|e| SandboxError::Confinement(format!("{}: {e}", path.display())))
        };
        let sandbox_root = canonical(sandbox_root)?;
        let scratch_root = canonical(scratch.path())?;
        let exec_root = scratch_root.join("execroot");

        let mut read_only = Vec::with_capacity(inputs.len());
        for relative in inputs.keys() {
            let path = exec_root.join(relative);
            let flags = statvfs(&path)
                .map_err(|errno| SandboxError::Confinement(format!("{}: {errno}", path.display())))?
                .flags();

            let mut kept = MsFlags::empty();
            for (fs_flag, ms_flag) in [
                (FsFlags::ST_NOSUID, MsFlags::MS_NOSUID),
                (FsFlags::ST_NODEV, MsFlags::MS_NODEV),
                (FsFlags::ST_NOEXEC, MsFlags::MS_NOEXEC),
            ] {
                if flags.contains(fs_flag) {
                    kept |= ms_flag;
                }
            }
            read_only.push(ReadOnly { path, kept });
        }

        Ok(Self {
            sandbox_root,
            scratch_root,
            exec_root,
            read_only,
            uid_map: format!("{0} {0} 1", getuid()),
            gid_map: format!("{0} {0} 1", getgid()),
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn new(_sandbox_root: &Path, _scratch: &ScratchDir, _inputs: &BTreeMap<PathBuf, PathBuf>) -> SandboxResult<Self> {
        Err(SandboxError::Confinement(
            "namespace isolation is only available on Linux".to_string(),
        ))
    }

    /// Make `command` enter the confinement before it executes.
    #[cfg(target_os = "linux")]
    pub(crate) fn apply(self, command: &mut Command) {
        debug!(
            "Confining to {} ({} read-only inputs)",
            self.scratch_root.display(),
            self.read_only.len()
        );
        // SAFETY: `enter` runs in the forked child and only issues syscalls
        // on paths and strings owned by the closure.
        unsafe {
            let _ = command.pre_exec(move || self.enter());
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub(crate) fn apply(self, _command: &mut Command) {
        debug!("No confinement for {}", self.scratch_root.display());
    }

    #[cfg(target_os = "linux")]
    fn enter(&self) -> io::Result<()> {
        use nix::mount::{mount, MsFlags};
        use nix::sched::{unshare, CloneFlags};
        use nix::sys::stat::Mode;
        use nix::unistd::{chdir, mkdir};

        if unshare(CloneFlags::CLONE_NEWNS).is_err() {
            unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNS).map_err(setup_failed)?;
            self.map_ids()?;
        }

        // Keep our mounts out of the host's namespace
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None::<&str>,
        )
        .map_err(setup_failed)?;

        // The working directory keeps the scratch directory reachable
        // while the tmpfs covers it
        chdir(&self.scratch_root).map_err(setup_failed)?;
        mount(
            Some("tmpfs"),
            &self.sandbox_root,
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some("mode=0755"),
        )
        .map_err(setup_failed)?;
        mkdir(&self.scratch_root, Mode::S_IRWXU).map_err(setup_failed)?;
        mount(
            Some("."),
            &self.scratch_root,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(setup_failed)?;

        for input in &self.read_only {
            mount(
                Some(&input.path),
                &input.path,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REC,
                None::<&str>,
            )
            .map_err(setup_failed)?;
            mount(
                None::<&str>,
                &input.path,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | input.kept,
                None::<&str>,
            )
            .map_err(setup_failed)?;
        }

        chdir(&self.exec_root).map_err(setup_failed)
    }

    #[cfg(target_os = "linux")]
    fn map_ids(&self) -> io::Result<()> {
        // Missing on kernels that predate the setgroups restriction
        match write_proc("/proc/self/setgroups", b"deny") {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(SETUP_FAILED | nix::errno::Errno::ENOENT as i32) => {}
            Err(e) => return Err(e),
        }
        write_proc("/proc/self/uid_map", self.uid_map.as_bytes())?;
        write_proc("/proc/self/gid_map", self.gid_map.as_bytes())
    }
}

#[cfg(target_os = "linux")]
fn write_proc(path: &str, content: &[u8]) -> io::Result<()> {
    use std::io::Write;

    std::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|mut file| file.write_all(content))
        .map_err(|e| io::Error::from_raw_os_error(SETUP_FAILED | e.raw_os_error().unwrap_or(0)))
}

#[cfg(target_os = "linux")]
fn setup_failed(errno: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(SETUP_FAILED | errno as i32)
}

/// The underlying error if `err` came from a failed confinement step
/// rather than from executing the program.
pub(crate) fn setup_error(err: &io::Error) -> Option<io::Error> {
    let code = err.raw_os_error()?;
    (code & SETUP_FAILED != 0).then(|| io::Error::from_raw_os_error(code & !SETUP_FAILED))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_directory_isolation_needs_copies() {
        let tmp = TempDir::new().unwrap();
        let scratch = ScratchDir::create(tmp.path(), "1").unwrap();
        let inputs = BTreeMap::new();

        let none = prepare(IsolationMode::Directory, InputMode::Copy, tmp.path(), &scratch, &inputs).unwrap();
        assert!(none.is_none());

        for mode in [InputMode::Symlink, InputMode::Hardlink] {
            let err = prepare(IsolationMode::Directory, mode, tmp.path(), &scratch, &inputs).unwrap_err();
            assert!(matches!(err, SandboxError::Confinement(_)));
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_namespace_plan_covers_inputs() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("bitzel-sandbox");
        let scratch = ScratchDir::create(&root, "1").unwrap();
        fs::write(scratch.exec_root().join("a.c"), "").unwrap();
        let inputs = BTreeMap::from([(PathBuf::from("a.c"), tmp.path().join("a.c"))]);

        let confinement = prepare(IsolationMode::Namespace, InputMode::Symlink, &root, &scratch, &inputs)
            .unwrap()
            .unwrap();
        let root = root.canonicalize().unwrap();
        assert_eq!(confinement.sandbox_root, root);
        assert_eq!(confinement.scratch_root, root.join("1"));
        assert_eq!(confinement.read_only.len(), 1);
        assert_eq!(confinement.read_only[0].path, root.join("1/execroot/a.c"));
    }

    #[test]
    fn test_setup_errors_are_recognised() {
        let tagged = io::Error::from_raw_os_error(SETUP_FAILED | 1);
        assert_eq!(setup_error(&tagged).unwrap().raw_os_error(), Some(1));

        let exec_failure = io::Error::from_raw_os_error(2);
        assert!(setup_error(&exec_failure).is_none());
        assert!(setup_error(&io::Error::other("custom")).is_none());
    }
}
