//! Per-spawn scratch directories
//!
//! Layout of one scratch directory:
//!
//! ```text
//! <sandbox_base>/<product>-sandbox/<spawn id>/
//!     execroot/      working directory of the command
//! ```
//!
//! The directory is claimed with a non-recursive create, so two spawns can
//! never share one. It is removed when the [`ScratchDir`] is dropped, which
//! happens on every exit path of a spawn.

use crate::options::InputMode;
use crate::types::{confined, SandboxError, SandboxResult};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A claimed, exclusively owned scratch directory
#[derive(Debug)]
pub struct ScratchDir {
    root: PathBuf,
    exec_root: PathBuf,
}

impl ScratchDir {
    /// Claim `<sandbox_root>/<spawn_id>` and create its execution root.
    ///
    /// Fails if the directory already exists.
    pub fn create(sandbox_root: &Path, spawn_id: &str) -> SandboxResult<Self> {
        fs::create_dir_all(sandbox_root).map_err(|source| SandboxError::Scratch {
            path: sandbox_root.to_path_buf(),
            source,
        })?;

        let root = sandbox_root.join(spawn_id);
        fs::create_dir(&root).map_err(|source| SandboxError::Scratch {
            path: root.clone(),
            source,
        })?;

        // From here on Drop owns the cleanup
        let scratch = Self {
            exec_root: root.join("execroot"),
            root,
        };
        fs::create_dir(&scratch.exec_root).map_err(|source| SandboxError::Scratch {
            path: scratch.exec_root.clone(),
            source,
        })?;

        debug!("Created scratch directory {}", scratch.root.display());
        Ok(scratch)
    }

    /// Root of the scratch directory
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Working directory of the command
    pub fn exec_root(&self) -> &Path {
        &self.exec_root
    }

    /// Make every declared input visible under the execution root.
    pub fn stage_inputs(
        &self,
        inputs: &BTreeMap<PathBuf, PathBuf>,
        mode: InputMode,
    ) -> SandboxResult<()> {
        for (relative, source) in inputs {
            let dest = confined(&self.exec_root, relative)?;
            let stage_err = |source| SandboxError::StageInput {
                path: relative.clone(),
                source,
            };

            let source = source.canonicalize().map_err(stage_err)?;
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(stage_err)?;
            }
            stage(&source, &dest, mode).map_err(stage_err)?;
        }

        debug!("Staged {} inputs into {}", inputs.len(), self.exec_root.display());
        Ok(())
    }

    /// Create parent directories for declared outputs so commands can write
    /// them without creating directories first.
    pub fn prepare_outputs(&self, outputs: &[PathBuf]) -> SandboxResult<()> {
        for relative in outputs {
            let path = confined(&self.exec_root, relative)?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    /// Move produced outputs into `dest_root`, returning the ones that existed.
    ///
    /// Declared outputs the command did not produce are skipped; deciding
    /// whether that is an error is up to the caller.
    pub fn deliver_outputs(&self, outputs: &[PathBuf], dest_root: &Path) -> SandboxResult<Vec<PathBuf>> {
        let mut delivered = Vec::new();

        for relative in outputs {
            let produced = confined(&self.exec_root, relative)?;
            let Ok(metadata) = fs::symlink_metadata(&produced) else {
                debug!("Output {} was not produced", relative.display());
                continue;
            };

            let dest = confined(dest_root, relative)?;
            let deliver_err = |source| SandboxError::DeliverOutput {
                path: relative.clone(),
                source,
            };
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(deliver_err)?;
            }
            remove_existing(&dest).map_err(deliver_err)?;

            // Rename fails across filesystems; copy then
            if fs::rename(&produced, &dest).is_err() {
                if metadata.is_dir() {
                    copy_dir_recursive(&produced, &dest).map_err(deliver_err)?;
                } else {
                    let _ = fs::copy(&produced, &dest).map_err(deliver_err)?;
                }
            }
            delivered.push(relative.clone());
        }

        debug!("Delivered {}/{} outputs", delivered.len(), outputs.len());
        Ok(delivered)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => debug!("Removed scratch directory {}", self.root.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove scratch directory {}: {}", self.root.display(), e),
        }
    }
}

fn stage(source: &Path, dest: &Path, mode: InputMode) -> io::Result<()> {
    let linked = match mode {
        InputMode::Symlink => symlink(source, dest).is_ok(),
        InputMode::Hardlink => source.is_file() && fs::hard_link(source, dest).is_ok(),
        InputMode::Copy => false,
    };
    if linked {
        return Ok(());
    }

    if source.is_dir() {
        copy_dir_recursive(source, dest)?;
    } else {
        let _ = fs::copy(source, dest)?;
    }
    seal(dest)
}

/// Clear the write permission of every file under `path`
fn seal(path: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.is_dir() {
        for entry in fs::read_dir(path)? {
            seal(&entry?.path())?;
        }
    } else if metadata.is_file() {
        let mut permissions = metadata.permissions();
        permissions.set_readonly(true);
        fs::set_permissions(path, permissions)?;
    }
    Ok(())
}

#[cfg(unix)]
fn symlink(source: &Path, dest: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(source, dest)
}

#[cfg(windows)]
fn symlink(source: &Path, dest: &Path) -> io::Result<()> {
    if source.is_dir() {
        std::os::windows::fs::symlink_dir(source, dest)
    } else {
        std::os::windows::fs::symlink_file(source, dest)
    }
}

fn remove_existing(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Recursively copy directory
fn copy_dir_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if src_path.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            let _ = fs::copy(&src_path, &dst_path)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn inputs(pairs: &[(&str, &Path)]) -> BTreeMap<PathBuf, PathBuf> {
        pairs
            .iter()
            .map(|(rel, src)| (PathBuf::from(rel), src.to_path_buf()))
            .collect()
    }

    #[test]
    fn test_claim_is_exclusive_and_dropped() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("bitzel-sandbox");

        let scratch = ScratchDir::create(&root, "1").unwrap();
        assert!(scratch.exec_root().is_dir());
        assert!(ScratchDir::create(&root, "1").is_err());

        let path = scratch.path().to_path_buf();
        drop(scratch);
        assert!(!path.exists());
        assert!(root.is_dir());
    }

    #[test]
    fn test_stage_each_mode() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("a.c");
        fs::write(&src, "int main() {}").unwrap();
        let dir = tmp.path().join("include");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("a.h"), "#pragma once").unwrap();

        for (id, mode) in [("s", InputMode::Symlink), ("h", InputMode::Hardlink), ("c", InputMode::Copy)] {
            let scratch = ScratchDir::create(tmp.path(), id).unwrap();
            scratch
                .stage_inputs(&inputs(&[("src/a.c", &src), ("include", &dir)]), mode)
                .unwrap();

            let exec = scratch.exec_root();
            assert_eq!(fs::read_to_string(exec.join("src/a.c")).unwrap(), "int main() {}");
            assert_eq!(fs::read_to_string(exec.join("include/a.h")).unwrap(), "#pragma once");
            if mode == InputMode::Copy {
                let copied = fs::symlink_metadata(exec.join("src/a.c")).unwrap();
                assert!(!copied.file_type().is_symlink());
                assert!(copied.permissions().readonly());
                assert!(fs::metadata(exec.join("include/a.h")).unwrap().permissions().readonly());
            }
        }
    }

    #[test]
    fn test_stage_rejects_escape_and_missing() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("a.c");
        fs::write(&src, "").unwrap();
        let scratch = ScratchDir::create(tmp.path(), "x").unwrap();

        let err = scratch
            .stage_inputs(&inputs(&[("../a.c", &src)]), InputMode::Copy)
            .unwrap_err();
        assert!(matches!(err, SandboxError::PathEscape(_)));

        let missing = tmp.path().join("missing.c");
        let err = scratch
            .stage_inputs(&inputs(&[("a.c", &missing)]), InputMode::Copy)
            .unwrap_err();
        assert!(matches!(err, SandboxError::StageInput { .. }));
    }

    #[test]
    fn test_deliver_outputs() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("out");
        let scratch = ScratchDir::create(&tmp.path().join("sb"), "1").unwrap();
        let outputs = vec![PathBuf::from("bin/app"), PathBuf::from("gen"), PathBuf::from("never")];

        scratch.prepare_outputs(&outputs).unwrap();
        fs::write(scratch.exec_root().join("bin/app"), "ELF").unwrap();
        fs::create_dir(scratch.exec_root().join("gen")).unwrap();
        fs::write(scratch.exec_root().join("gen/a.rs"), "// gen").unwrap();

        // Stale output from an earlier run is replaced
        fs::create_dir_all(dest.join("bin")).unwrap();
        fs::write(dest.join("bin/app"), "old").unwrap();

        let delivered = scratch.deliver_outputs(&outputs, &dest).unwrap();
        assert_eq!(delivered, vec![PathBuf::from("bin/app"), PathBuf::from("gen")]);
        assert_eq!(fs::read_to_string(dest.join("bin/app")).unwrap(), "ELF");
        assert_eq!(fs::read_to_string(dest.join("gen/a.rs")).unwrap(), "// gen");
        assert!(!dest.join("never").exists());
    }
}
