//! Guest-side file operations.
//!
//! Relative paths resolve against the agent's working directory, which
//! `guestchdir` changes and ShellExecs run in.

// ============================================================================
// Imports
// ============================================================================

use std::fs::{self, File, OpenOptions};
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::debug;
use walkdir::WalkDir;
use zip::ZipArchive;

use crate::error::{Error, Result};
use crate::protocol::FileCommand;

// ============================================================================
// WorkingDir
// ============================================================================

/// The agent's current directory, shared by file ops and ShellExecs.
#[derive(Debug, Clone)]
pub struct WorkingDir(Arc<Mutex<PathBuf>>);

impl WorkingDir {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self(Arc::new(Mutex::new(path)))
    }

    /// Returns the current directory.
    #[must_use]
    pub fn get(&self) -> PathBuf {
        self.0.lock().clone()
    }

    /// Resolves `path` against the current directory.
    #[must_use]
    pub fn resolve(&self, path: &str) -> PathBuf {
        self.0.lock().join(path)
    }

    fn set(&self, path: PathBuf) {
        *self.0.lock() = path;
    }
}

// ============================================================================
// Apply
// ============================================================================

/// Executes one `file` command. Blocking.
pub(crate) fn apply(command: FileCommand, cwd: &WorkingDir) -> Result<()> {
    debug!(sub_verb = command.sub_verb(), "File command");

    match command {
        FileCommand::Copy { target, contents } => {
            let path = cwd.resolve(&target);
            create_parent(&path)?;
            fs::write(&path, contents)?;
        }
        FileCommand::CopyDirectory {
            target_dir,
            archive,
        } => {
            let dir = cwd.resolve(&target_dir);
            fs::create_dir_all(&dir)?;
            let entries = extract_archive(&archive, &dir)?;
            debug!(dir = %dir.display(), entries, "Archive extracted");
        }
        FileCommand::CreateDirectory { path } => fs::create_dir_all(cwd.resolve(&path))?,
        FileCommand::Touch { path } => touch(&cwd.resolve(&path))?,
        FileCommand::GuestCopy { source, target } => {
            copy(&cwd.resolve(&source), &cwd.resolve(&target))?;
        }
        FileCommand::GuestMove { source, target } => {
            let source = cwd.resolve(&source);
            let target = into_dir(&source, cwd.resolve(&target));
            fs::rename(&source, &target)?;
        }
        FileCommand::GuestDelete { path } => {
            let path = cwd.resolve(&path);
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        FileCommand::ChangeDirectory { path } => {
            let path = cwd.resolve(&path);
            if !path.is_dir() {
                return Err(Error::invalid_argument(format!(
                    "{} is not a directory",
                    path.display()
                )));
            }
            cwd.set(path);
        }
    }

    Ok(())
}

/// Unpacks a zip archive under `target`; returns the entry count.
///
/// Nothing is written if any entry would land outside `target`.
pub(crate) fn extract_archive(archive: &[u8], target: &Path) -> Result<usize> {
    let mut zip = ZipArchive::new(Cursor::new(archive))?;

    let mut entries = Vec::with_capacity(zip.len());
    for index in 0..zip.len() {
        let entry = zip.by_index(index)?;
        let relative = entry.enclosed_name().map(|path| path.to_path_buf());
        match relative {
            Some(relative) => entries.push((index, relative, entry.is_dir())),
            None => {
                return Err(Error::invalid_argument(format!(
                    "archive entry {:?} escapes the target directory",
                    entry.name()
                )));
            }
        }
    }

    for (index, relative, is_dir) in &entries {
        let path = target.join(relative);
        if *is_dir {
            fs::create_dir_all(&path)?;
            continue;
        }
        create_parent(&path)?;
        let mut entry = zip.by_index(*index)?;
        let mut file = File::create(&path)?;
        io::copy(&mut entry, &mut file)?;
    }

    Ok(entries.len())
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn touch(path: &Path) -> Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    file.set_modified(SystemTime::now())?;
    Ok(())
}

/// An existing directory target means "into that directory".
fn into_dir(source: &Path, target: PathBuf) -> PathBuf {
    match source.file_name() {
        Some(name) if target.is_dir() => target.join(name),
        _ => target,
    }
}

fn copy(source: &Path, target: &Path) -> Result<()> {
    let target = into_dir(source, target.to_path_buf());
    if !source.is_dir() {
        fs::copy(source, &target)?;
        return Ok(());
    }

    for entry in WalkDir::new(source) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|_| Error::invalid_argument("walked outside the copy source"))?;
        let destination = target.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&destination)?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &destination)?;
        }
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
