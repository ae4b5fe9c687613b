//! File and directory transfer.
//!
//! | Operation | Payload |
//! |-----------|---------|
//! | [`GuestLink::copy_file`] | `file filecopy <b64 target path> <raw bytes>` |
//! | [`GuestLink::copy_directory`] | `file dircopy <b64 target dir> <b64 zip>` |
//! | [`GuestLink::create_directory`] | `file dircreate <b64 path>` |
//! | [`GuestLink::touch_file`] | `file touch <b64 path>` |
//! | [`GuestLink::guest_copy`] / [`GuestLink::guest_move`] | `file guestcopy\|guestmove <b64 src> <b64 dst>` |
//! | [`GuestLink::guest_delete`] | `file guestdelete <b64 path>` |
//! | [`GuestLink::change_working_dir`] | `file guestchdir <b64 path>` |
//!
//! All of these are fire-and-forget: the guest sends no acknowledgement and
//! reports failures only in its own log.

// ============================================================================
// Imports
// ============================================================================

use std::fs::File;
use std::io::{self, Cursor};
use std::path::Path;

use tracing::debug;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{Error, Result};
use crate::protocol::{FileCommand, GuestCommand};

use super::GuestLink;

// ============================================================================
// Path Helpers
// ============================================================================

/// Appends `name` to a guest directory path.
///
/// Keeps a trailing separator if present, otherwise uses `\` for paths that
/// look like Windows paths and `/` for everything else.
#[must_use]
pub fn join_guest_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        return name.to_string();
    }
    if dir.ends_with('/') || dir.ends_with('\\') {
        return format!("{dir}{name}");
    }
    let separator = if dir.contains('\\') && !dir.contains('/') {
        '\\'
    } else {
        '/'
    };
    format!("{dir}{separator}{name}")
}

/// Final component of a local path, as UTF-8.
pub(crate) fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| Error::invalid_argument(format!("no file name in {}", path.display())))
}

// ============================================================================
// Archive
// ============================================================================

/// Zips the contents of `root`, entries relative to it with `/` separators.
///
/// Directories get their own entries so empty ones survive the trip.
/// Symbolic links are skipped.
///
/// # Errors
///
/// - [`Error::InvalidArgument`] if `root` is not a directory
/// - [`Error::WalkDir`], [`Error::Io`] or [`Error::Zip`] on read or archive failure
pub fn build_archive(root: &Path) -> Result<Vec<u8>> {
    if !root.is_dir() {
        return Err(Error::invalid_argument(format!(
            "{} is not a directory",
            root.display()
        )));
    }

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| Error::invalid_argument("walked outside the archive root"))?;
        let name = relative
            .components()
            .map(|part| part.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if entry.file_type().is_dir() {
            writer.add_directory(name, options)?;
        } else if entry.file_type().is_file() {
            writer.start_file(name, options)?;
            let mut file = File::open(entry.path())?;
            io::copy(&mut file, &mut writer)?;
        }
    }

    Ok(writer.finish()?.into_inner())
}

// ============================================================================
// GuestLink Transfer Operations
// ============================================================================

impl GuestLink {
    /// Copies a local file into a guest directory.
    ///
    /// # Arguments
    ///
    /// * `source` - Local file
    /// * `target_dir` - Existing guest directory; the file keeps its name
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if the local file cannot be read
    /// - [`Error::ConnectionClosed`] if the guest is not connected
    pub async fn copy_file(&self, source: impl AsRef<Path>, target_dir: &str) -> Result<()> {
        let source = source.as_ref();
        let target = join_guest_path(target_dir, &file_name(source)?);
        let contents = tokio::fs::read(source).await?;

        debug!(guest = %self.name(), %target, len = contents.len(), "Copying file");
        self.send_file(FileCommand::Copy { target, contents })
    }

    /// Copies a local directory's contents into a guest directory.
    ///
    /// The guest creates `target_dir` if needed.
    ///
    /// # Errors
    ///
    /// - any error of [`build_archive`]
    /// - [`Error::ConnectionClosed`] if the guest is not connected
    pub async fn copy_directory(&self, source: impl AsRef<Path>, target_dir: &str) -> Result<()> {
        let source = source.as_ref().to_path_buf();
        let archive = tokio::task::spawn_blocking(move || build_archive(&source))
            .await
            .map_err(|e| Error::handler(format!("archive task failed: {e}")))??;

        debug!(guest = %self.name(), target_dir, len = archive.len(), "Copying directory");
        self.send_file(FileCommand::CopyDirectory {
            target_dir: target_dir.to_string(),
            archive,
        })
    }

    /// Creates a directory, with parents, on the guest.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the guest is not connected.
    pub fn create_directory(&self, path: &str) -> Result<()> {
        self.send_file(FileCommand::CreateDirectory {
            path: path.to_string(),
        })
    }

    /// Creates an empty file or updates its modification time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the guest is not connected.
    pub fn touch_file(&self, path: &str) -> Result<()> {
        self.send_file(FileCommand::Touch {
            path: path.to_string(),
        })
    }

    /// Copies a file or directory within the guest.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the guest is not connected.
    pub fn guest_copy(&self, source: &str, target: &str) -> Result<()> {
        self.send_file(FileCommand::GuestCopy {
            source: source.to_string(),
            target: target.to_string(),
        })
    }

    /// Moves a file or directory within the guest.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the guest is not connected.
    pub fn guest_move(&self, source: &str, target: &str) -> Result<()> {
        self.send_file(FileCommand::GuestMove {
            source: source.to_string(),
            target: target.to_string(),
        })
    }

    /// Deletes a file or directory tree on the guest.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the guest is not connected.
    pub fn guest_delete(&self, path: &str) -> Result<()> {
        self.send_file(FileCommand::GuestDelete {
            path: path.to_string(),
        })
    }

    /// Changes the agent's working directory for later ShellExecs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the guest is not connected.
    pub fn change_working_dir(&self, path: &str) -> Result<()> {
        self.send_file(FileCommand::ChangeDirectory {
            path: path.to_string(),
        })
    }

    fn send_file(&self, command: FileCommand) -> Result<()> {
        self.send(GuestCommand::File(command).to_payload())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Read;

    use zip::ZipArchive;

    use crate::protocol::args::encode_field;
    use crate::testing::FramePeer;

    #[test]
    fn test_join_guest_path() {
        assert_eq!(join_guest_path("C:\\Users\\bob", "a.txt"), "C:\\Users\\bob\\a.txt");
        assert_eq!(join_guest_path("C:\\Users\\bob\\", "a.txt"), "C:\\Users\\bob\\a.txt");
        assert_eq!(join_guest_path("/home/bob", "a.txt"), "/home/bob/a.txt");
        assert_eq!(join_guest_path("/home/bob/", "a.txt"), "/home/bob/a.txt");
        assert_eq!(join_guest_path("", "a.txt"), "a.txt");
    }

    #[test]
    fn test_build_archive_relative_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("docs/empty")).expect("mkdir");
        std::fs::write(dir.path().join("readme.txt"), b"hello").expect("write");
        std::fs::write(dir.path().join("docs/report.txt"), b"quarterly").expect("write");

        let archive = build_archive(dir.path()).expect("archive");
        let mut zip = ZipArchive::new(Cursor::new(archive)).expect("valid zip");

        let mut names: Vec<String> = zip.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(
            names,
            vec!["docs/", "docs/empty/", "docs/report.txt", "readme.txt"]
        );

        let mut contents = String::new();
        zip.by_name("docs/report.txt")
            .expect("entry")
            .read_to_string(&mut contents)
            .expect("read");
        assert_eq!(contents, "quarterly");
    }

    #[test]
    fn test_build_archive_rejects_file() {
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        let err = build_archive(file.path()).expect_err("not a directory");
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn test_copy_file_payload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("payload.bin");
        std::fs::write(&source, b"\x00\x01 raw bytes").expect("write");

        let link = GuestLink::builder("guest").build().expect("build");
        let (local, remote) = tokio::io::duplex(4096);
        link.attach(local);
        let mut peer = FramePeer::new(remote);

        link.copy_file(&source, "C:\\Temp").await.expect("copy");

        let mut expected = format!("file filecopy {} ", encode_field("C:\\Temp\\payload.bin")).into_bytes();
        expected.extend_from_slice(b"\x00\x01 raw bytes");
        assert_eq!(peer.recv().await, expected);
    }

    #[tokio::test]
    async fn test_file_ops_require_connection() {
        let link = GuestLink::builder("guest").build().expect("build");
        assert!(matches!(link.guest_delete("/tmp/x"), Err(Error::ConnectionClosed)));
        assert!(matches!(
            link.copy_file("/definitely/missing/file", "/tmp").await,
            Err(Error::Io(_))
        ));
    }
}
