//! Shadow-path helper (§4.4): computes the sibling on-disk names for one
//! source-side name and provides scoped locking on the marker file. Naming
//! scheme per §6: a three-character prefix `ni?` (discriminator `i`, `m`,
//! `c`, `d`) followed by the source-side name, all siblings in the same
//! destination directory.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use fs4::FileExt;
use nix::dir::Dir;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;

use crate::error::{Error, Result};

/// Discriminator characters from §6's on-disk format table.
pub mod discriminator {
    pub const MARKER: char = 'i';
    pub const METADATA: char = 'm';
    pub const CONTENT: char = 'c';
    pub const DESCENT: char = 'd';
}

pub fn sibling_name(discriminator: char, source_name: &str) -> String {
    format!("ni{discriminator}{source_name}")
}

/// The four sibling on-disk names for one source-side name, computed
/// relative to a single destination parent directory.
pub struct ShadowPaths {
    pub marker: String,
    pub metadata_dir: String,
    pub content_dir: String,
    pub descent_dir: String,
}

impl ShadowPaths {
    pub fn for_name(source_name: &str) -> Self {
        ShadowPaths {
            marker: sibling_name(discriminator::MARKER, source_name),
            metadata_dir: sibling_name(discriminator::METADATA, source_name),
            content_dir: sibling_name(discriminator::CONTENT, source_name),
            descent_dir: sibling_name(discriminator::DESCENT, source_name),
        }
    }
}

/// A held whole-file advisory lock on a ShadowEntry's marker file. Released
/// on drop, covering every exit path including error unwinding (§4.4, I4).
pub struct MarkerLock {
    file: File,
    path: std::path::PathBuf,
}

impl MarkerLock {
    /// Open (creating if absent) and exclusively lock the marker file for
    /// `name` under `parent_dest`.
    pub fn acquire_exclusive(parent_dest: &Dir, name: &str, path_hint: &Path) -> Result<Self> {
        let file = open_marker(parent_dest, name, path_hint)?;
        file.lock_exclusive().map_err(|e| Error::io(path_hint, e))?;
        Ok(MarkerLock { file, path: path_hint.to_path_buf() })
    }

    /// Open (must already exist; §6 readers never create a ShadowEntry) and
    /// share-lock the marker file, for list/restore/purge readers.
    pub fn acquire_shared(parent_dest: &Dir, name: &str, path_hint: &Path) -> Result<Self> {
        let file = open_marker_existing(parent_dest, name, path_hint)?;
        file.lock_shared().map_err(|e| Error::io(path_hint, e))?;
        Ok(MarkerLock { file, path: path_hint.to_path_buf() })
    }

    pub fn read_revision(&mut self) -> Result<u64> {
        let mut buf = String::new();
        self.file.read_to_string(&mut buf).map_err(|e| Error::io(&self.path, e))?;
        if buf.trim().is_empty() {
            Ok(0)
        } else {
            buf.trim()
                .parse()
                .map_err(|_| Error::ConfigError(format!("marker file {} malformed", self.path.display())))
        }
    }

    pub fn write_revision(&mut self, revision: u64) -> Result<()> {
        use std::io::{Seek, SeekFrom};
        self.file.set_len(0).map_err(|e| Error::io(&self.path, e))?;
        self.file.seek(SeekFrom::Start(0)).map_err(|e| Error::io(&self.path, e))?;
        write!(self.file, "{revision}").map_err(|e| Error::io(&self.path, e))?;
        self.file.sync_all().map_err(|e| Error::io(&self.path, e))?;
        Ok(())
    }
}

impl Drop for MarkerLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn open_marker(parent_dest: &Dir, name: &str, path_hint: &Path) -> Result<File> {
    use std::os::fd::{AsRawFd, FromRawFd};
    let fd = nix::fcntl::openat(
        parent_dest.as_raw_fd(),
        name,
        OFlag::O_RDWR | OFlag::O_CREAT,
        Mode::from_bits_truncate(0o600),
    )
    .map_err(|e| Error::io(path_hint, std::io::Error::from(e)))?;
    Ok(unsafe { File::from_raw_fd(fd) })
}

fn open_marker_existing(parent_dest: &Dir, name: &str, path_hint: &Path) -> Result<File> {
    use std::os::fd::{AsRawFd, FromRawFd};
    let fd = nix::fcntl::openat(parent_dest.as_raw_fd(), name, OFlag::O_RDONLY, Mode::empty())
        .map_err(|e| Error::io(path_hint, std::io::Error::from(e)))?;
    Ok(unsafe { File::from_raw_fd(fd) })
}

/// Ensures `name` exists as a directory under `parent`, tolerating
/// already-exists (§4.5 step 2, and mkdir-races in §5).
pub fn ensure_dir(parent: &Dir, name: &str) -> Result<()> {
    use std::os::fd::AsRawFd;
    match nix::sys::stat::mkdirat(parent.as_raw_fd(), name, Mode::from_bits_truncate(0o700)) {
        Ok(()) | Err(nix::errno::Errno::EEXIST) => Ok(()),
        Err(e) => Err(Error::io(name, std::io::Error::from(e))),
    }
}

/// Opens an existing directory handle relative to `parent`.
pub fn open_dir(parent: &Dir, name: &str) -> Result<Dir> {
    use std::os::fd::AsRawFd;
    Dir::openat(
        parent.as_raw_fd(),
        name,
        OFlag::O_RDONLY | OFlag::O_DIRECTORY,
        Mode::empty(),
    )
    .map_err(|e| Error::io(name, std::io::Error::from(e)))
}

/// Creates a file suitable for full content payload (`0600`), truncating if
/// it already exists (§4.2).
pub fn create_payload_file(dir: &Dir, name: &str) -> Result<File> {
    use std::os::fd::{AsRawFd, FromRawFd};
    let fd = nix::fcntl::openat(
        dir.as_raw_fd(),
        name,
        OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_TRUNC,
        Mode::from_bits_truncate(0o600),
    )
    .map_err(|e| Error::io(name, std::io::Error::from(e)))?;
    Ok(unsafe { File::from_raw_fd(fd) })
}

/// Unlinks `name` under `dir`, tolerating not-found (caller may be cleaning
/// up after a failure, per §4.5's rollback semantics).
pub fn remove_if_present(dir: &Dir, name: &str) -> Result<()> {
    use std::os::fd::AsRawFd;
    match nix::unistd::unlinkat(Some(dir.as_raw_fd()), name, nix::unistd::UnlinkatFlags::NoRemoveDir) {
        Ok(()) | Err(nix::errno::Errno::ENOENT) => Ok(()),
        Err(e) => Err(Error::io(name, std::io::Error::from(e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sibling_names_use_discriminator_scheme() {
        let p = ShadowPaths::for_name("a.txt");
        assert_eq!(p.marker, "niia.txt");
        assert_eq!(p.metadata_dir, "nima.txt");
        assert_eq!(p.content_dir, "nica.txt");
        assert_eq!(p.descent_dir, "nida.txt");
    }
}
