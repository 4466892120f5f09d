//! Capture, serialize, parse and compare the seven-field metadata tuple
//! (§4.1). Grounded on `original_source/metadata.c`'s `openMetadata` /
//! `readMetadata` / `writeMetadata` / `cmpMetadata`.

use std::fs::File;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use nix::dir::Dir;
use nix::fcntl::OFlag;
use nix::sys::stat::{fstatat, Mode};

use crate::error::{Error, Result};

/// The seven-field type discriminant, one character on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Nonexistent,
    Regular,
    Directory,
    Symlink,
    Fifo,
    Other,
}

impl ObjectType {
    pub fn code(self) -> char {
        match self {
            ObjectType::Nonexistent => 'n',
            ObjectType::Regular => 'f',
            ObjectType::Directory => 'd',
            ObjectType::Symlink => 'l',
            ObjectType::Fifo => 'p',
            ObjectType::Other => 'x',
        }
    }

    pub fn from_code(c: char) -> Option<Self> {
        Some(match c {
            'n' => ObjectType::Nonexistent,
            'f' => ObjectType::Regular,
            'd' => ObjectType::Directory,
            'l' => ObjectType::Symlink,
            'p' => ObjectType::Fifo,
            'x' => ObjectType::Other,
            _ => return None,
        })
    }

    fn from_stat(mode: u32) -> Self {
        let file_type = mode & libc::S_IFMT;
        if file_type == libc::S_IFREG {
            ObjectType::Regular
        } else if file_type == libc::S_IFDIR {
            ObjectType::Directory
        } else if file_type == libc::S_IFLNK {
            ObjectType::Symlink
        } else if file_type == libc::S_IFIFO {
            ObjectType::Fifo
        } else {
            ObjectType::Other
        }
    }
}

/// The metadata tuple `M = (type, mode, uid, gid, size, mtime, ctime)`.
/// Equality is componentwise, bitwise on every field (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub kind: ObjectType,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: i64,
    pub ctime: i64,
}

impl Metadata {
    /// The tombstone tuple recorded for `r = 0` and for deletions.
    pub fn nonexistent() -> Self {
        Metadata {
            kind: ObjectType::Nonexistent,
            mode: 0,
            uid: 0,
            gid: 0,
            size: 0,
            mtime: 0,
            ctime: 0,
        }
    }

    pub fn is_nonexistent(&self) -> bool {
        self.kind == ObjectType::Nonexistent
    }

    /// Canonical on-disk form: `type\nmode\nuid\ngid\nsize\nmtime\nctime\n`.
    pub fn serialize(&self) -> String {
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}\n{}\n",
            self.kind.code(),
            self.mode,
            self.uid,
            self.gid,
            self.size,
            self.mtime,
            self.ctime
        )
    }

    /// Whitespace-tolerant parse of the canonical form.
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines().map(str::trim);
        let mut next = |field: &'static str| -> Result<&str> {
            lines
                .next()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| Error::ConfigError(format!("metadata field {field} missing")))
        };

        let kind = ObjectType::from_code(
            next("type")?
                .chars()
                .next()
                .ok_or_else(|| Error::ConfigError("metadata type field empty".into()))?,
        )
        .ok_or_else(|| Error::ConfigError("metadata type field unrecognised".into()))?;
        let parse_num = |s: &str, field: &'static str| {
            s.parse().map_err(|_| Error::ConfigError(format!("metadata field {field} malformed")))
        };
        let mode = parse_num(next("mode")?, "mode")?;
        let uid = parse_num(next("uid")?, "uid")?;
        let gid = parse_num(next("gid")?, "gid")?;
        let size = parse_num(next("size")?, "size")?;
        let mtime = parse_num(next("mtime")?, "mtime")?;
        let ctime = parse_num(next("ctime")?, "ctime")?;

        Ok(Metadata { kind, mode, uid, gid, size, mtime, ctime })
    }
}

/// An open handle confirmed (by inode match) to refer to the same object that
/// was `lstat`-ed, for regular files and directories. `None` for object kinds
/// that are never opened for race verification (symlink, fifo, other).
pub struct Captured {
    pub metadata: Metadata,
    pub handle: Option<File>,
}

/// `capture(dir, name)` from §4.1: stat without following symlinks; for
/// regular files and directories, additionally open and re-stat the handle
/// to defeat TOCTOU races between the initial `lstat` and subsequent use.
pub fn capture(dir: &Dir, name: &str) -> Result<Captured> {
    let dir_fd = dir.as_raw_fd();
    let lst = match fstatat(dir_fd, name, nix::fcntl::AtFlags::AT_SYMLINK_NOFOLLOW) {
        Ok(st) => st,
        Err(nix::errno::Errno::ENOENT) => {
            return Ok(Captured { metadata: Metadata::nonexistent(), handle: None })
        }
        Err(e) => return Err(io_err(name, e)),
    };

    let kind = ObjectType::from_stat(lst.st_mode as u32);

    let handle = match kind {
        ObjectType::Regular | ObjectType::Directory => {
            let opened = open_for_verify(dir_fd, name, kind)?;
            verify_identity(&opened, &lst, name)?;
            Some(opened)
        }
        _ => None,
    };

    let metadata = Metadata {
        kind,
        mode: lst.st_mode as u32,
        uid: lst.st_uid,
        gid: lst.st_gid,
        size: lst.st_size as u64,
        mtime: lst.st_mtime,
        ctime: lst.st_ctime,
    };

    Ok(Captured { metadata, handle })
}

fn open_for_verify(dir_fd: RawFd, name: &str, kind: ObjectType) -> Result<File> {
    use std::os::fd::FromRawFd;

    let flags = match kind {
        ObjectType::Directory => OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_NOFOLLOW,
        _ => OFlag::O_RDONLY | OFlag::O_NOFOLLOW,
    };
    let fd = nix::fcntl::openat(dir_fd, name, flags, Mode::empty()).map_err(|e| io_err(name, e))?;
    Ok(unsafe { File::from_raw_fd(fd) })
}

fn verify_identity(opened: &File, lst: &nix::sys::stat::FileStat, name: &str) -> Result<()> {
    let st = opened.metadata().map_err(|e| Error::io(name, e))?;
    if st.dev() != lst.st_dev as u64 || st.ino() != lst.st_ino as u64 || st.mode() != lst.st_mode as u32 {
        return Err(Error::RaceDetected {
            path: name.into(),
            detail: "inode identity changed between lstat and open".into(),
        });
    }
    Ok(())
}

fn io_err(name: &str, e: nix::errno::Errno) -> Error {
    Error::io(name, std::io::Error::from(e))
}

/// Reads metadata for revision `r` from `meta_dir/<r>.met`. A missing file is
/// treated as the nonexistent tuple unless `required` is set, in which case
/// it is `MissingRevision`.
pub fn read_revision(meta_dir: &Dir, revision: u64, required: bool, path_hint: &Path) -> Result<Metadata> {
    let name = format!("{revision}.met");
    match read_file_at(meta_dir, &name) {
        Ok(text) => Metadata::parse(&text),
        Err(Error::IoError { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
            if required {
                Err(Error::MissingRevision { path: path_hint.to_path_buf(), revision })
            } else {
                Ok(Metadata::nonexistent())
            }
        }
        Err(e) => Err(e),
    }
}

pub fn write_revision(meta_dir: &Dir, revision: u64, metadata: &Metadata) -> Result<()> {
    let name = format!("{revision}.met");
    write_file_at(meta_dir, &name, metadata.serialize().as_bytes())
}

fn read_file_at(dir: &Dir, name: &str) -> Result<String> {
    use std::io::Read;
    let fd = nix::fcntl::openat(dir.as_raw_fd(), name, OFlag::O_RDONLY, Mode::empty())
        .map_err(|e| io_err(name, e))?;
    let mut file = unsafe { File::from_raw_fd(fd) };
    let mut buf = String::new();
    file.read_to_string(&mut buf).map_err(|e| Error::io(name, e))?;
    Ok(buf)
}

/// Write-then-rename within `dir`, so a concurrent reader never observes a
/// truncated metadata file (§4.5 step 6).
fn write_file_at(dir: &Dir, name: &str, contents: &[u8]) -> Result<()> {
    use std::io::Write;
    let tmp_name = format!(".{name}.tmp");
    let fd = nix::fcntl::openat(
        dir.as_raw_fd(),
        tmp_name.as_str(),
        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
        Mode::from_bits_truncate(0o600),
    )
    .map_err(|e| io_err(&tmp_name, e))?;
    {
        let mut file = unsafe { File::from_raw_fd(fd) };
        file.write_all(contents).map_err(|e| Error::io(name, e))?;
        file.sync_all().map_err(|e| Error::io(name, e))?;
    }
    nix::fcntl::renameat(
        Some(dir.as_raw_fd()),
        tmp_name.as_str(),
        Some(dir.as_raw_fd()),
        name,
    )
    .map_err(|e| io_err(name, e))?;
    Ok(())
}

use std::os::fd::FromRawFd as _;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_parse_roundtrip() {
        let m = Metadata {
            kind: ObjectType::Regular,
            mode: 0o100644,
            uid: 1000,
            gid: 1000,
            size: 5,
            mtime: 100,
            ctime: 100,
        };
        let text = m.serialize();
        let back = Metadata::parse(&text).unwrap();
        assert_eq!(m, back);
    }

    #[test]
    fn parse_is_whitespace_tolerant() {
        let text = " f \n 0644 \n0\n0\n0\n0\n0\n";
        let m = Metadata::parse(text).unwrap();
        assert_eq!(m.kind, ObjectType::Regular);
        assert_eq!(m.mode, 644);
    }

    #[test]
    fn nonexistent_tuple_is_distinct() {
        let a = Metadata::nonexistent();
        assert!(a.is_nonexistent());
        let b = Metadata { kind: ObjectType::Regular, ..a };
        assert_ne!(a, b);
    }

    #[test]
    fn object_type_code_roundtrip() {
        for kind in [
            ObjectType::Nonexistent,
            ObjectType::Regular,
            ObjectType::Directory,
            ObjectType::Symlink,
            ObjectType::Fifo,
            ObjectType::Other,
        ] {
            assert_eq!(ObjectType::from_code(kind.code()), Some(kind));
        }
    }
}
