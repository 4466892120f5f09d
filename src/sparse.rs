//! Sparse-aware file copy (§4.2). Grounded on `original_source/metadata.c`'s
//! `copySparse`: walk `(dataStart, dataEnd)` ranges via `SEEK_DATA`/`SEEK_HOLE`,
//! falling back to one full-file range when the filesystem doesn't support
//! sparse seeking.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;

use nix::errno::Errno;
use nix::unistd::{lseek, Whence};

use crate::error::{Error, Result};

const COPY_BUF: usize = 64 * 1024;

/// Copy `len` bytes from `src` (positioned at the caller's discretion; we
/// always seek explicitly) into `dst`, creating `dst`'s content sparsely
/// where `src` has holes. `dst` must already be open for writing and
/// truncated to length 0.
pub fn copy_sparse(src: &File, dst: &mut File, len: u64) -> Result<()> {
    let mut pos: u64 = 0;
    let mut buf = vec![0u8; COPY_BUF];

    while pos < len {
        let (data_start, data_end) = match next_data_range(src, pos, len) {
            Some(range) => range,
            None => break, // rest of file is a hole
        };

        if data_start > pos {
            // skip the hole by extending dst's length without writing.
            dst.seek(SeekFrom::Start(data_start)).map_err(|e| Error::io("<dest>", e))?;
        }

        let mut cursor = data_start;
        let mut reader = src.try_clone().map_err(|e| Error::io("<src>", e))?;
        reader.seek(SeekFrom::Start(cursor)).map_err(|e| Error::io("<src>", e))?;
        dst.seek(SeekFrom::Start(cursor)).map_err(|e| Error::io("<dest>", e))?;

        while cursor < data_end {
            let want = std::cmp::min(buf.len() as u64, data_end - cursor) as usize;
            let n = reader.read(&mut buf[..want]).map_err(|e| Error::io("<src>", e))?;
            if n == 0 {
                break;
            }
            dst.write_all(&buf[..n]).map_err(|e| Error::io("<dest>", e))?;
            cursor += n as u64;
        }

        pos = data_end;
    }

    dst.set_len(len).map_err(|e| Error::io("<dest>", e))?;
    Ok(())
}

/// Finds the next non-hole range `[start, end)` at or after `pos`, within
/// `[0, len)`. Returns `None` once no more data exists. Falls back to
/// treating the whole remaining span as data when the filesystem doesn't
/// support `SEEK_DATA`/`SEEK_HOLE` (`ENXIO` on the initial seek, or any
/// other "not supported" style error).
fn next_data_range(src: &File, pos: u64, len: u64) -> Option<(u64, u64)> {
    if pos >= len {
        return None;
    }

    let fd = src.as_raw_fd();
    let data_start = match lseek(fd, pos as i64, Whence::SeekData) {
        Ok(off) => off as u64,
        Err(Errno::ENXIO) => return None, // no more data after pos
        Err(_) => pos, // unsupported: treat remainder as one data range
    };

    if data_start >= len {
        return None;
    }

    let data_end = match lseek(fd, data_start as i64, Whence::SeekHole) {
        Ok(off) => (off as u64).min(len),
        Err(_) => len,
    };

    // restore a sane file position isn't required: callers always re-seek.
    Some((data_start, data_end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn copies_dense_file_fully() {
        let mut src = tempfile::tempfile().unwrap();
        src.write_all(b"hello world").unwrap();
        src.flush().unwrap();

        let mut dst = tempfile::tempfile().unwrap();
        copy_sparse(&src, &mut dst, 11).unwrap();

        let mut out = Vec::new();
        dst.seek(SeekFrom::Start(0)).unwrap();
        dst.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn zero_length_file_copies_to_empty() {
        let src = tempfile::tempfile().unwrap();
        let mut dst = tempfile::tempfile().unwrap();
        copy_sparse(&src, &mut dst, 0).unwrap();
        assert_eq!(dst.metadata().unwrap().len(), 0);
    }
}
