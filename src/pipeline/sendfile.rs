//! Zero-copy file transmission.
//!
//! A [`FileRegion`] is the transfer instruction for a static body: file
//! handle, offset and length. On plaintext HTTP/1.1 it goes to the kernel
//! through `sendfile(2)` and never touches the arena; framed protocols
//! read it into staging piece by piece.

use std::fs::File;
use std::io;
use std::os::fd::AsFd;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use crate::error::Error;

/// Largest single `sendfile` call; some kernels reject bigger counts.
const MAX_SENDFILE: usize = 1 << 30;

#[derive(Debug, Clone)]
pub struct FileRegion {
    pub file: Arc<File>,
    pub offset: u64,
    /// Bytes left to send.
    pub len: u64,
}

impl FileRegion {
    pub fn new(file: File, offset: u64, len: u64) -> Self {
        Self { file: Arc::new(file), offset, len }
    }

    pub fn is_done(&self) -> bool {
        self.len == 0
    }

    /// Copy the next piece into `dst` and advance. Returns 0 once done.
    pub fn read_into(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let want = dst.len().min(self.len as usize);
        if want == 0 {
            return Ok(0);
        }
        let n = self.file.read_at(&mut dst[..want], self.offset)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "file shrank while sending"));
        }
        self.advance(n);
        Ok(n)
    }

    fn advance(&mut self, n: usize) {
        self.offset += n as u64;
        self.len -= n as u64;
    }
}

/// Push as much of `region` as the socket takes. Returns the bytes sent;
/// `Err(WouldBlock)` when the socket is full.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn send_file<S: AsFd>(socket: &S, region: &mut FileRegion) -> Result<usize, Error> {
    if region.is_done() {
        return Ok(0);
    }
    let count = (region.len as usize).min(MAX_SENDFILE);
    let mut offset = region.offset as nix::libc::off_t;
    let n = nix::sys::sendfile::sendfile(socket.as_fd(), region.file.as_fd(), Some(&mut offset), count)
        .map_err(io::Error::from)?;
    if n == 0 {
        return Err(Error::Io(io::ErrorKind::UnexpectedEof));
    }
    region.advance(n);
    Ok(n)
}

/// Portable fallback: read then write through a small stack buffer.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn send_file<S: AsFd>(socket: &S, region: &mut FileRegion) -> Result<usize, Error> {
    use std::io::Write;
    use std::os::fd::BorrowedFd;

    if region.is_done() {
        return Ok(0);
    }
    let mut buf = [0u8; 16 * 1024];
    let want = buf.len().min(region.len as usize);
    let n = region.file.read_at(&mut buf[..want], region.offset)?;
    if n == 0 {
        return Err(Error::Io(io::ErrorKind::UnexpectedEof));
    }
    let fd: BorrowedFd<'_> = socket.as_fd();
    let mut out = File::from(fd.try_clone_to_owned()?);
    let written = out.write(&buf[..n])?;
    region.advance(written);
    Ok(written)
}
