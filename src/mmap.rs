//! Memory-mapped file handling.
//!
//! Maps the input object file read-only so the linker can parse it in
//! place, without copying the whole file into memory first. The mapping
//! lives for the lifetime of the [`MappedFile`] and is torn down on drop.

use crate::Result;
use std::ffi::CString;

/// A read-only memory-mapped file.
pub struct MappedFile {
    addr: *mut libc::c_void,
    size: usize,
    pub data: &'static [u8],
}

impl MappedFile {
    /// Map the file at `path` read-only.
    pub fn open(path: &str) -> Result<MappedFile> {
        let c_path = CString::new(path).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "path contains null byte")
        })?;
        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDONLY) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let mut statbuf: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut statbuf) } < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err.into());
        }
        if statbuf.st_mode & libc::S_IFMT != libc::S_IFREG {
            unsafe { libc::close(fd) };
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "not a regular file",
            )
            .into());
        }
        let size = statbuf.st_size as usize;
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                fd,
                0,
            )
        };
        // The descriptor is no longer needed once the mapping exists.
        unsafe { libc::close(fd) };
        if addr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error().into());
        }
        let data = unsafe { std::slice::from_raw_parts(addr as *const u8, size) };
        Ok(MappedFile { addr, size, data })
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.addr, self.size);
        }
    }
}
