//! The page-migration primitive.

use std::io;

/// Moves pages of one process to explicit destination nodes. Production
/// issues the `move_pages` syscall; tests record the calls.
pub trait PageMover: Send + Sync {
    /// Returns the kernel-filled per-page status vector.
    fn move_pages(&self, pid: i32, addrs: &[u64], dest_nodes: &[i32]) -> io::Result<Vec<i32>>;
}

pub struct SyscallMover;

impl PageMover for SyscallMover {
    fn move_pages(&self, pid: i32, addrs: &[u64], dest_nodes: &[i32]) -> io::Result<Vec<i32>> {
        debug_assert_eq!(addrs.len(), dest_nodes.len());
        let pages: Vec<*mut libc::c_void> =
            addrs.iter().map(|&a| a as *mut libc::c_void).collect();
        let mut status = vec![-123i32; addrs.len()];
        let rc = unsafe {
            libc::syscall(
                libc::SYS_move_pages,
                pid as libc::pid_t,
                pages.len() as libc::c_ulong,
                pages.as_ptr(),
                dest_nodes.as_ptr(),
                status.as_mut_ptr(),
                0 as libc::c_int,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(status)
    }
}
