//! Checked wrappers around the OS primitives the harness uses.
//!
//! Every wrapper either returns the validated success value or a Broken
//! [`Failure`] naming the call. Acquired resources are owned by guards
//! (`File`, [`Mapping`], [`HandlerGuard`], [`SharedPage`]) so a test body
//! that bails out with `?` releases everything it acquired so far.

use crate::failure::{Failure, Result, SafeCall};
use nix::errno::Errno;
use nix::sys::mman::{self, MapFlags, MmapAdvise, MsFlags, ProtFlags};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{self, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid, SysconfVar};
use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::mem::{self, MaybeUninit};
use std::num::NonZeroUsize;
use std::ops::Deref;
use std::os::fd::AsFd;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::ptr::{self, NonNull};
use tracing::{debug, warn};

/// Returns the system page size.
pub fn page_size() -> Result<usize> {
    match unistd::sysconf(SysconfVar::PAGE_SIZE).safe("sysconf(_SC_PAGESIZE)")? {
        Some(size) if size > 0 => Ok(size as usize),
        _ => Err(Failure::broken("sysconf(_SC_PAGESIZE) returned no value")),
    }
}

/// Whether the harness runs with an effective uid of 0.
pub fn is_root() -> bool {
    unistd::geteuid().is_root()
}

/// Opens `path` with the given options.
pub fn open(path: &Path, options: &OpenOptions) -> Result<File> {
    options
        .open(path)
        .safe(format_args!("open({})", path.display()))
}

/// Writes the whole buffer.
pub fn write_all(file: &mut File, buf: &[u8]) -> Result<()> {
    file.write_all(buf)
        .safe(format_args!("write({} bytes)", buf.len()))
}

/// Fills the whole buffer.
pub fn read_exact(file: &mut File, buf: &mut [u8]) -> Result<()> {
    file.read_exact(buf)
        .safe(format_args!("read({} bytes)", buf.len()))
}

/// Moves the file offset.
pub fn seek(file: &mut File, pos: SeekFrom) -> Result<u64> {
    file.seek(pos).safe(format_args!("lseek({pos:?})"))
}

/// Changes the permission bits of an open file.
pub fn fchmod(file: &File, mode: u32) -> Result<()> {
    file.set_permissions(std::fs::Permissions::from_mode(mode))
        .safe(format_args!("fchmod({mode:o})"))
}

/// Returns the size of an open file.
pub fn file_len(file: &File) -> Result<u64> {
    Ok(file.metadata().safe("fstat")?.len())
}

/// Reads a whole procfs (or any text) file.
pub fn read_to_string(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).safe(format_args!("read({})", path.display()))
}

/// Sends `signal` to `pid`.
pub fn kill(pid: Pid, signal: Signal) -> Result<()> {
    signal::kill(pid, signal).safe(format_args!("kill({pid}, {signal})"))
}

/// Waits for a state change of `pid`, retrying on EINTR.
pub fn waitpid(pid: Pid, flags: Option<WaitPidFlag>) -> Result<WaitStatus> {
    loop {
        match wait::waitpid(pid, flags) {
            Err(Errno::EINTR) => continue,
            other => return other.safe(format_args!("waitpid({pid})")),
        }
    }
}

/// Forks the calling process.
///
/// # Safety
/// Same contract as [`nix::unistd::fork`]: the child of a multi-threaded
/// process may only run async-signal-safe code before it exits.
pub unsafe fn fork() -> Result<ForkResult> {
    unistd::fork().safe("fork")
}

/// Sets the disposition of `signal` without keeping a guard.
///
/// Meant for forked children whose address space is discarded on exit.
pub fn set_disposition(signal: Signal, handler: SigHandler) -> Result<SigHandler> {
    unsafe { signal::signal(signal, handler) }.safe(format_args!("signal({signal})"))
}

/// Returns the handler currently installed for `signal`.
///
/// Only queries the action; the disposition never changes in between.
pub fn current_handler(signal: Signal) -> Result<SigHandler> {
    let mut current = MaybeUninit::<libc::sigaction>::zeroed();
    Errno::result(unsafe { libc::sigaction(signal as libc::c_int, ptr::null(), current.as_mut_ptr()) })
        .safe(format_args!("sigaction({signal}, NULL)"))?;
    let current = unsafe { current.assume_init() };

    Ok(match current.sa_sigaction {
        libc::SIG_DFL => SigHandler::SigDfl,
        libc::SIG_IGN => SigHandler::SigIgn,
        addr if current.sa_flags & libc::SA_SIGINFO != 0 => SigHandler::SigAction(unsafe {
            mem::transmute::<
                libc::sighandler_t,
                extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut c_void),
            >(addr)
        }),
        addr => SigHandler::Handler(unsafe {
            mem::transmute::<libc::sighandler_t, extern "C" fn(libc::c_int)>(addr)
        }),
    })
}

/// An installed signal action, restored to the previous one when dropped.
#[derive(Debug)]
pub struct HandlerGuard {
    signal: Signal,
    previous: Option<SigAction>,
}

impl HandlerGuard {
    /// Installs `handler` for `signal`, remembering the previous action.
    pub fn install(signal: Signal, handler: SigHandler, flags: SaFlags) -> Result<Self> {
        let action = SigAction::new(handler, flags, SigSet::empty());
        let previous = unsafe { signal::sigaction(signal, &action) }
            .safe(format_args!("sigaction({signal})"))?;
        debug!("installed handler for {}", signal);
        Ok(Self {
            signal,
            previous: Some(previous),
        })
    }

    fn restore_previous(&mut self) -> Result<()> {
        if let Some(previous) = self.previous.take() {
            unsafe { signal::sigaction(self.signal, &previous) }
                .safe(format_args!("sigaction({}) restore", self.signal))?;
            debug!("restored previous handler for {}", self.signal);
        }
        Ok(())
    }
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        if let Err(e) = self.restore_previous() {
            warn!("{}", e.detail());
        }
    }
}

/// A memory mapping, unmapped when dropped.
#[derive(Debug)]
pub struct Mapping {
    addr: NonNull<c_void>,
    len: usize,
}

impl Mapping {
    /// Maps `len` bytes of `fd` starting at `offset`.
    pub fn map_file<F: AsFd>(
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
        fd: F,
        offset: libc::off_t,
    ) -> Result<Self> {
        let length = non_zero(len)?;
        let addr = unsafe { mman::mmap(None, length, prot, flags, fd, offset) }
            .safe(format_args!("mmap({len}, {prot:?}, {flags:?})"))?;
        Ok(Self { addr, len })
    }

    /// Maps `len` bytes of anonymous memory.
    pub fn map_anonymous(len: usize, prot: ProtFlags, flags: MapFlags) -> Result<Self> {
        let length = non_zero(len)?;
        let addr = unsafe { mman::mmap_anonymous(None, length, prot, flags) }
            .safe(format_args!("mmap({len}, {prot:?}, {flags:?} | MAP_ANONYMOUS)"))?;
        Ok(Self { addr, len })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr().cast()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Views the mapping as bytes.
    ///
    /// # Safety
    /// The mapping must be readable over its whole length, otherwise the
    /// first access faults. Wrap such reads in a fault probe.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.as_ptr(), self.len)
    }

    /// Views the mapping as mutable bytes.
    ///
    /// # Safety
    /// The mapping must be writable over its whole length.
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.as_ptr(), self.len)
    }

    pub fn msync(&self, flags: MsFlags) -> Result<()> {
        unsafe { mman::msync(self.addr, self.len, flags) }
            .safe(format_args!("msync({:p}, {}, {flags:?})", self.addr, self.len))
    }

    pub fn madvise(&self, advice: MmapAdvise) -> Result<()> {
        unsafe { mman::madvise(self.addr, self.len, advice) }
            .safe(format_args!("madvise({:p}, {}, {advice:?})", self.addr, self.len))
    }

    /// Unmaps `len` bytes at `offset` inside the mapping.
    ///
    /// # Safety
    /// Nothing may reference the unmapped range afterwards, and the rest
    /// of the mapping is still released as one range on drop.
    pub unsafe fn unmap_range(&self, offset: usize, len: usize) -> Result<()> {
        if offset.checked_add(len).map_or(true, |end| end > self.len) {
            return Err(Failure::broken(format!(
                "munmap range {offset}+{len} outside mapping of {}",
                self.len
            )));
        }
        let addr = NonNull::new_unchecked(self.as_ptr().add(offset).cast::<c_void>());
        mman::munmap(addr, len).safe(format_args!("munmap({addr:p}, {len})"))
    }

    /// Unmaps the whole mapping, reporting a failure instead of logging it.
    pub fn unmap(self) -> Result<()> {
        let (addr, len) = (self.addr, self.len);
        std::mem::forget(self);
        unsafe { mman::munmap(addr, len) }.safe(format_args!("munmap({addr:p}, {len})"))
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if let Err(e) = unsafe { mman::munmap(self.addr, self.len) } {
            warn!("munmap({:p}, {}) failed: {}", self.addr, self.len, e);
        }
    }
}

fn non_zero(len: usize) -> Result<NonZeroUsize> {
    NonZeroUsize::new(len).ok_or_else(|| Failure::broken("mmap of zero length"))
}

/// A value living in a `MAP_SHARED` anonymous mapping.
///
/// Writes made by a forked child are visible to the parent. `T` must be
/// address independent (atomics and plain integers), since the parent
/// and the child only share the bytes.
pub struct SharedPage<T> {
    mapping: Mapping,
    _marker: PhantomData<T>,
}

impl<T: Default + Sync> SharedPage<T> {
    pub fn new() -> Result<Self> {
        let len = std::mem::size_of::<T>().max(1);
        if std::mem::align_of::<T>() > page_size()? {
            return Err(Failure::broken("shared value alignment exceeds page size"));
        }
        let mapping = Mapping::map_anonymous(
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
        )?;
        unsafe { ptr::write(mapping.as_ptr().cast::<T>(), T::default()) };
        Ok(Self {
            mapping,
            _marker: PhantomData,
        })
    }
}

impl<T> Deref for SharedPage<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mapping.as_ptr().cast::<T>() }
    }
}

impl<T> Drop for SharedPage<T> {
    fn drop(&mut self) {
        unsafe { ptr::drop_in_place(self.mapping.as_ptr().cast::<T>()) };
    }
}
