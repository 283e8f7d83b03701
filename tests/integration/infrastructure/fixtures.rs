use anyhow::{Context, Result};
use nix::sys::mman::{MapFlags, ProtFlags};
use nix::time::{clock_gettime, ClockId};
use std::fs::File;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use sysprobe::safe_call::{page_size, Mapping};
use tempfile::TempDir;

/// Monotonic clock in nanoseconds, usable from a forked child
pub fn monotonic_ns() -> u64 {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64,
        Err(_) => 0,
    }
}

/// Timestamps shared between a test and its forked child
#[derive(Debug, Default)]
pub struct Timeline {
    /// Child is about to block
    pub entered: AtomicU64,
    /// Parent is about to send the signal
    pub sent: AtomicU64,
    /// Child returned from the blocking call
    pub woke: AtomicU64,
}

impl Timeline {
    pub fn stamp(slot: &AtomicU64) {
        slot.store(monotonic_ns(), Ordering::SeqCst);
    }

    pub fn get(slot: &AtomicU64) -> u64 {
        slot.load(Ordering::SeqCst)
    }
}

/// A short file mapped shared over `pages` pages
pub struct MappedFile {
    pub file_len: usize,
    pub page_size: usize,
    pub mapping: Mapping,
    _file: File,
    _dir: TempDir,
}

impl MappedFile {
    /// Writes `contents` to a fresh file and maps it
    pub fn new(contents: &[u8], pages: usize) -> Result<Self> {
        let dir = TempDir::new().context("Failed to create temporary directory")?;
        let mut file = File::options()
            .read(true)
            .write(true)
            .create_new(true)
            .open(dir.path().join("mapped"))?;
        file.write_all(contents)?;

        let page_size = page_size()?;
        let mapping = Mapping::map_file(
            pages * page_size,
            ProtFlags::PROT_READ,
            MapFlags::MAP_SHARED,
            &file,
            0,
        )?;

        Ok(Self {
            file_len: contents.len(),
            page_size,
            mapping,
            _file: file,
            _dir: dir,
        })
    }

    /// Reads the byte at `offset` through a volatile load
    ///
    /// # Safety
    /// `offset` may point past the accessible range only inside a probe.
    pub unsafe fn read_at(&self, offset: usize) -> u8 {
        self.mapping.as_ptr().add(offset).read_volatile()
    }
}
