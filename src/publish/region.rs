//! Named memory-mapped region holding one output frame.
//!
//! Layout (header words are native-endian `u64`s):
//!
//! ```text
//! 0..8    magic "IRISSHM1"
//! 8..16   timestamp, ns since the UNIX epoch (0 = never written)
//! 16..24  update counter: odd while a write is in progress,
//!         twice the number of completed writes otherwise
//! 24..32  payload length
//! 32..    payload
//! ```
//!
//! The update counter makes the header a sequence lock. The owner bumps it
//! to odd before it stamps the timestamp or touches a pixel and back to even
//! once both are in place. A reader in any process copies timestamp and
//! payload between two loads of the counter and keeps the copy only when
//! both loads are equal and even.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use memmap2::{Mmap, MmapMut};
use tracing::{debug, warn};

use crate::capture::Timestamp;
use crate::publish::FrameSnapshot;
use crate::{Error, Result};

pub const HEADER_LEN: usize = 32;
pub const MAGIC: &[u8; 8] = b"IRISSHM1";

const TIMESTAMP_AT: usize = 8;
const COUNTER_AT: usize = 16;
const LENGTH_AT: usize = 24;

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Header word at `at`. The mapping is page aligned and every header
/// offset is a multiple of 8.
///
/// # Safety
///
/// `base` must point at a live mapping of at least `HEADER_LEN` bytes.
unsafe fn word<'a>(base: *const u8, at: usize) -> &'a AtomicU64 {
    &*(base.add(at) as *const AtomicU64)
}

fn stamp(ns: u64) -> Option<Timestamp> {
    (ns != 0).then(|| Timestamp::from_nanos(ns))
}

/// One optimistic read: `None` when a write was in progress or finished
/// while copying.
///
/// # Safety
///
/// `base` must point at a live mapping of at least `HEADER_LEN + len` bytes.
unsafe fn read_stable(base: *const u8, len: usize) -> Option<FrameSnapshot> {
    let counter = word(base, COUNTER_AT);
    let before = counter.load(Ordering::Acquire);
    if before & 1 == 1 {
        return None;
    }

    let ns = word(base, TIMESTAMP_AT).load(Ordering::Relaxed);
    let mut pixels = vec![0u8; len];
    // May race with the owner; the counter check below discards such copies.
    ptr::copy_nonoverlapping(base.add(HEADER_LEN), pixels.as_mut_ptr(), len);

    fence(Ordering::Acquire);
    if counter.load(Ordering::Relaxed) != before {
        return None;
    }
    Some(FrameSnapshot {
        timestamp: stamp(ns),
        sequence: before / 2,
        pixels: Bytes::from(pixels),
    })
}

fn map_err(path: &Path) -> impl Fn(io::Error) -> Error + '_ {
    move |source| Error::SharedRegion {
        path: path.to_path_buf(),
        source,
    }
}

fn invalid(reason: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason.to_string())
}

/// The writable side of a region, owned by the publisher.
///
/// Removes its file when dropped.
pub struct SharedRegion {
    path: PathBuf,
    map: MmapMut,
    len: usize,
}

impl SharedRegion {
    /// Create (or replace) `dir/name` sized for `len` payload bytes, zeroed.
    pub fn create(dir: &Path, name: &str, len: usize) -> Result<Self> {
        let path = dir.join(name);
        let region_err = map_err(&path);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(&region_err)?;
        file.set_len((HEADER_LEN + len) as u64)
            .map_err(&region_err)?;

        // SAFETY: the file was just truncated and sized by us; other
        // processes only map it read-only.
        let mut map = unsafe { MmapMut::map_mut(&file) }.map_err(&region_err)?;
        map[..MAGIC.len()].copy_from_slice(MAGIC);

        let region = Self {
            path: path.clone(),
            map,
            len,
        };
        region.word(LENGTH_AT).store(len as u64, Ordering::Release);
        debug!("Created shared region {} ({} bytes)", path.display(), len);
        Ok(region)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn word(&self, at: usize) -> &AtomicU64 {
        // SAFETY: the mapping outlives `self` and holds a full header.
        unsafe { word(self.map.as_ptr(), at) }
    }

    pub fn timestamp(&self) -> Option<Timestamp> {
        stamp(self.word(TIMESTAMP_AT).load(Ordering::Relaxed))
    }

    /// Completed writes so far.
    pub fn sequence(&self) -> u64 {
        self.word(COUNTER_AT).load(Ordering::Relaxed) / 2
    }

    pub fn is_updating(&self) -> bool {
        self.word(COUNTER_AT).load(Ordering::Relaxed) & 1 == 1
    }

    /// Open a write section. Outside readers reject whatever they copy
    /// until [`end_update`](Self::end_update).
    pub fn begin_update(&mut self) {
        let counter = self.word(COUNTER_AT);
        let current = counter.load(Ordering::Relaxed);
        if current & 1 == 0 {
            counter.store(current + 1, Ordering::Relaxed);
            fence(Ordering::Release);
        }
    }

    pub fn end_update(&mut self) {
        let counter = self.word(COUNTER_AT);
        let current = counter.load(Ordering::Relaxed);
        if current & 1 == 1 {
            counter.store(current + 1, Ordering::Release);
        }
    }

    pub fn set_timestamp(&mut self, ts: Timestamp) {
        debug_assert!(self.is_updating(), "timestamp set outside a write section");
        self.word(TIMESTAMP_AT).store(ts.as_nanos(), Ordering::Relaxed);
    }

    /// Mark the contents as not belonging to any frame.
    pub fn clear_timestamp(&mut self) {
        self.word(TIMESTAMP_AT).store(0, Ordering::Relaxed);
    }

    pub fn payload(&self) -> &[u8] {
        &self.map[HEADER_LEN..HEADER_LEN + self.len]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        debug_assert!(self.is_updating(), "pixels written outside a write section");
        &mut self.map[HEADER_LEN..HEADER_LEN + self.len]
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to remove shared region {}: {}", self.path.display(), e);
        }
    }
}

/// Read-only view of a region published by another process.
pub struct RegionReader {
    path: PathBuf,
    map: Mmap,
    len: usize,
}

impl RegionReader {
    pub fn open(path: &Path) -> Result<Self> {
        let region_err = map_err(path);
        let file = File::open(path).map_err(&region_err)?;

        // SAFETY: the mapping is read-only; header words are read atomically
        // and payload copies are validated against the update counter.
        let map = unsafe { Mmap::map(&file) }.map_err(&region_err)?;
        if map.len() < HEADER_LEN || &map[..MAGIC.len()] != MAGIC {
            return Err(region_err(invalid("not an output region")));
        }

        // SAFETY: the mapping holds at least a full header.
        let len = unsafe { word(map.as_ptr(), LENGTH_AT) }.load(Ordering::Acquire) as usize;
        if HEADER_LEN + len > map.len() {
            return Err(region_err(invalid("payload length exceeds region")));
        }

        Ok(Self {
            path: path.to_path_buf(),
            map,
            len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Single attempt; `None` if the owner was writing at the time.
    pub fn try_read(&self) -> Option<FrameSnapshot> {
        // SAFETY: `open` checked the mapping covers header and payload.
        unsafe { read_stable(self.map.as_ptr(), self.len) }
    }

    /// Retry until a consistent copy is taken or `timeout` passes.
    pub fn read(&self, timeout: Duration) -> Option<FrameSnapshot> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(snapshot) = self.try_read() {
                return Some(snapshot);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::yield_now();
        }
    }

    /// Poll until a write newer than `seen` completes.
    pub fn wait_for_update(&self, seen: u64, timeout: Duration) -> Option<FrameSnapshot> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(snapshot) = self.try_read().filter(|s| s.sequence > seen) {
                return Some(snapshot);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}
