//! Dual-output publisher: one I420 and one ARGB region, newest frame wins.
//!
//! Every region is guarded by its own lock. A writer stamps the region
//! and fills its pixels inside one critical section, so whoever takes the
//! lock next sees a timestamp and pixels from the same cycle. Subscribers
//! are told about a new frame only after the lock has been released.
//!
//! Readers in other processes cannot take that lock. They open the region
//! file with [`RegionReader`], which relies on the region's update counter
//! instead.

pub mod region;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use flume::{Receiver, Sender, TrySendError};
use tracing::info;

use crate::capture::{FrameDimensions, Timestamp};
use crate::{OutputConfig, Result};

pub use region::{RegionReader, SharedRegion};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Output {
    I420,
    Argb,
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Output::I420 => f.write_str("I420"),
            Output::Argb => f.write_str("ARGB"),
        }
    }
}

/// Copy of one output taken under its lock.
#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    /// `None` until the first write.
    pub timestamp: Option<Timestamp>,
    pub sequence: u64,
    pub pixels: Bytes,
}

/// Notification stream for one output.
///
/// Holds at most one pending notification; a reader that falls behind
/// skips straight to the newest frame.
pub struct Subscription {
    rx: Receiver<Timestamp>,
}

impl Subscription {
    /// Block until a frame newer than anything seen so far is announced.
    pub fn wait(&self, timeout: Duration) -> Option<Timestamp> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_next(&self) -> Option<Timestamp> {
        self.rx.try_recv().ok()
    }
}

/// One live output buffer with its lock and subscribers.
pub struct SharedFrame {
    region: Mutex<SharedRegion>,
    latest: AtomicU64,
    subscribers: Mutex<Vec<(Sender<Timestamp>, Receiver<Timestamp>)>>,
}

impl SharedFrame {
    fn new(region: SharedRegion) -> Self {
        Self {
            region: Mutex::new(region),
            latest: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    // A writer that panicked mid-frame must not wedge readers forever.
    fn lock(&self) -> MutexGuard<'_, SharedRegion> {
        self.region.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the exclusive write lock. Released when the handle drops.
    pub fn begin_write(&self) -> WriteGuard<'_> {
        WriteGuard {
            region: self.lock(),
            latest: &self.latest,
            stamped: None,
        }
    }

    /// Wake every subscriber. Call only after the write handle is gone.
    pub fn notify(&self) -> usize {
        let ts = match self.latest.load(Ordering::Acquire) {
            0 => return 0,
            ns => Timestamp::from_nanos(ns),
        };

        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // The kept receiver counts as one; nobody else left means the
        // subscription was dropped.
        subscribers.retain(|(tx, rx)| {
            if tx.receiver_count() <= 1 {
                return false;
            }
            // Replace a notification the reader has not picked up yet.
            let _ = rx.try_recv();
            !matches!(tx.try_send(ts), Err(TrySendError::Disconnected(_)))
        });
        subscribers.len()
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = flume::bounded(1);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((tx, rx.clone()));
        Subscription { rx }
    }

    /// Run `f` against the timestamp and pixels while holding the lock.
    pub fn with_locked<R>(&self, f: impl FnOnce(Option<Timestamp>, &[u8]) -> R) -> R {
        let region = self.lock();
        f(region.timestamp(), region.payload())
    }

    pub fn read(&self) -> FrameSnapshot {
        let region = self.lock();
        FrameSnapshot {
            timestamp: region.timestamp(),
            sequence: region.sequence(),
            pixels: Bytes::copy_from_slice(region.payload()),
        }
    }

    /// Wait for the next announcement on `subscription`, then read.
    pub fn wait_for_update(
        &self,
        subscription: &Subscription,
        timeout: Duration,
    ) -> Option<FrameSnapshot> {
        subscription.wait(timeout).map(|_| self.read())
    }

    pub fn timestamp(&self) -> Option<Timestamp> {
        self.lock().timestamp()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive write access to one output.
///
/// The timestamp must be set before the pixels are touched; both land in
/// the same critical section.
pub struct WriteGuard<'a> {
    region: MutexGuard<'a, SharedRegion>,
    latest: &'a AtomicU64,
    stamped: Option<Timestamp>,
}

impl WriteGuard<'_> {
    /// Opens the region's write section; outside readers discard what they
    /// copy until the guard drops.
    pub fn set_timestamp(&mut self, ts: Timestamp) {
        self.region.begin_update();
        self.region.set_timestamp(ts);
        self.stamped = Some(ts);
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        assert!(
            self.stamped.is_some(),
            "pixels written without a timestamp in the same critical section"
        );
        self.region.payload_mut()
    }

    /// Replace the whole payload with `pixels`.
    pub fn write(&mut self, pixels: &[u8]) {
        let dst = self.pixels_mut();
        assert_eq!(dst.len(), pixels.len(), "output buffer size mismatch");
        dst.copy_from_slice(pixels);
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        let Some(ts) = self.stamped else { return };
        if thread::panicking() {
            // Pixels may be half written. The section stays open so outside
            // readers keep rejecting them until the next complete write.
            self.region.clear_timestamp();
            return;
        }
        self.region.end_update();
        self.latest.store(ts.as_nanos(), Ordering::Release);
    }
}

/// Owns both outputs for the lifetime of a run.
pub struct Publisher {
    dims: FrameDimensions,
    i420: SharedFrame,
    argb: SharedFrame,
}

impl Publisher {
    /// Create both regions. Failing either one is fatal; there is no
    /// single-output mode.
    pub fn create(dims: FrameDimensions, config: &OutputConfig) -> Result<Self> {
        let i420 = SharedRegion::create(&config.dir, &config.name_i420, dims.i420_len())?;
        let argb = SharedRegion::create(&config.dir, &config.name_argb, dims.argb_len())?;

        info!(
            "Frames available in I420 format in '{}' ({}) and in ARGB format in '{}' ({})",
            i420.path().display(),
            i420.len(),
            argb.path().display(),
            argb.len()
        );

        Ok(Self {
            dims,
            i420: SharedFrame::new(i420),
            argb: SharedFrame::new(argb),
        })
    }

    pub fn dimensions(&self) -> FrameDimensions {
        self.dims
    }

    pub fn frame(&self, output: Output) -> &SharedFrame {
        match output {
            Output::I420 => &self.i420,
            Output::Argb => &self.argb,
        }
    }

    pub fn begin_write(&self, output: Output) -> WriteGuard<'_> {
        self.frame(output).begin_write()
    }

    pub fn notify(&self, output: Output) -> usize {
        self.frame(output).notify()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn config(dir: &Path) -> OutputConfig {
        OutputConfig {
            dir: dir.to_path_buf(),
            ..OutputConfig::default()
        }
    }

    fn publisher(dir: &Path) -> Publisher {
        Publisher::create(FrameDimensions::new(4, 2).unwrap(), &config(dir)).unwrap()
    }

    #[test]
    fn outputs_are_sized_from_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = publisher(dir.path());
        assert_eq!(publisher.frame(Output::I420).len(), 12);
        assert_eq!(publisher.frame(Output::Argb).len(), 32);
        assert!(dir.path().join("iris.i420").exists());
        assert!(dir.path().join("iris.argb").exists());
    }

    #[test]
    fn write_is_stamped_and_sequenced() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = publisher(dir.path());
        let ts = Timestamp::now();
        {
            let mut guard = publisher.begin_write(Output::I420);
            guard.set_timestamp(ts);
            guard.write(&[7u8; 12]);
        }
        let snap = publisher.frame(Output::I420).read();
        assert_eq!(snap.timestamp, Some(ts));
        assert_eq!(snap.sequence, 1);
        assert_eq!(&snap.pixels[..], &[7u8; 12]);
        assert_eq!(publisher.frame(Output::Argb).timestamp(), None);
    }

    #[test]
    #[should_panic(expected = "without a timestamp")]
    fn pixels_need_a_timestamp_first() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = publisher(dir.path());
        let mut guard = publisher.begin_write(Output::Argb);
        guard.pixels_mut()[0] = 1;
    }

    #[test]
    fn lock_is_released_after_a_panicking_writer() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = Arc::new(publisher(dir.path()));

        let writer = Arc::clone(&publisher);
        let result = thread::spawn(move || {
            let mut guard = writer.begin_write(Output::I420);
            guard.set_timestamp(Timestamp::now());
            panic!("converter blew up");
        })
        .join();
        assert!(result.is_err());

        // half-written pixels are neither stamped nor announced
        let frame = publisher.frame(Output::I420);
        assert_eq!(frame.read().timestamp, None);
        assert_eq!(frame.read().sequence, 0);
        assert_eq!(publisher.notify(Output::I420), 0);
        let outside = RegionReader::open(&dir.path().join("iris.i420")).unwrap();
        assert!(outside.try_read().is_none());

        // still writable, and the next complete write is readable everywhere
        let ts = Timestamp::now();
        {
            let mut guard = publisher.begin_write(Output::I420);
            guard.set_timestamp(ts);
            guard.write(&[5u8; 12]);
        }
        assert_eq!(frame.read().sequence, 1);
        let snap = outside.try_read().unwrap();
        assert_eq!(snap.timestamp, Some(ts));
        assert_eq!(&snap.pixels[..], &[5u8; 12]);
    }

    #[test]
    fn outside_reader_never_sees_a_write_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = publisher(dir.path());
        let outside = RegionReader::open(&dir.path().join("iris.i420")).unwrap();

        let old = Timestamp::now();
        {
            let mut guard = publisher.begin_write(Output::I420);
            guard.set_timestamp(old);
            guard.write(&[1u8; 12]);
        }

        let new = Timestamp::now();
        let mut guard = publisher.begin_write(Output::I420);
        guard.set_timestamp(new);
        guard.pixels_mut()[..6].fill(2);

        // mid-write: the old frame is gone, the new one is not complete
        assert!(outside.try_read().is_none());
        assert!(outside.read(Duration::from_millis(5)).is_none());

        guard.pixels_mut()[6..].fill(2);
        drop(guard);

        let snap = outside.read(Duration::from_millis(5)).unwrap();
        assert_eq!(snap.timestamp, Some(new));
        assert_eq!(&snap.pixels[..], &[2u8; 12]);
        assert_eq!(snap.sequence, 2);
    }

    #[test]
    fn subscribers_hear_about_new_frames() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = publisher(dir.path());
        let sub = publisher.frame(Output::Argb).subscribe();

        // nothing written yet, nothing to announce
        assert_eq!(publisher.notify(Output::Argb), 0);
        assert_eq!(sub.try_next(), None);

        let first = Timestamp::now();
        let second = Timestamp::now();
        for ts in [first, second] {
            let mut guard = publisher.begin_write(Output::Argb);
            guard.set_timestamp(ts);
            guard.write(&[1u8; 32]);
            drop(guard);
            assert_eq!(publisher.notify(Output::Argb), 1);
        }

        // newest-wins: only the latest pending notification is kept
        assert_eq!(sub.try_next(), Some(second));
        assert_eq!(sub.try_next(), None);
        let snap = publisher
            .frame(Output::Argb)
            .wait_for_update(&sub, Duration::from_millis(1));
        assert!(snap.is_none());
        assert_eq!(publisher.frame(Output::Argb).timestamp(), Some(second));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = publisher(dir.path());
        let kept = publisher.frame(Output::I420).subscribe();
        drop(publisher.frame(Output::I420).subscribe());

        let mut guard = publisher.begin_write(Output::I420);
        guard.set_timestamp(Timestamp::now());
        drop(guard);
        assert_eq!(publisher.notify(Output::I420), 1);
        assert!(kept.try_next().is_some());
    }

    #[test]
    fn creation_fails_without_output_directory() {
        let dir = tempfile::tempdir().unwrap();
        let bad = config(&dir.path().join("missing"));
        assert!(Publisher::create(FrameDimensions::new(2, 2).unwrap(), &bad).is_err());
    }
}
