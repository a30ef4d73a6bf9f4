//! Newest-wins rendezvous between a device capture thread and one consumer

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crossbeam::utils::CachePadded;
use flume::{Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{instrument, trace};

use crate::capture::frame::{FrameBundle, FrameKind, FrameTypes, Lease, RawFrame};
use crate::error::{Error, Result};

/// Consumer side of the frame mailbox.
///
/// Completed bundles go through a channel of capacity one; a newer bundle
/// evicts an undelivered older one. Only the freshest frame pair is ever
/// waiting, so a slow consumer sees bounded staleness instead of a backlog.
pub struct FrameListener {
    subscribed: FrameTypes,
    shared: Arc<Shared>,
    rx: Receiver<FrameBundle>,
    outstanding: Arc<AtomicBool>,
}

/// Producer handle given to a device; cheap to clone per capture thread
#[derive(Clone)]
pub struct FrameSink {
    subscribed: FrameTypes,
    shared: Arc<Shared>,
}

struct Shared {
    tx: Sender<FrameBundle>,
    // Producers drain the stale bundle through this end.
    rx: Receiver<FrameBundle>,
    assembly: Mutex<Assembly>,
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Assembly {
    depth: Option<RawFrame>,
    color: Option<RawFrame>,
}

impl Assembly {
    fn slot(&mut self, kind: FrameKind) -> &mut Option<RawFrame> {
        match kind {
            FrameKind::Depth => &mut self.depth,
            FrameKind::Color => &mut self.color,
        }
    }

    fn is_complete(&self, subscribed: FrameTypes) -> bool {
        (!subscribed.contains(FrameKind::Depth) || self.depth.is_some())
            && (!subscribed.contains(FrameKind::Color) || self.color.is_some())
    }
}

#[derive(Default)]
struct Stats {
    frames_received: AtomicU64,
    bundles_delivered: AtomicU64,
    frames_dropped: AtomicU64,
    bundles_released: AtomicU64,
}

/// Snapshot of listener counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub frames_received: u64,
    pub bundles_delivered: u64,
    pub frames_dropped: u64,
    pub bundles_released: u64,
}

impl FrameListener {
    pub fn new(subscribed: FrameTypes) -> Self {
        let (tx, rx) = flume::bounded(1);
        let shared = Arc::new(Shared {
            tx,
            rx: rx.clone(),
            assembly: Mutex::new(Assembly::default()),
            stats: CachePadded::new(Stats::default()),
        });

        Self {
            subscribed,
            shared,
            rx,
            outstanding: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribed(&self) -> FrameTypes {
        self.subscribed
    }

    /// Producer handle for a device's capture thread
    pub fn sink(&self) -> FrameSink {
        FrameSink {
            subscribed: self.subscribed,
            shared: self.shared.clone(),
        }
    }

    /// True when a complete bundle is waiting
    pub fn has_new_frame(&self) -> bool {
        !self.rx.is_empty()
    }

    /// Block until a complete bundle is available or `timeout` elapses.
    ///
    /// Fails with `FrameOutstanding` while the previous bundle is still held.
    #[instrument(level = "trace", skip(self))]
    pub fn wait_for_frame(&self, timeout: Duration) -> Result<FrameBundle> {
        let lease = Lease::take(&self.outstanding).ok_or(Error::FrameOutstanding)?;

        match self.rx.recv_timeout(timeout) {
            Ok(mut bundle) => {
                bundle.lease = Some(lease);
                Ok(bundle)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                Err(Error::FrameTimeout(timeout))
            }
        }
    }

    /// Hand the bundle's buffers back to the device pool
    pub fn release(&self, bundle: FrameBundle) {
        trace!(timestamp = ?bundle.timestamp(), "Releasing frame bundle");
        drop(bundle);
        self.shared
            .stats
            .bundles_released
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> ListenerStats {
        let s = &self.shared.stats;
        ListenerStats {
            frames_received: s.frames_received.load(Ordering::Relaxed),
            bundles_delivered: s.bundles_delivered.load(Ordering::Relaxed),
            frames_dropped: s.frames_dropped.load(Ordering::Relaxed),
            bundles_released: s.bundles_released.load(Ordering::Relaxed),
        }
    }
}

impl FrameSink {
    pub fn subscribed(&self) -> FrameTypes {
        self.subscribed
    }

    /// Push one frame from the capture thread.
    ///
    /// Returns false when the listener is not subscribed to the frame's
    /// kind; the frame then goes straight back to its pool.
    pub fn deliver(&self, frame: RawFrame) -> bool {
        if !self.subscribed.contains(frame.kind) {
            return false;
        }

        let stats = &self.shared.stats;
        stats.frames_received.fetch_add(1, Ordering::Relaxed);

        let mut assembly = self
            .shared
            .assembly
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if assembly.slot(frame.kind).replace(frame).is_some() {
            self.count_dropped(1);
        }

        if assembly.is_complete(self.subscribed) {
            let bundle = FrameBundle::new(assembly.depth.take(), assembly.color.take());
            // Sent under the assembly lock so producers cannot reorder bundles.
            self.push_newest(bundle);
        }

        true
    }

    fn push_newest(&self, mut bundle: FrameBundle) {
        loop {
            match self.shared.tx.try_send(bundle) {
                Ok(()) => {
                    self.shared
                        .stats
                        .bundles_delivered
                        .fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(TrySendError::Full(back)) => {
                    bundle = back;
                    if let Ok(stale) = self.shared.rx.try_recv() {
                        let n = stale.depth.is_some() as u64 + stale.color.is_some() as u64;
                        trace!(timestamp = ?stale.timestamp(), "Dropping stale frame bundle");
                        self.count_dropped(n);
                    }
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    fn count_dropped(&self, n: u64) {
        self.shared
            .stats
            .frames_dropped
            .fetch_add(n, Ordering::Relaxed);
        metrics::counter!("depthcast_frames_dropped_total").increment(n);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::capture::frame::StreamFormat;
    use crate::capture::pool::{FramePool, PooledBuffer};

    fn frame(kind: FrameKind, timestamp: u64) -> RawFrame {
        RawFrame::new(
            kind,
            StreamFormat::new(2, 1, 1),
            timestamp,
            timestamp,
            PooledBuffer::detached(vec![timestamp as u8; 2]),
        )
    }

    #[test]
    fn waits_for_every_subscribed_kind() {
        let listener = FrameListener::new(FrameTypes::DEPTH | FrameTypes::COLOR);
        let sink = listener.sink();

        sink.deliver(frame(FrameKind::Depth, 1));
        assert!(!listener.has_new_frame());

        sink.deliver(frame(FrameKind::Color, 1));
        let bundle = listener.wait_for_frame(Duration::from_millis(10)).unwrap();
        assert_eq!(bundle.depth().unwrap().timestamp, 1);
        assert_eq!(bundle.color().unwrap().timestamp, 1);
        listener.release(bundle);
    }

    #[test]
    fn newest_bundle_wins() {
        let listener = FrameListener::new(FrameTypes::DEPTH);
        let sink = listener.sink();

        for ts in 1..=3 {
            sink.deliver(frame(FrameKind::Depth, ts));
        }

        let bundle = listener.wait_for_frame(Duration::from_millis(10)).unwrap();
        assert_eq!(bundle.depth().unwrap().timestamp, 3);
        listener.release(bundle);

        let stats = listener.stats();
        assert_eq!(stats.frames_received, 3);
        assert_eq!(stats.frames_dropped, 2);
        assert_eq!(stats.bundles_released, 1);
    }

    #[test]
    fn unsubscribed_frames_are_rejected() {
        let listener = FrameListener::new(FrameTypes::DEPTH);
        assert!(!listener.sink().deliver(frame(FrameKind::Color, 1)));
        assert!(!listener.has_new_frame());
    }

    #[test]
    fn empty_mailbox_times_out() {
        let listener = FrameListener::new(FrameTypes::DEPTH);
        let timeout = Duration::from_millis(80);

        let start = Instant::now();
        let err = listener.wait_for_frame(timeout).unwrap_err();
        assert!(matches!(err, Error::FrameTimeout(t) if t == timeout));
        assert!(start.elapsed() >= timeout);

        // A timed-out wait does not leave a lease behind.
        listener.sink().deliver(frame(FrameKind::Depth, 5));
        assert!(listener.wait_for_frame(timeout).is_ok());
    }

    #[test]
    fn second_wait_before_release_is_refused() {
        let listener = FrameListener::new(FrameTypes::DEPTH);
        let sink = listener.sink();
        sink.deliver(frame(FrameKind::Depth, 1));

        let held = listener.wait_for_frame(Duration::from_millis(10)).unwrap();
        sink.deliver(frame(FrameKind::Depth, 2));
        assert!(matches!(
            listener.wait_for_frame(Duration::from_millis(10)),
            Err(Error::FrameOutstanding)
        ));

        listener.release(held);
        let next = listener.wait_for_frame(Duration::from_millis(10)).unwrap();
        assert_eq!(next.depth().unwrap().timestamp, 2);
    }

    #[test]
    fn release_returns_buffers_to_pool() {
        let pool = FramePool::new(1, 4);
        let listener = FrameListener::new(FrameTypes::DEPTH);

        let mut buf = pool.acquire();
        buf.fill_from(&[1, 2, 3, 4]);
        listener.sink().deliver(RawFrame::new(
            FrameKind::Depth,
            StreamFormat::new(4, 1, 1),
            0,
            0,
            buf,
        ));
        assert_eq!(pool.available(), 0);

        let bundle = listener.wait_for_frame(Duration::from_millis(10)).unwrap();
        listener.release(bundle);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn delivery_across_threads_keeps_capture_order() {
        let listener = FrameListener::new(FrameTypes::DEPTH);
        let sink = listener.sink();

        let producer = std::thread::spawn(move || {
            for ts in 0..200u64 {
                sink.deliver(frame(FrameKind::Depth, ts));
                std::thread::sleep(Duration::from_micros(200));
            }
        });

        let mut last = None;
        while let Ok(bundle) = listener.wait_for_frame(Duration::from_millis(200)) {
            let ts = bundle.depth().unwrap().timestamp;
            if let Some(prev) = last {
                assert!(ts > prev);
            }
            last = Some(ts);
            listener.release(bundle);
        }
        producer.join().unwrap();
        assert_eq!(last, Some(199));
    }
}
