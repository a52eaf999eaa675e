//! Device Pool (§4.1): pre-warmed holders of slow-to-open MIDI devices,
//! with non-blocking acquisition and background refill.
//!
//! Grounded in the `MidiInterfaceService`/`AudioStreamService` pattern in
//! `groove-midi`/`groove-audio`: a background worker owns the slow resource
//! and a `crossbeam_channel` moves finished instances to whoever is waiting,
//! generalized here into a reusable bounded pool instead of a single
//! long-lived service.

use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::error::PlaybackError;

/// Target number of warm instances a pool tries to keep on hand.
pub const TARGET_POOL_SIZE: usize = 4;

type OpenFn<T> = Arc<dyn Fn() -> Result<T, PlaybackError> + Send + Sync>;

/// A bounded pool of pre-opened devices of type `T`, topped up in the
/// background. `open` is the (slow) factory used both for initial fill and
/// for replacing devices that are acquired and not returned.
pub struct DevicePool<T: Send + 'static> {
    open: OpenFn<T>,
    sender: Sender<T>,
    receiver: Receiver<T>,
    default: Mutex<Option<Arc<T>>>,
}

impl<T: Send + 'static> DevicePool<T> {
    pub fn new<F>(open: F) -> Self
    where
        F: Fn() -> Result<T, PlaybackError> + Send + Sync + 'static,
    {
        let (sender, receiver) = bounded(TARGET_POOL_SIZE);
        let pool = Self {
            open: Arc::new(open),
            sender,
            receiver,
            default: Mutex::new(None),
        };
        pool.top_up();
        pool
    }

    /// Install a process-wide default instance. Once set, [`Self::acquire`]
    /// always returns it without touching the queue (§4.1, §5: "read-only
    /// for the remainder of the process").
    pub fn set_default(&self, device: T) {
        *self.default.lock().unwrap() = Some(Arc::new(device));
    }

    /// Acquire a device: the process-wide default if one is installed,
    /// otherwise the head of the queue (topping up and trimming first),
    /// blocking if the queue is empty until a background fill completes.
    pub fn acquire(&self) -> Result<Arc<T>, PlaybackError>
    where
        T: 'static,
    {
        if let Some(default) = self.default.lock().unwrap().clone() {
            return Ok(default);
        }

        self.top_up();
        self.trim_excess();

        // `recv` blocks until a background worker pushes an instance.
        self.receiver
            .recv()
            .map(Arc::new)
            .map_err(|_| PlaybackError::DeviceUnavailable("device pool closed".to_string()))
    }

    /// Spawn background workers to bring the queue up to
    /// [`TARGET_POOL_SIZE`]. Individual open failures are logged and do not
    /// block devices that already succeeded (§4.1 failure model).
    fn top_up(&self) {
        let deficit = TARGET_POOL_SIZE.saturating_sub(self.receiver.len());
        for _ in 0..deficit {
            let open = Arc::clone(&self.open);
            let sender = self.sender.clone();
            thread::spawn(move || match open() {
                Ok(device) => {
                    let _ = sender.try_send(device);
                }
                Err(err) => {
                    log::warn!("device pool refill failed: {err}");
                }
            });
        }
    }

    /// Drop any instances over [`TARGET_POOL_SIZE`] that a refill race
    /// might have produced.
    fn trim_excess(&self) {
        while self.receiver.len() > TARGET_POOL_SIZE {
            let _ = self.receiver.try_recv();
        }
    }
}
