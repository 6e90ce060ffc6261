use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use rslam_core::Id;

enum Msg {
    Keyframe(Id),
    Reset,
    Shutdown,
}

/// Bounded FIFO handoff to the (external) bundle-adjustment estimator
/// (`spec.md` §4.5). The Mapper is the only producer; this worker drains
/// the queue on its own thread and simply tracks which keyframes are
/// pending, since the estimator itself is out of scope for this crate.
pub struct Estimator {
    sender: Sender<Msg>,
    handle: Option<JoinHandle<()>>,
    new_kf_available: Arc<AtomicBool>,
}

const QUEUE_CAPACITY: usize = 64;

impl Estimator {
    pub fn start() -> Self {
        let (sender, receiver): (Sender<Msg>, Receiver<Msg>) = crossbeam_channel::bounded(QUEUE_CAPACITY);
        let new_kf_available = Arc::new(AtomicBool::new(false));
        let flag = new_kf_available.clone();

        let handle = std::thread::spawn(move || Self::run(receiver, flag));

        Self { sender, handle: Some(handle), new_kf_available }
    }

    fn run(receiver: Receiver<Msg>, new_kf_available: Arc<AtomicBool>) {
        loop {
            match receiver.recv_timeout(Duration::from_millis(20)) {
                Ok(Msg::Keyframe(kfid)) => {
                    log::debug!("estimator received keyframe {kfid}");
                    new_kf_available.store(true, Ordering::Release);
                }
                Ok(Msg::Reset) => {
                    while receiver.try_recv().is_ok() {}
                    new_kf_available.store(false, Ordering::Release);
                }
                Ok(Msg::Shutdown) => break,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    pub fn enqueue_keyframe(&self, kfid: Id) -> Result<()> {
        self.sender
            .send(Msg::Keyframe(kfid))
            .map_err(|_| anyhow!("estimator queue closed"))
    }

    pub fn new_kf_available(&self) -> bool {
        self.new_kf_available.load(Ordering::Acquire)
    }

    /// A shared handle on the `new_kf_available` flag, so a caller that only
    /// holds the `Mapper` (which owns this `Estimator` once spawned) can
    /// still poll it from another thread.
    pub fn new_kf_flag(&self) -> Arc<AtomicBool> {
        self.new_kf_available.clone()
    }

    pub fn clear_new_kf_flag(&self) {
        self.new_kf_available.store(false, Ordering::Release);
    }

    /// Empties the handoff queue and clears `new_kf_available` (`spec.md`
    /// §4.5).
    pub fn reset(&self) -> Result<()> {
        self.sender.send(Msg::Reset).map_err(|_| anyhow!("estimator queue closed"))
    }

    /// Forwards shutdown down the same FIFO the Mapper uses to hand off
    /// keyframes, then joins the worker thread.
    pub fn shutdown_and_join(&mut self) {
        let _ = self.sender.send(Msg::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Estimator {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown_and_join();
        }
    }
}
