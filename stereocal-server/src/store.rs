//! Shared accumulation state: per-side frame counts and the reception gate.
//!
//! Both long-lived tasks (the intake session loop and the completion
//! listener) mutate this state, so every check-act-transition sequence here
//! runs under one mutex. Gate transitions are additionally published on a
//! watch channel so other tasks can wait for them without polling the lock.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use stereocal_types::{frame_relative_path, CameraSide};

/// Whether frame intake is currently open. Closed exactly while a
/// calibration run is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Gate {
    Open,
    Closed,
}

/// Result of offering one complete frame to the store.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RecordOutcome {
    /// Persisted as the `index`-th (1-based) frame of its side. When
    /// `quota_reached` is set, this frame completed the quota on the last
    /// remaining side and the gate has been closed; the caller must launch
    /// the calibration job.
    Stored { index: usize, quota_reached: bool },
    /// Dropped: the gate is closed, or the side is already at target.
    Rejected,
}

struct Counts {
    counts: [usize; 2],
    gate: Gate,
}

fn idx(side: CameraSide) -> usize {
    match side {
        CameraSide::Left => 0,
        CameraSide::Right => 1,
    }
}

pub(crate) struct Shared {
    inner: Mutex<Counts>,
    target: usize,
    base_dir: PathBuf,
    gate_tx: watch::Sender<Gate>,
    /// Status-message sender of the currently attached client session, if
    /// any. The completion path posts here instead of touching the socket.
    session_tx: Mutex<Option<mpsc::Sender<&'static str>>>,
}

impl Shared {
    pub(crate) fn new(target: usize, base_dir: PathBuf) -> Arc<Self> {
        let (gate_tx, _) = watch::channel(Gate::Open);
        Arc::new(Shared {
            inner: Mutex::new(Counts {
                counts: [0, 0],
                gate: Gate::Open,
            }),
            target,
            base_dir,
            gate_tx,
            session_tx: Mutex::new(None),
        })
    }

    /// Offer one complete frame. On acceptance the payload is persisted
    /// under the side-keyed layout and the side's count incremented; if
    /// both sides thereby reach the target, the gate closes within the same
    /// critical section as the count commit, so no further frame can slip
    /// in before the calibration run starts.
    pub(crate) fn record_frame(
        &self,
        side: CameraSide,
        payload: &[u8],
    ) -> std::io::Result<RecordOutcome> {
        // reserve the next index under the lock
        let index = {
            let inner = self.inner.lock().unwrap();
            if inner.gate == Gate::Closed {
                debug!("gate closed, rejecting {side} frame");
                return Ok(RecordOutcome::Rejected);
            }
            if inner.counts[idx(side)] >= self.target {
                warn!("{side} already at target frame count, rejecting frame");
                return Ok(RecordOutcome::Rejected);
            }
            inner.counts[idx(side)] + 1
        };

        // The write happens with the lock released so a slow disk cannot
        // stall the completion path. Only this task records frames, so the
        // reserved index stays valid. A failed write leaves the count
        // untouched.
        let path = self.base_dir.join(frame_relative_path(side, index));
        std::fs::write(&path, payload)?;

        // commit the count; quota check and gate close are one atomic step
        let mut inner = self.inner.lock().unwrap();
        if inner.gate == Gate::Closed || inner.counts[idx(side)] + 1 != index {
            drop(inner);
            let _ = std::fs::remove_file(&path);
            debug!("store changed during {side} frame write, frame discarded");
            return Ok(RecordOutcome::Rejected);
        }
        inner.counts[idx(side)] = index;
        info!("{side} image {index} saved");

        let quota_reached = inner.counts.iter().all(|&c| c >= self.target);
        if quota_reached {
            inner.gate = Gate::Closed;
            self.gate_tx.send_replace(Gate::Closed);
            info!("required frame count reached on both sides, intake closed");
        }
        Ok(RecordOutcome::Stored {
            index,
            quota_reached,
        })
    }

    /// End the current calibration run: reset both counts and reopen the
    /// gate. Returns false (and changes nothing) if intake was already
    /// open, so a late or duplicate completion signal cannot disturb a new
    /// cycle.
    pub(crate) fn complete_run(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.gate == Gate::Open {
            return false;
        }
        inner.counts = [0, 0];
        inner.gate = Gate::Open;
        self.gate_tx.send_replace(Gate::Open);
        info!("frame counts reset, intake reopened");
        true
    }

    pub(crate) fn is_open(&self) -> bool {
        self.inner.lock().unwrap().gate == Gate::Open
    }

    pub(crate) fn subscribe_gate(&self) -> watch::Receiver<Gate> {
        self.gate_tx.subscribe()
    }

    pub(crate) fn attach_session(&self, tx: mpsc::Sender<&'static str>) {
        *self.session_tx.lock().unwrap() = Some(tx);
    }

    pub(crate) fn detach_session(&self) {
        *self.session_tx.lock().unwrap() = None;
    }

    /// Best-effort status message to the attached client session. A missing
    /// session or a full/gone channel is logged and otherwise ignored.
    pub(crate) fn notify_session(&self, msg: &'static str) {
        let guard = self.session_tx.lock().unwrap();
        match &*guard {
            Some(tx) => {
                if let Err(e) = tx.try_send(msg) {
                    warn!("could not deliver {msg:?} to client: {e}");
                }
            }
            None => debug!("no client session attached, {msg:?} not sent"),
        }
    }
}
