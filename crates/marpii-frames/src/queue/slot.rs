use parking_lot::Mutex;

use crate::promise::Callback;

#[derive(Default)]
struct SlotState {
    owner: Option<u64>,
    waiter: Option<(u64, Callback)>,
}

///Serializes access to a pass object across frames.
///
/// At most one frame owns the pass, at most one other frame waits for it. A newer waiter displaces the
/// older one, whose callback is rejected. This bounds the number of frames in flight per pass to two.
#[derive(Default)]
pub struct PassSlot {
    state: Mutex<SlotState>,
}

impl PassSlot {
    ///Tries to acquire the slot for `frame`. Returns true if it was acquired immediately. Otherwise `cb` is
    /// completed once the slot is handed over, or rejected if the wait is displaced or cancelled.
    pub fn acquire_for_frame(&self, frame: u64, cb: Callback) -> bool {
        let displaced = {
            let mut state = self.state.lock();
            if state.owner.is_none() {
                state.owner = Some(frame);
                return true;
            }

            if state.owner == Some(frame) {
                return true;
            }

            state.waiter.replace((frame, cb))
        };

        if let Some((_old_frame, old_cb)) = displaced {
            #[cfg(feature = "logging")]
            log::debug!("Frame {} displaced frame {} from pass slot", frame, _old_frame);
            old_cb.complete(false);
        }

        false
    }

    ///Releases the slot if `frame` owns it, handing it to the waiter. If `frame` is the waiter, its wait is cancelled.
    pub fn release_for_frame(&self, frame: u64) {
        let (promoted, cancelled) = {
            let mut state = self.state.lock();
            if state.owner == Some(frame) {
                match state.waiter.take() {
                    Some((next, cb)) => {
                        state.owner = Some(next);
                        (Some(cb), None)
                    }
                    None => {
                        state.owner = None;
                        (None, None)
                    }
                }
            } else if state.waiter.as_ref().map(|(f, _)| *f) == Some(frame) {
                (None, state.waiter.take().map(|(_, cb)| cb))
            } else {
                (None, None)
            }
        };

        if let Some(cb) = promoted {
            cb.complete(true);
        }
        if let Some(cb) = cancelled {
            cb.complete(false);
        }
    }

    pub fn owner(&self) -> Option<u64> {
        self.state.lock().owner
    }

    pub fn waiter(&self) -> Option<u64> {
        self.state.lock().waiter.as_ref().map(|(f, _)| *f)
    }
}
