//! Byte-based flow control between a sink and the sources feeding it.
//!
//! A sink that buffers output for an external consumer records every batch
//! it buffers and every batch the consumer takes. Crossing the high-water
//! mark pauses the upstream producers; draining to the low-water mark
//! resumes them. The two thresholds form a hysteresis band so that a
//! buffer hovering around a single boundary does not flap.

use crate::error::{ExecError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Thresholds, in bytes, of buffered but unconsumed output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackpressureOptions {
    /// Resume producers once buffered bytes are at or below this.
    pub resume_if_below: u64,
    /// Pause producers once buffered bytes exceed this.
    pub pause_if_above: u64,
}

impl BackpressureOptions {
    pub fn new(resume_if_below: u64, pause_if_above: u64) -> Self {
        Self {
            resume_if_below,
            pause_if_above,
        }
    }

    /// Pause above 1 GiB, resume at 256 MiB.
    pub fn default_backpressure() -> Self {
        Self::new(1 << 28, 1 << 30)
    }

    pub fn validate(&self) -> Result<()> {
        if self.resume_if_below > self.pause_if_above {
            return Err(ExecError::invalid(format!(
                "Backpressure requires resume_if_below ({}) <= pause_if_above ({})",
                self.resume_if_below, self.pause_if_above
            )));
        }
        Ok(())
    }
}

impl Default for BackpressureOptions {
    fn default() -> Self {
        Self::default_backpressure()
    }
}

/// Handed to whoever drains a sink so they can throttle the plan.
pub trait BackpressureControl: Send + Sync {
    fn pause(&self);
    fn resume(&self);
}

/// Receives the decisions of a [`BackpressureAccumulator`].
///
/// `sequence` grows in the order decisions were taken, which may differ
/// from the order the calls arrive in. A receiver must drop a request
/// whose sequence is not newer than the last one it applied.
pub trait BackpressureSignal: Send + Sync {
    fn signal(&self, paused: bool, sequence: u64);
}

#[derive(Debug, Default)]
struct MonitorState {
    bytes_in_use: AtomicU64,
    paused: AtomicBool,
}

/// Read-only view of a sink's backpressure state.
#[derive(Debug, Clone, Default)]
pub struct BackpressureMonitor {
    state: Arc<MonitorState>,
}

impl BackpressureMonitor {
    /// Bytes buffered but not yet consumed.
    pub fn bytes_in_use(&self) -> u64 {
        self.state.bytes_in_use.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.state.paused.load(Ordering::SeqCst)
    }
}

/// Tracks buffered bytes and drives a [`BackpressureSignal`].
pub struct BackpressureAccumulator {
    options: BackpressureOptions,
    monitor: BackpressureMonitor,
    signal: Arc<dyn BackpressureSignal>,
    // Sequence of the last decision. Decisions are stamped under the lock
    // and delivered after it is released.
    transition: Mutex<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    None,
    Pause(u64),
    Resume(u64),
}

impl BackpressureAccumulator {
    pub fn new(options: BackpressureOptions, signal: Arc<dyn BackpressureSignal>) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            monitor: BackpressureMonitor::default(),
            signal,
            transition: Mutex::new(0),
        })
    }

    pub fn options(&self) -> &BackpressureOptions {
        &self.options
    }

    pub fn monitor(&self) -> BackpressureMonitor {
        self.monitor.clone()
    }

    /// `bytes` were buffered.
    pub fn record_produced(&self, bytes: u64) {
        let transition = {
            let mut sequence = self.transition.lock();
            let state = &self.monitor.state;
            let in_use = state.bytes_in_use.fetch_add(bytes, Ordering::SeqCst) + bytes;
            if in_use > self.options.pause_if_above && !state.paused.load(Ordering::SeqCst) {
                state.paused.store(true, Ordering::SeqCst);
                *sequence += 1;
                Transition::Pause(*sequence)
            } else {
                Transition::None
            }
        };
        self.apply(transition, "paused");
    }

    /// `bytes` were handed to the consumer.
    pub fn record_consumed(&self, bytes: u64) {
        let transition = {
            let mut sequence = self.transition.lock();
            let state = &self.monitor.state;
            let previous = state.bytes_in_use.load(Ordering::SeqCst);
            let in_use = previous.saturating_sub(bytes);
            state.bytes_in_use.store(in_use, Ordering::SeqCst);
            if in_use <= self.options.resume_if_below && state.paused.load(Ordering::SeqCst) {
                state.paused.store(false, Ordering::SeqCst);
                *sequence += 1;
                Transition::Resume(*sequence)
            } else {
                Transition::None
            }
        };
        self.apply(transition, "resumed");
    }

    fn apply(&self, transition: Transition, verb: &str) {
        match transition {
            Transition::None => {}
            Transition::Pause(sequence) => {
                tracing::debug!(sequence, bytes = self.monitor.bytes_in_use(), "Backpressure {}", verb);
                self.signal.signal(true, sequence);
            }
            Transition::Resume(sequence) => {
                tracing::debug!(sequence, bytes = self.monitor.bytes_in_use(), "Backpressure {}", verb);
                self.signal.signal(false, sequence);
            }
        }
    }
}

impl fmt::Debug for BackpressureAccumulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackpressureAccumulator")
            .field("options", &self.options)
            .field("monitor", &self.monitor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingControl {
        pauses: AtomicUsize,
        resumes: AtomicUsize,
        sequences: Mutex<Vec<u64>>,
    }

    impl BackpressureSignal for CountingControl {
        fn signal(&self, paused: bool, sequence: u64) {
            if paused {
                self.pauses.fetch_add(1, Ordering::SeqCst);
            } else {
                self.resumes.fetch_add(1, Ordering::SeqCst);
            }
            self.sequences.lock().push(sequence);
        }
    }

    fn accumulator(resume: u64, pause: u64) -> (BackpressureAccumulator, Arc<CountingControl>) {
        let control = Arc::new(CountingControl::default());
        let acc = BackpressureAccumulator::new(BackpressureOptions::new(resume, pause), control.clone())
            .unwrap();
        (acc, control)
    }

    #[test]
    fn test_invalid_thresholds() {
        let control: Arc<dyn BackpressureSignal> = Arc::new(CountingControl::default());
        let err = BackpressureAccumulator::new(BackpressureOptions::new(10, 5), control).unwrap_err();
        assert!(err.is_invalid());
    }

    #[test]
    fn test_pause_above_and_resume_at_threshold() {
        let (acc, control) = accumulator(2, 4);
        let monitor = acc.monitor();
        for _ in 0..4 {
            acc.record_produced(1);
        }
        assert!(!monitor.is_paused());

        acc.record_produced(1);
        assert!(monitor.is_paused());
        assert_eq!(control.pauses.load(Ordering::SeqCst), 1);

        acc.record_consumed(1);
        acc.record_consumed(1);
        assert!(monitor.is_paused());
        assert_eq!(monitor.bytes_in_use(), 3);

        acc.record_consumed(1);
        assert!(!monitor.is_paused());
        assert_eq!(monitor.bytes_in_use(), 2);
        assert_eq!(control.resumes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_decisions_are_sequenced_in_order() {
        let (acc, control) = accumulator(0, 1);
        for _ in 0..3 {
            acc.record_produced(5);
            acc.record_consumed(5);
        }
        assert_eq!(*control.sequences.lock(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_consumed_never_underflows() {
        let (acc, _) = accumulator(0, 0);
        acc.record_consumed(10);
        assert_eq!(acc.monitor().bytes_in_use(), 0);
    }

    proptest! {
        #[test]
        fn prop_hysteresis(
            resume in 0u64..50,
            band in 0u64..50,
            ops in prop::collection::vec((any::<bool>(), 1u64..20), 1..200),
        ) {
            let pause = resume + band;
            let (acc, control) = accumulator(resume, pause);
            let monitor = acc.monitor();
            let mut model: u64 = 0;
            for (produce, bytes) in ops {
                let before = monitor.is_paused();
                if produce {
                    model += bytes;
                    acc.record_produced(bytes);
                } else {
                    model = model.saturating_sub(bytes);
                    acc.record_consumed(bytes);
                }
                prop_assert_eq!(monitor.bytes_in_use(), model);
                if model > pause && produce {
                    prop_assert!(monitor.is_paused());
                } else if model <= resume && !produce {
                    prop_assert!(!monitor.is_paused());
                } else if model > resume && model <= pause {
                    prop_assert_eq!(monitor.is_paused(), before);
                }
            }
            let pauses = control.pauses.load(Ordering::SeqCst);
            let resumes = control.resumes.load(Ordering::SeqCst);
            prop_assert!(pauses == resumes || pauses == resumes + 1);
        }
    }
}
