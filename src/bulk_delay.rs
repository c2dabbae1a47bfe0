//! Bulk-delay calibration.
//!
//! While a calibration session is armed the processing thread hands every
//! frame to a [`DelayEstimator`] instead of the enhancer. The application
//! plays the estimator's reference signal through the speaker; the estimator
//! finds it again in the microphone capture and reports the playback to
//! capture delay in milliseconds.
//!
//! The session state lives inside the pipeline lock. Completion is signalled
//! through a separate [`CompletionSignal`] so a waiter never holds the lock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::enhancer::EngineError;
use crate::error::{AfeError, AfeResult};

/// Delay reported when calibration does not produce a result.
pub const BULK_DELAY_ERROR: i32 = -1;
/// Reference periods without a result before the session gives up.
pub const MAX_REPEAT_COUNT: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CalibrationState {
    Idle,
    Armed,
    Running,
    Completed,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimatorState {
    Searching,
    Converged,
}

pub trait DelayEstimator: Send {
    /// The signal the application must play while calibrating. Its length
    /// is a whole number of frames.
    fn reference(&self) -> &[i16];
    fn process(
        &mut self,
        aec_ref: Option<&[i16]>,
        mic: &[i16],
        output: &mut [i16],
    ) -> Result<(), EngineError>;
    fn state(&self) -> EstimatorState;
    fn bulk_delay_ms(&self) -> i32;
    fn valid_estimates(&self) -> u32;
}

/// Builds an estimator for a frame size and sample rate.
pub type EstimatorFactory =
    Arc<dyn Fn(usize, u32) -> Box<dyn DelayEstimator> + Send + Sync>;

pub fn default_estimator_factory() -> EstimatorFactory {
    Arc::new(|frame_size, sample_rate| {
        Box::new(CorrelationEstimator::new(frame_size, sample_rate))
    })
}

/// Finds the reference in the capture by circular cross-correlation, one
/// evaluation per reference period. Two consistent estimates in a row make
/// a result.
pub struct CorrelationEstimator {
    reference: Vec<i16>,
    ref_energy: f64,
    capture: Vec<i16>,
    filled: usize,
    max_lag: usize,
    samples_per_ms: usize,
    lags: Vec<usize>,
    state: EstimatorState,
    delay_ms: i32,
}

impl CorrelationEstimator {
    const REF_FRAMES: usize = 25;
    const MAX_LAG_MS: usize = 200;
    const REQUIRED_ESTIMATES: usize = 2;
    const MIN_CORRELATION: f64 = 0.5;
    const SILENCE_RMS: f64 = 32.0;
    const SEED: u32 = 0x1234_5678;

    pub fn new(frame_size: usize, sample_rate: u32) -> Self {
        let len = frame_size * Self::REF_FRAMES;
        let mut x = Self::SEED;
        let reference: Vec<i16> = (0..len)
            .map(|_| {
                x = x.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                let v = ((x >> 16) & 0x7fff) as i32 - 0x4000;
                (v / 2) as i16
            })
            .collect();
        let ref_energy = reference.iter().map(|&s| (s as f64) * (s as f64)).sum();
        let samples_per_ms = (sample_rate as usize / 1000).max(1);
        Self {
            ref_energy,
            capture: vec![0; len],
            filled: 0,
            max_lag: (Self::MAX_LAG_MS * samples_per_ms).min(len.saturating_sub(1)),
            samples_per_ms,
            reference,
            lags: Vec::new(),
            state: EstimatorState::Searching,
            delay_ms: BULK_DELAY_ERROR,
        }
    }

    fn evaluate(&mut self) {
        let len = self.reference.len();
        let cap_energy: f64 = self.capture.iter().map(|&s| (s as f64) * (s as f64)).sum();
        if len == 0 || (cap_energy / len as f64).sqrt() < Self::SILENCE_RMS {
            log::debug!("Calibration period too quiet, skipped");
            self.lags.clear();
            return;
        }

        let (best_lag, best_corr) = (0..=self.max_lag)
            .map(|lag| {
                let corr: i64 = self
                    .capture
                    .iter()
                    .enumerate()
                    .map(|(n, &c)| c as i64 * self.reference[(n + len - lag) % len] as i64)
                    .sum();
                (lag, corr)
            })
            .max_by_key(|&(_, corr)| corr)
            .unwrap_or((0, 0));

        let norm = best_corr as f64 / (cap_energy * self.ref_energy).sqrt();
        if norm < Self::MIN_CORRELATION {
            log::debug!("Calibration correlation {:.2} below threshold", norm);
            self.lags.clear();
            return;
        }

        let consistent = self
            .lags
            .last()
            .is_none_or(|&prev| prev.abs_diff(best_lag) <= self.samples_per_ms);
        if !consistent {
            self.lags.clear();
        }
        self.lags.push(best_lag);
        log::debug!(
            "Calibration estimate {} samples (corr {:.2}, {} consistent)",
            best_lag,
            norm,
            self.lags.len()
        );

        if self.lags.len() >= Self::REQUIRED_ESTIMATES {
            let avg = self.lags.iter().sum::<usize>() as f64 / self.lags.len() as f64;
            self.delay_ms = (avg / self.samples_per_ms as f64).round() as i32;
            self.state = EstimatorState::Converged;
        }
    }
}

impl DelayEstimator for CorrelationEstimator {
    fn reference(&self) -> &[i16] {
        &self.reference
    }

    fn process(
        &mut self,
        _aec_ref: Option<&[i16]>,
        mic: &[i16],
        output: &mut [i16],
    ) -> Result<(), EngineError> {
        let n = mic.len().min(output.len());
        output[..n].copy_from_slice(&mic[..n]);
        if self.state == EstimatorState::Converged {
            return Ok(());
        }
        let room = self.capture.len() - self.filled;
        if mic.len() > room {
            return Err(EngineError::InvalidParams);
        }
        self.capture[self.filled..self.filled + mic.len()].copy_from_slice(mic);
        self.filled += mic.len();
        if self.filled == self.capture.len() {
            self.evaluate();
            self.filled = 0;
        }
        Ok(())
    }

    fn state(&self) -> EstimatorState {
        self.state
    }

    fn bulk_delay_ms(&self) -> i32 {
        self.delay_ms
    }

    fn valid_estimates(&self) -> u32 {
        self.lags.len() as u32
    }
}

/// Wakes waiters when a session finishes.
#[derive(Debug, Default)]
pub(crate) struct CompletionSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct SignalState {
    armed: bool,
    result: Option<i32>,
}

impl CompletionSignal {
    fn arm(&self) {
        *self.state.lock() = SignalState {
            armed: true,
            result: None,
        };
    }

    fn complete(&self, bulk_delay: i32) {
        self.state.lock().result = Some(bulk_delay);
        self.cond.notify_all();
    }

    fn disarm(&self) {
        *self.state.lock() = SignalState::default();
        self.cond.notify_all();
    }

    /// `None` when nothing is armed or the wait timed out. A timeout past
    /// the end of the clock waits until completion or disarm.
    pub fn wait(&self, timeout: Duration) -> Option<i32> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        loop {
            if let Some(result) = state.result {
                return Some(result);
            }
            if !state.armed {
                return None;
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        return state.result;
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
    }
}

struct Session {
    estimator: Box<dyn DelayEstimator>,
    num_ref_frames: u32,
    ref_frame_count: u32,
    repeat_count: u32,
    state: CalibrationState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CalibrationStatus {
    pub state: CalibrationState,
    pub ref_frame_count: u32,
    pub repeat_count: u32,
    pub bulk_delay_ms: i32,
}

pub(crate) struct BulkDelayCalibrator {
    session: Option<Session>,
    bulk_delay: i32,
    signal: Arc<CompletionSignal>,
    factory: EstimatorFactory,
    frame_size: usize,
    sample_rate: u32,
}

impl BulkDelayCalibrator {
    pub fn new(factory: EstimatorFactory, frame_size: usize, sample_rate: u32) -> Self {
        Self {
            session: None,
            bulk_delay: 0,
            signal: Arc::new(CompletionSignal::default()),
            factory,
            frame_size,
            sample_rate,
        }
    }

    pub fn signal(&self) -> Arc<CompletionSignal> {
        self.signal.clone()
    }

    /// Arms a session and returns a copy of the reference signal.
    pub fn init(&mut self) -> AfeResult<Vec<i16>> {
        if self.is_active() {
            return Err(AfeError::BadArg("bulk delay calculation already running"));
        }
        let estimator = (self.factory)(self.frame_size, self.sample_rate);
        let reference = estimator.reference().to_vec();
        let num_ref_frames = (reference.len() / self.frame_size) as u32;
        if num_ref_frames == 0 {
            return Err(AfeError::SystemModule(
                "delay estimator has no reference signal".into(),
            ));
        }
        self.session = Some(Session {
            estimator,
            num_ref_frames,
            ref_frame_count: 0,
            repeat_count: 0,
            state: CalibrationState::Armed,
        });
        self.bulk_delay = BULK_DELAY_ERROR;
        self.signal.arm();
        log::info!(
            "Bulk delay calculation armed, reference {} frames",
            num_ref_frames
        );
        Ok(reference)
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.session.as_ref().map(|s| s.state),
            Some(CalibrationState::Armed | CalibrationState::Running)
        )
    }

    /// Runs one frame through the estimator.
    pub fn process(
        &mut self,
        aec_ref: Option<&[i16]>,
        mic: &[i16],
        output: &mut [i16],
    ) -> AfeResult<()> {
        let Some(session) = self.session.as_mut().filter(|s| {
            matches!(s.state, CalibrationState::Armed | CalibrationState::Running)
        }) else {
            return Ok(());
        };
        session.state = CalibrationState::Running;
        let result = session.estimator.process(aec_ref, mic, output);

        session.ref_frame_count += 1;
        if session.ref_frame_count == session.num_ref_frames {
            session.ref_frame_count = 0;
            if session.estimator.state() != EstimatorState::Converged {
                session.repeat_count += 1;
            }
        }

        if session.estimator.state() == EstimatorState::Converged {
            self.bulk_delay = session.estimator.bulk_delay_ms();
            log::info!(
                "Bulk delay {} ms, {} valid estimates after {} repeats",
                self.bulk_delay,
                session.estimator.valid_estimates(),
                session.repeat_count
            );
            self.finish(CalibrationState::Completed);
        } else if session.repeat_count >= MAX_REPEAT_COUNT {
            log::warn!(
                "Bulk delay calculation gave up after {} repeats",
                session.repeat_count
            );
            self.bulk_delay = BULK_DELAY_ERROR;
            self.finish(CalibrationState::TimedOut);
        }

        result.map_err(|e| AfeError::SystemModule(format!("delay estimator: {}", e)))
    }

    fn finish(&mut self, state: CalibrationState) {
        if let Some(session) = self.session.as_mut() {
            session.state = state;
            session.ref_frame_count = 0;
            session.repeat_count = 0;
        }
        self.signal.complete(self.bulk_delay);
    }

    /// Called when a waiter gave up. The session stops consuming frames.
    pub fn expire(&mut self) {
        if !self.is_active() {
            return;
        }
        if let Some(session) = self.session.as_mut() {
            session.state = CalibrationState::TimedOut;
            session.ref_frame_count = 0;
            session.repeat_count = 0;
        }
        self.bulk_delay = BULK_DELAY_ERROR;
        log::warn!("Bulk delay calculation timed out");
    }

    /// Settles a waiter's timeout. A session that completed after the
    /// waiter gave up still reports its delay.
    pub fn expire_unless_completed(&mut self) -> i32 {
        // 超时与处理线程完成之间存在竞争
        if self.status().state == CalibrationState::Completed {
            return self.bulk_delay;
        }
        self.expire();
        BULK_DELAY_ERROR
    }

    /// Releases the session. Safe in any state.
    pub fn deinit(&mut self) {
        if self.session.take().is_some() {
            log::info!("Bulk delay calculation released");
        }
        self.bulk_delay = 0;
        self.signal.disarm();
    }

    pub fn status(&self) -> CalibrationStatus {
        match &self.session {
            Some(s) => CalibrationStatus {
                state: s.state,
                ref_frame_count: s.ref_frame_count,
                repeat_count: s.repeat_count,
                bulk_delay_ms: self.bulk_delay,
            },
            None => CalibrationStatus {
                state: CalibrationState::Idle,
                ref_frame_count: 0,
                repeat_count: 0,
                bulk_delay_ms: self.bulk_delay,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MONO_FRAME_SAMPLES, SAMPLE_RATE_HZ};

    fn calibrator() -> BulkDelayCalibrator {
        BulkDelayCalibrator::new(
            default_estimator_factory(),
            MONO_FRAME_SAMPLES,
            SAMPLE_RATE_HZ,
        )
    }

    /// Feeds `frames` frames of the reference delayed by `delay` samples.
    fn feed_delayed(cal: &mut BulkDelayCalibrator, reference: &[i16], delay: usize, frames: usize) {
        let len = reference.len();
        let mut out = vec![0i16; MONO_FRAME_SAMPLES];
        for f in 0..frames {
            let mic: Vec<i16> = (0..MONO_FRAME_SAMPLES)
                .map(|i| {
                    let n = f * MONO_FRAME_SAMPLES + i;
                    reference[(n + len - delay % len) % len]
                })
                .collect();
            cal.process(None, &mic, &mut out).unwrap();
            if !cal.is_active() {
                break;
            }
        }
    }

    #[test]
    fn finds_a_delayed_reference() {
        let mut cal = calibrator();
        let signal = cal.signal();
        let reference = cal.init().unwrap();
        assert_eq!(reference.len(), 25 * MONO_FRAME_SAMPLES);
        assert!(cal.is_active());

        feed_delayed(&mut cal, &reference, 30 * 16, 60);

        assert!(!cal.is_active());
        assert_eq!(cal.status().state, CalibrationState::Completed);
        assert_eq!(signal.wait(Duration::from_millis(10)), Some(30));
    }

    #[test]
    fn silence_gives_up_after_max_repeats() {
        let mut cal = calibrator();
        let signal = cal.signal();
        cal.init().unwrap();
        let mic = vec![0i16; MONO_FRAME_SAMPLES];
        let mut out = vec![0i16; MONO_FRAME_SAMPLES];
        let frames = 25 * MAX_REPEAT_COUNT as usize;
        for _ in 0..frames {
            cal.process(None, &mic, &mut out).unwrap();
        }
        assert_eq!(cal.status().state, CalibrationState::TimedOut);
        assert_eq!(signal.wait(Duration::from_millis(10)), Some(BULK_DELAY_ERROR));
    }

    #[test]
    fn second_init_while_running_is_rejected() {
        let mut cal = calibrator();
        cal.init().unwrap();
        assert!(matches!(cal.init(), Err(AfeError::BadArg(_))));
        cal.deinit();
        assert!(cal.init().is_ok());
    }

    #[test]
    fn wait_without_session_returns_immediately() {
        let cal = calibrator();
        let started = Instant::now();
        assert_eq!(cal.signal().wait(Duration::from_secs(5)), None);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn unbounded_wait_does_not_overflow() {
        let mut cal = calibrator();
        let signal = cal.signal();
        assert_eq!(signal.wait(Duration::MAX), None);

        let reference = cal.init().unwrap();
        let waiter = {
            let signal = signal.clone();
            std::thread::spawn(move || signal.wait(Duration::MAX))
        };
        feed_delayed(&mut cal, &reference, 30 * 16, 60);
        assert_eq!(waiter.join().unwrap(), Some(30));
    }

    #[test]
    fn unbounded_wait_ends_on_deinit() {
        let mut cal = calibrator();
        let signal = cal.signal();
        cal.init().unwrap();
        let waiter = {
            let signal = signal.clone();
            std::thread::spawn(move || signal.wait(Duration::MAX))
        };
        std::thread::sleep(Duration::from_millis(20));
        cal.deinit();
        assert_eq!(waiter.join().unwrap(), None);
    }

    #[test]
    fn late_completion_survives_the_timeout() {
        let mut cal = calibrator();
        let signal = cal.signal();
        let reference = cal.init().unwrap();
        assert_eq!(signal.wait(Duration::from_millis(5)), None);

        // finishes between the timed-out wait and the expiry
        feed_delayed(&mut cal, &reference, 30 * 16, 60);
        assert_eq!(cal.expire_unless_completed(), 30);
        assert_eq!(cal.status().state, CalibrationState::Completed);
    }

    #[test]
    fn timeout_on_a_running_session_expires_it() {
        let mut cal = calibrator();
        cal.init().unwrap();
        assert_eq!(cal.expire_unless_completed(), BULK_DELAY_ERROR);
        assert_eq!(cal.status().state, CalibrationState::TimedOut);
        assert!(!cal.is_active());
    }

    #[test]
    fn expire_stops_the_session() {
        let mut cal = calibrator();
        let signal = cal.signal();
        cal.init().unwrap();
        assert_eq!(signal.wait(Duration::from_millis(20)), None);
        cal.expire();
        assert!(!cal.is_active());
        assert_eq!(cal.status().bulk_delay_ms, BULK_DELAY_ERROR);
        cal.deinit();
        assert_eq!(cal.status().state, CalibrationState::Idle);
        assert_eq!(cal.status().bulk_delay_ms, 0);
    }
}
