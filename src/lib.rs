//! Real-time audio front end.
//!
//! Frames captured from one or two microphones are fed into a bounded queue,
//! enhanced one at a time on a dedicated processing thread and handed to the
//! application's output callback in feed order. A tuner thread speaks a
//! CRLF-terminated text protocol so an external configurator can inspect and
//! change enhancement parameters while audio is flowing.
//!
//! ```text
//! capture -> AudioFrontEnd::feed -> FrameQueue -> afe-task -> {SpeechEnhancer | BulkDelayCalibrator} -> output callback
//!                                                   ^
//!                       afe-tuner-task -------------+ (shared pipeline mutex)
//! ```

pub mod bulk_delay;
pub mod config;
pub mod debug;
pub mod enhancer;
pub mod error;
pub mod frontend;
pub mod memory;
pub mod processing;
pub mod queue;
pub mod stats;
pub mod tuner;

pub use bulk_delay::{
    BULK_DELAY_ERROR, CalibrationState, CalibrationStatus, CorrelationEstimator, DelayEstimator,
    EstimatorFactory, EstimatorState,
};
pub use config::{AfeConfig, Config};
pub use debug::{DebugRouting, DebugSignal};
pub use enhancer::{
    Component, ComponentParams, ComponentSet, EngineError, EngineFactory, EngineIo, EngineMemId,
    EngineRegion, EngineSettings, Level, PassthroughEngine, SpeechEngine,
};
pub use error::{AfeError, AfeResult};
pub use frontend::{AfeContext, AfeHandle, AudioFrontEnd, Feeder, LicenseGate, PerpetualLicense};
pub use memory::{AfeBuffer, AllocCallback, FreeCallback, MemTag, MemoryManager, MemoryProvider};
pub use processing::{AfeBufferInfo, OutputBufferProvider, OutputCallback};
pub use stats::StatsSnapshot;
pub use tuner::{ConfigAction, ConfigName, ConfigSetting, TunerCallbacks};

/// Frame duration.
pub const FRAME_SIZE_MS: u32 = 10;
/// Input sample rate.
pub const SAMPLE_RATE_HZ: u32 = 16_000;
/// Samples per channel in one frame.
pub const MONO_FRAME_SAMPLES: usize = (SAMPLE_RATE_HZ * FRAME_SIZE_MS / 1000) as usize;
pub const MONO_FRAME_BYTES: usize = MONO_FRAME_SAMPLES * 2;
pub const STEREO_FRAME_SAMPLES: usize = MONO_FRAME_SAMPLES * 2;
pub const MAX_INPUT_CHANNELS: usize = 2;
/// Debug tap channels delivered with every frame.
pub const DEBUG_CHANNELS: usize = 4;
/// Internal monitor output: one mono frame per debug slot.
pub const MONITOR_OUT_SAMPLES: usize = DEBUG_CHANNELS * MONO_FRAME_SAMPLES;
pub const AUDIO_METER_MAX: usize = 3;
pub const DEFAULT_QUEUE_CAPACITY: usize = 30;
/// Hardware input gain accepted over the tuner, in dB.
pub const HW_INPUT_GAIN_RANGE: std::ops::RangeInclusive<i32> = -105..=105;
