use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::bulk_delay::EstimatorFactory;
use crate::debug::DebugRouting;
use crate::enhancer::{ComponentSet, EngineFactory};
use crate::frontend::LicenseGate;
use crate::memory::{AllocCallback, FreeCallback};
use crate::processing::{OutputBufferProvider, OutputCallback};
use crate::tuner::TunerCallbacks;
use crate::DEFAULT_QUEUE_CAPACITY;

/// Board and build settings baked in from config.toml.
#[derive(Debug, Serialize, Clone)]
pub struct Config {
    // 应用和板子信息
    pub app_name: &'static str,
    pub app_version: &'static str,
    pub board_type: &'static str,
    pub board_name: &'static str,

    // 音频输入
    pub input_channels: usize,
    pub input_source: i32,
    pub aec_reference: i32,
    pub target_speaker: i32,
    pub queue_capacity: usize,

    // Tuner
    pub tuner_poll_interval_ms: u64,
    pub uart_baud_rate: i32,
    pub calibration_timeout_ms: u64,
    pub debug_channels: &'static str,

    // 算法组件
    pub components: &'static str,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            app_name: env!("AFE_APP_NAME"),
            app_version: env!("AFE_APP_VERSION"),
            board_type: env!("AFE_BOARD_TYPE"),
            board_name: env!("AFE_BOARD_NAME"),

            input_channels: env!("AFE_INPUT_CHANNELS").parse()
                .map_err(|_| "Failed to parse AFE_INPUT_CHANNELS")?,
            input_source: env!("AFE_INPUT_SOURCE").parse()
                .map_err(|_| "Failed to parse AFE_INPUT_SOURCE")?,
            aec_reference: env!("AFE_AEC_REFERENCE").parse()
                .map_err(|_| "Failed to parse AFE_AEC_REFERENCE")?,
            target_speaker: env!("AFE_TARGET_SPEAKER").parse()
                .map_err(|_| "Failed to parse AFE_TARGET_SPEAKER")?,
            queue_capacity: env!("AFE_QUEUE_CAPACITY").parse()
                .map_err(|_| "Failed to parse AFE_QUEUE_CAPACITY")?,

            tuner_poll_interval_ms: env!("AFE_TUNER_POLL_INTERVAL_MS").parse()
                .map_err(|_| "Failed to parse AFE_TUNER_POLL_INTERVAL_MS")?,
            uart_baud_rate: env!("AFE_TUNER_UART_BAUD").parse()
                .map_err(|_| "Failed to parse AFE_TUNER_UART_BAUD")?,
            calibration_timeout_ms: env!("AFE_CALIBRATION_TIMEOUT_MS").parse()
                .map_err(|_| "Failed to parse AFE_CALIBRATION_TIMEOUT_MS")?,
            debug_channels: env!("AFE_DEBUG_CHANNELS"),

            components: env!("AFE_COMPONENTS"),
        })
    }

    /// Built-in values, used only if the baked-in ones fail to parse.
    fn fallback() -> Self {
        Self {
            app_name: "audio-front-end",
            app_version: "0.0.0",
            board_type: "generic",
            board_name: "generic",
            input_channels: 2,
            input_source: 0,
            aec_reference: 1,
            target_speaker: 0,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            tuner_poll_interval_ms: 10,
            uart_baud_rate: 115_200,
            calibration_timeout_ms: 60_000,
            debug_channels: "1,5,6,7",
            components: "hpf,aec,bf,dr,ns,es",
        }
    }

    pub fn debug_routing(&self) -> DebugRouting {
        self.debug_channels.parse().unwrap_or_else(|e| {
            log::warn!("Invalid debug channels '{}': {}", self.debug_channels, e);
            DebugRouting::default()
        })
    }

    pub fn component_set(&self) -> ComponentSet {
        ComponentSet::parse_list(self.components)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new().unwrap_or_else(|e| {
            log::warn!("{}, using built-in board config", e);
            Self::fallback()
        })
    }
}

/// Everything [`AudioFrontEnd::create`](crate::AudioFrontEnd::create) needs.
///
/// `filter_settings` and `output_callback` are required. The memory
/// callbacks must be given together or not at all.
pub struct AfeConfig {
    /// Opaque engine filter coefficients.
    pub filter_settings: Option<Vec<i32>>,
    /// Opaque engine middleware settings.
    pub mw_settings: Vec<u8>,
    pub output_callback: Option<OutputCallback>,
    /// Replaces the internally allocated output frame.
    pub output_buffer: Option<Box<dyn OutputBufferProvider>>,
    pub alloc_memory: Option<AllocCallback>,
    pub free_memory: Option<FreeCallback>,
    /// Tuner transport; the tuner thread only runs when this is set.
    pub tuner: Option<TunerCallbacks>,
    pub license: Option<Arc<dyn LicenseGate>>,
    pub engine: Option<EngineFactory>,
    pub delay_estimator: Option<EstimatorFactory>,
    pub num_channels: usize,
    /// Components this deployment enables. Intersected with the compiled set.
    pub components: ComponentSet,
    pub queue_capacity: usize,
    pub debug_routing: DebugRouting,
    pub tuner_poll_interval: Duration,
    pub calibration_timeout: Duration,
    pub board: Config,
}

impl Default for AfeConfig {
    fn default() -> Self {
        let board = Config::default();
        Self {
            filter_settings: None,
            mw_settings: Vec::new(),
            output_callback: None,
            output_buffer: None,
            alloc_memory: None,
            free_memory: None,
            tuner: None,
            license: None,
            engine: None,
            delay_estimator: None,
            num_channels: board.input_channels,
            components: board.component_set(),
            queue_capacity: board.queue_capacity,
            debug_routing: board.debug_routing(),
            tuner_poll_interval: Duration::from_millis(board.tuner_poll_interval_ms),
            calibration_timeout: Duration::from_millis(board.calibration_timeout_ms),
            board,
        }
    }
}

impl fmt::Debug for AfeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AfeConfig")
            .field("filter_settings", &self.filter_settings.as_ref().map(Vec::len))
            .field("output_callback", &self.output_callback.is_some())
            .field("output_buffer", &self.output_buffer.is_some())
            .field("external_memory", &self.alloc_memory.is_some())
            .field("tuner", &self.tuner.is_some())
            .field("num_channels", &self.num_channels)
            .field("components", &self.components)
            .field("queue_capacity", &self.queue_capacity)
            .field("debug_routing", &self.debug_routing)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baked_in_config_parses() {
        let board = Config::new().unwrap();
        assert!((1..=2).contains(&board.input_channels));
        assert!(board.queue_capacity > 0);
        let defaults = AfeConfig::default();
        assert_eq!(defaults.num_channels, board.input_channels);
        assert!(defaults.filter_settings.is_none());
    }

    #[test]
    fn fallback_matches_shipped_defaults() {
        let board = Config::fallback();
        assert_eq!(board.debug_routing(), DebugRouting::default());
        assert_eq!(board.component_set(), ComponentSet::all());
    }
}
