//! Error types shared by every part of the front end.

use thiserror::Error;

use crate::enhancer::Component;
use crate::memory::MemTag;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AfeError {
    #[error("out of memory: {size} bytes for {tag:?}")]
    OutOfMemory { tag: MemTag, size: usize },

    #[error("generic error: {0}")]
    Generic(String),

    #[error("bad argument: {0}")]
    BadArg(&'static str),

    #[error("front end is already initialized")]
    AlreadyInitialized,

    #[error("frame checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    CrcChecksum { expected: u32, computed: u32 },

    #[error("speech enhancement failed on this frame")]
    SpeechEnhancement,

    #[error("system module error: {0}")]
    SystemModule(String),

    #[error("processing queue is full")]
    QueueFull,

    #[error("functionality restricted: license expired")]
    FunctionalityRestricted,

    #[error("tuner: invalid command")]
    TunerInvalidCmd,

    #[error("tuner: {0}")]
    TunerGeneric(String),

    #[error("tuner: need more data")]
    TunerNeedMoreData,

    #[error("tuner: internal error: {0}")]
    TunerInternal(String),

    #[error("tuner: nothing received, wait for poll interval")]
    TunerWaitForPollTimeout,

    #[error("tuner: invalid command parameters")]
    TunerInvalidCmdParams,

    #[error("tuner: component {0:?} is not enabled in this build")]
    TunerComponentNotEnabled(Component),

    #[error("tuner: command not supported")]
    TunerCmdNotSupported,

    #[error("tuner: hardware input gain {0} dB out of range")]
    TunerHwInputGainOutOfRange(i32),
}

impl AfeError {
    /// Errors that only affect the current frame or tuner request.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AfeError::CrcChecksum { .. }
                | AfeError::SpeechEnhancement
                | AfeError::QueueFull
                | AfeError::TunerInvalidCmd
                | AfeError::TunerGeneric(_)
                | AfeError::TunerNeedMoreData
                | AfeError::TunerWaitForPollTimeout
                | AfeError::TunerInvalidCmdParams
                | AfeError::TunerComponentNotEnabled(_)
                | AfeError::TunerCmdNotSupported
                | AfeError::TunerHwInputGainOutOfRange(_)
        )
    }
}

pub type AfeResult<T> = Result<T, AfeError>;
