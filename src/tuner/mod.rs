//! Runtime tuning over a CRLF-terminated text protocol.
//!
//! Requests look like `get,ns` or `set,input_gain,12`; every request gets
//! exactly one `AFERSP,<status>[,<data>]` line back. Bytes come in and go out
//! through application callbacks, so the transport can be a UART, a socket
//! or stdin.

use crate::error::AfeResult;
use crate::frontend::AfeContext;

#[cfg(feature = "tuning")]
pub mod command;
#[cfg(feature = "tuning")]
pub mod handlers;
#[cfg(feature = "tuning")]
pub mod protocol;
#[cfg(feature = "tuning")]
mod task;

#[cfg(feature = "tuning")]
pub use command::{CommandRegistry, FnCommand, TunerCommand, TunerContext};
#[cfg(feature = "tuning")]
pub use protocol::{TunerReply, TunerRequest, TunerStatus};
#[cfg(feature = "tuning")]
pub(crate) use task::TunerTask;

/// Copies up to `buf.len()` request bytes. `Ok(0)` means nothing arrived.
pub type ReadRequestFn = Box<dyn FnMut(&mut [u8]) -> AfeResult<usize> + Send>;
pub type WriteResponseFn = Box<dyn FnMut(&[u8]) -> AfeResult<()> + Send>;
/// Lets the application read, update or observe a setting it owns.
pub type NotifySettingsFn =
    Box<dyn FnMut(&AfeContext, &mut ConfigSetting) -> AfeResult<()> + Send>;

pub struct TunerCallbacks {
    pub read_request: ReadRequestFn,
    pub write_response: WriteResponseFn,
    pub notify_settings: NotifySettingsFn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigAction {
    /// Application fills in `value`.
    Read,
    /// Application applies `value`.
    Update,
    /// Informational, the front end already applied it.
    Notify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigName {
    AecState,
    AecBulkDelay,
    BeamFormingState,
    InferenceCanceller,
    DereverberationState,
    EsnsState,
    EchoSuppressor,
    NoiseSuppressor,
    InputGain,
    Hpf,
    BulkDelayCalcStart,
    BulkDelayCalcStopped,
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigSetting {
    pub action: ConfigAction,
    pub name: ConfigName,
    pub value: i32,
}

/// Builds the command table.
#[cfg(feature = "tuning")]
pub fn init_tuner_commands() -> CommandRegistry {
    let mut registry = CommandRegistry::new();
    for command in handlers::commands() {
        log::debug!("Registered tuner command: {}", command.describe());
        registry.register(Box::new(command));
    }
    log::info!("Tuner ready with {} commands", registry.len());
    registry
}

#[cfg(not(feature = "tuning"))]
mod disabled {
    use std::sync::Arc;
    use std::time::Duration;

    use super::TunerCallbacks;
    use crate::error::AfeResult;
    use crate::frontend::AfeContext;

    /// Stand-in when tuning is compiled out.
    pub(crate) struct TunerTask;

    impl TunerTask {
        pub fn start(
            _ctx: Arc<AfeContext>,
            _callbacks: TunerCallbacks,
            _poll_interval: Duration,
        ) -> AfeResult<Self> {
            log::warn!("Tuning is not compiled in, tuner callbacks ignored");
            Ok(Self)
        }

        pub fn stop(&mut self) {}
    }
}

#[cfg(not(feature = "tuning"))]
pub(crate) use disabled::TunerTask;
