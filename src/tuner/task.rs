use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::command::{CommandRegistry, TunerContext};
use super::protocol::{
    Accumulated, REQUEST_CHUNK_SIZE, RequestAccumulator, TunerReply, TunerStatus, encode_response,
};
use super::{TunerCallbacks, init_tuner_commands};
use crate::error::{AfeError, AfeResult};
use crate::frontend::AfeContext;

/// Reads requests, dispatches them and writes one response per request.
struct TunerEngine {
    ctx: Arc<AfeContext>,
    callbacks: TunerCallbacks,
    registry: CommandRegistry,
    accumulator: RequestAccumulator,
    chunk: [u8; REQUEST_CHUNK_SIZE],
}

impl TunerEngine {
    /// One poll of the read callback.
    fn receive(&mut self) -> AfeResult<()> {
        let n = (self.callbacks.read_request)(&mut self.chunk)?;
        if n == 0 {
            return Err(AfeError::TunerWaitForPollTimeout);
        }
        let n = n.min(REQUEST_CHUNK_SIZE);
        match self.accumulator.push(&self.chunk[..n]) {
            Accumulated::NeedMoreData => Err(AfeError::TunerNeedMoreData),
            Accumulated::Overflow => self.respond(&TunerReply::status(TunerStatus::InvalidCmd)),
            Accumulated::Line(line) => {
                log::debug!("Tuner request: {}", line);
                let reply = {
                    let mut tctx =
                        TunerContext::new(&self.ctx, &mut self.callbacks.notify_settings);
                    self.registry.dispatch(&mut tctx, &line)
                };
                self.respond(&reply)
            }
        }
    }

    fn respond(&mut self, reply: &TunerReply) -> AfeResult<()> {
        let bytes = encode_response(reply)?;
        (self.callbacks.write_response)(&bytes)
    }
}

pub(crate) struct TunerTask {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TunerTask {
    pub fn start(
        ctx: Arc<AfeContext>,
        callbacks: TunerCallbacks,
        poll_interval: Duration,
    ) -> AfeResult<Self> {
        let accumulator = RequestAccumulator::new(ctx.memory())?;
        let engine = TunerEngine {
            ctx,
            callbacks,
            registry: init_tuner_commands(),
            accumulator,
            chunk: [0; REQUEST_CHUNK_SIZE],
        };

        let running = Arc::new(AtomicBool::new(true));
        let handle = {
            let running = running.clone();
            thread::Builder::new()
                .name("afe-tuner-task".into())
                .spawn(move || tuner_loop(engine, &running, poll_interval))
                .map_err(|e| AfeError::SystemModule(format!("failed to spawn tuner task: {}", e)))?
        };
        log::info!("Tuner task started, poll interval {:?}", poll_interval);
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Tuner task panicked");
            }
            log::info!("Tuner task stopped");
        }
    }
}

impl Drop for TunerTask {
    fn drop(&mut self) {
        self.stop();
    }
}

fn tuner_loop(mut engine: TunerEngine, running: &AtomicBool, poll_interval: Duration) {
    while running.load(Ordering::SeqCst) {
        match engine.receive() {
            Ok(()) | Err(AfeError::TunerNeedMoreData) => {}
            Err(AfeError::TunerWaitForPollTimeout) => thread::sleep(poll_interval),
            Err(e) => {
                log::error!("Tuner request failed: {}", e);
                thread::sleep(poll_interval);
            }
        }
    }
    log::debug!("Exiting from tuner task routine");
}
