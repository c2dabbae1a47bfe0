//! The frame processing thread.
//!
//! `afe-task` pops frames in feed order, runs each through the enhancer (or
//! the bulk-delay calibrator while a session is active), fills the debug taps
//! and hands the result to the application's output callback.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::bulk_delay::BulkDelayCalibrator;
use crate::debug::DebugTaps;
use crate::enhancer::SpeechEnhancer;
use crate::error::{AfeError, AfeResult};
use crate::frontend::AfeContext;
use crate::memory::{AfeBuffer, MemTag, MemoryManager};
use crate::queue::{FrameDescriptor, FrameQueue, FrameReceiver, QueueItem};
use crate::{DEBUG_CHANNELS, MONO_FRAME_SAMPLES};

/// State shared by the processing and tuner threads under one lock.
pub(crate) struct Pipeline {
    pub enhancer: SpeechEnhancer,
    pub calibrator: BulkDelayCalibrator,
}

/// Everything the output callback sees for one frame.
#[derive(Debug)]
pub struct AfeBufferInfo<'a> {
    /// Input as fed, channel 1 after channel 0.
    pub input: &'a [i16],
    pub aec_ref: Option<&'a [i16]>,
    pub output: &'a [i16],
    /// Tap channels, present when tuning is compiled in.
    pub debug: [Option<&'a [i16]>; DEBUG_CHANNELS],
}

pub type OutputCallback =
    Box<dyn FnMut(&AfeContext, &AfeBufferInfo<'_>) -> AfeResult<()> + Send>;

/// Supplies the buffer each frame's enhanced output is written into.
pub trait OutputBufferProvider: Send {
    /// At least one mono frame of samples.
    fn output_buffer(&mut self, ctx: &AfeContext) -> AfeResult<&mut [i16]>;
}

/// Default provider: one frame allocated on first use and reused.
pub(crate) struct InternalOutputBuffer {
    memory: MemoryManager,
    buffer: Option<AfeBuffer>,
}

impl InternalOutputBuffer {
    pub fn new(memory: MemoryManager) -> Self {
        Self {
            memory,
            buffer: None,
        }
    }
}

impl OutputBufferProvider for InternalOutputBuffer {
    fn output_buffer(&mut self, _ctx: &AfeContext) -> AfeResult<&mut [i16]> {
        if self.buffer.is_none() {
            self.buffer = Some(
                self.memory
                    .alloc_samples(MemTag::AfeOutputBuffer, MONO_FRAME_SAMPLES)?,
            );
        }
        match self.buffer.as_mut() {
            Some(buf) => buf.samples_mut(),
            None => Err(AfeError::Generic("output buffer missing".into())),
        }
    }
}

pub(crate) struct FrameProcessor {
    ctx: Arc<AfeContext>,
    output_cb: OutputCallback,
    out_buf: Box<dyn OutputBufferProvider>,
    taps: Option<DebugTaps>,
    last_push_failures: u64,
}

impl FrameProcessor {
    pub fn new(
        ctx: Arc<AfeContext>,
        output_cb: OutputCallback,
        out_buf: Box<dyn OutputBufferProvider>,
        taps: Option<DebugTaps>,
    ) -> Self {
        Self {
            ctx,
            output_cb,
            out_buf,
            taps,
            last_push_failures: 0,
        }
    }

    pub fn process(&mut self, frame: &FrameDescriptor) -> AfeResult<()> {
        let ctx = self.ctx.clone();

        let failures = ctx.stats.push_failures();
        if failures != self.last_push_failures {
            log::info!(
                "Queue depth {} after {} push failure(s)",
                ctx.queue_depth(),
                failures
            );
            self.last_push_failures = failures;
        }

        frame.verify()?;

        let output = self.out_buf.output_buffer(&ctx).map_err(|e| {
            log::error!("Failed to get output buffer: {}", e);
            AfeError::Generic("failed to get output buffer".into())
        })?;
        let Some(output) = output.get_mut(..MONO_FRAME_SAMPLES) else {
            return Err(AfeError::Generic("output buffer shorter than a frame".into()));
        };

        let input = frame.input();
        let input1 = &input[..MONO_FRAME_SAMPLES];
        let input2 = (ctx.num_channels() == 2)
            .then(|| &input[MONO_FRAME_SAMPLES..2 * MONO_FRAME_SAMPLES]);
        let aec_ref = frame.aec_ref().map(|r| &r[..MONO_FRAME_SAMPLES]);

        let started = Instant::now();
        let result = {
            let mut guard = ctx.pipeline.lock();
            let Some(pipeline) = guard.as_mut() else {
                return Err(AfeError::Generic("pipeline already released".into()));
            };
            let routing = pipeline.enhancer.debug_routing();
            if let Some(taps) = self.taps.as_mut() {
                taps.fill_inputs(&routing, input1, input2, aec_ref)?;
            }

            let result = if pipeline.calibrator.is_active() {
                pipeline.calibrator.process(aec_ref, input1, output)
            } else {
                pipeline.enhancer.process(input1, input2, aec_ref, output)
            };

            if let Some(taps) = self.taps.as_mut() {
                taps.fill_outputs(&routing, output, &pipeline.enhancer)?;
            }
            result
        };
        ctx.stats.frame_processed(started.elapsed());

        let debug = match self.taps.as_ref() {
            Some(taps) => taps.views()?,
            None => [None; DEBUG_CHANNELS],
        };
        let info = AfeBufferInfo {
            input,
            aec_ref,
            output,
            debug,
        };
        if let Err(e) = (self.output_cb)(&ctx, &info) {
            log::error!("AFE output callback returned error: {}", e);
        }

        result.map_err(|e| {
            log::error!("Failed to perform speech enhancement on input data: {}", e);
            AfeError::SpeechEnhancement
        })
    }
}

pub(crate) struct ProcessingTask {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    waker: FrameQueue,
}

impl ProcessingTask {
    pub fn start(
        processor: FrameProcessor,
        rx: FrameReceiver,
        waker: FrameQueue,
    ) -> AfeResult<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let handle = {
            let running = running.clone();
            thread::Builder::new()
                .name("afe-task".into())
                .spawn(move || processing_loop(processor, rx, &running))
                .map_err(|e| {
                    AfeError::SystemModule(format!("failed to spawn processing task: {}", e))
                })?
        };
        log::info!("Audio processing task started");
        Ok(Self {
            running,
            handle: Some(handle),
            waker,
        })
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.waker.wake();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Audio processing task panicked");
            }
            log::info!("Audio processing task stopped");
        }
    }
}

impl Drop for ProcessingTask {
    fn drop(&mut self) {
        self.stop();
    }
}

fn processing_loop(mut processor: FrameProcessor, mut rx: FrameReceiver, running: &AtomicBool) {
    log::debug!("Running audio processing task routine");
    while running.load(Ordering::SeqCst) {
        match rx.pop() {
            Some(QueueItem::Frame(frame)) => {
                if let Err(e) = processor.process(&frame) {
                    log::warn!("Frame processing failed: {}", e);
                }
            }
            Some(QueueItem::Wake) => {}
            None => break,
        }
    }
    log::debug!("Exiting from audio processing task routine");
}
