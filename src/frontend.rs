//! Front-end facade: lifecycle, feeding and the shared instance context.
//!
//! At most one front end is live per process. [`AudioFrontEnd::create`]
//! claims the slot, builds every part in order and releases whatever was
//! already built if a later step fails.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::bulk_delay::{
    BULK_DELAY_ERROR, BulkDelayCalibrator, CalibrationStatus, CompletionSignal,
    default_estimator_factory,
};
use crate::config::{AfeConfig, Config};
use crate::debug::DebugTaps;
use crate::enhancer::{
    ComponentSet, EnhancerControl, EngineSettings, PassthroughEngine, SpeechEnhancer,
};
use crate::error::{AfeError, AfeResult};
use crate::memory::{AfeBuffer, MemTag, MemoryManager};
use crate::processing::{
    FrameProcessor, InternalOutputBuffer, OutputBufferProvider, Pipeline, ProcessingTask,
};
use crate::queue::{FrameDescriptor, FrameQueue, frame_queue};
use crate::stats::{AfeStats, StatsSnapshot};
use crate::tuner::TunerTask;
use crate::{MAX_INPUT_CHANNELS, MONO_FRAME_SAMPLES, SAMPLE_RATE_HZ};

/// Id of the live instance, 0 when none.
static LIVE_INSTANCE: AtomicU64 = AtomicU64::new(0);
static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

fn is_live(id: u64) -> bool {
    id != 0 && LIVE_INSTANCE.load(Ordering::Acquire) == id
}

fn release_instance(id: u64) {
    let _ = LIVE_INSTANCE.compare_exchange(id, 0, Ordering::AcqRel, Ordering::Acquire);
}

/// Token naming one front-end instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AfeHandle(u64);

pub trait LicenseGate: Send + Sync {
    fn is_expired(&self) -> bool;
}

/// Never expires.
pub struct PerpetualLicense;

impl LicenseGate for PerpetualLicense {
    fn is_expired(&self) -> bool {
        false
    }
}

/// Per-instance state shared with the worker threads and callbacks.
pub struct AfeContext {
    id: u64,
    num_channels: usize,
    gate: ComponentSet,
    queue: FrameQueue,
    pub(crate) stats: AfeStats,
    pub(crate) pipeline: Mutex<Option<Pipeline>>,
    calibration: Arc<CompletionSignal>,
    calibration_timeout: Duration,
    license: Arc<dyn LicenseGate>,
    memory: MemoryManager,
    board: Config,
    region: Mutex<Option<AfeBuffer>>,
}

impl AfeContext {
    pub fn handle(&self) -> AfeHandle {
        AfeHandle(self.id)
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn board_config(&self) -> &Config {
        &self.board
    }

    pub fn calibration_timeout(&self) -> Duration {
        self.calibration_timeout
    }

    pub(crate) fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    /// Gated, locking access to the enhancer.
    pub fn enhancer(&self) -> EnhancerControl<'_> {
        EnhancerControl::new(self.gate, &self.pipeline)
    }

    /// Feeds one frame. Blocks while the queue is full, so it must not be
    /// called from the output callback or from inside an async runtime.
    pub fn feed(&self, input: Arc<[i16]>, aec_ref: Option<Arc<[i16]>>) -> AfeResult<()> {
        self.feed_frame(input, aec_ref, false)
    }

    /// Feeds one frame without blocking or logging.
    pub fn feed_from_isr(&self, input: Arc<[i16]>, aec_ref: Option<Arc<[i16]>>) -> AfeResult<()> {
        self.feed_frame(input, aec_ref, true)
    }

    fn feed_frame(
        &self,
        input: Arc<[i16]>,
        aec_ref: Option<Arc<[i16]>>,
        from_isr: bool,
    ) -> AfeResult<()> {
        if input.len() != MONO_FRAME_SAMPLES * self.num_channels {
            if !from_isr {
                log::error!(
                    "Frame has {} samples, expected {}",
                    input.len(),
                    MONO_FRAME_SAMPLES * self.num_channels
                );
            }
            return Err(AfeError::BadArg("input frame has the wrong length"));
        }
        if aec_ref.as_ref().is_some_and(|r| r.len() < MONO_FRAME_SAMPLES) {
            return Err(AfeError::BadArg("echo reference shorter than a frame"));
        }
        if !is_live(self.id) {
            if !from_isr {
                log::error!("Feed on an instance that is not live");
            }
            return Err(AfeError::BadArg("handle is not the live instance"));
        }
        if self.license.is_expired() {
            if !from_isr {
                log::error!("License expired, feeding disabled");
            }
            return Err(AfeError::FunctionalityRestricted);
        }

        let frame = FrameDescriptor::new(input, aec_ref);
        self.stats.frame_fed();
        let pushed = if from_isr {
            self.queue.push_from_isr(frame)
        } else {
            self.queue.push(frame)
        };
        pushed.inspect_err(|e| {
            self.stats.push_failed();
            if !from_isr {
                log::error!("Push to audio processing queue failed: {}", e);
            }
        })
    }

    fn with_pipeline<T>(&self, f: impl FnOnce(&mut Pipeline) -> AfeResult<T>) -> AfeResult<T> {
        let mut guard = self.pipeline.lock();
        let pipeline = guard
            .as_mut()
            .ok_or(AfeError::BadArg("front end has been deleted"))?;
        f(pipeline)
    }

    /// Arms bulk-delay calibration. Returns the reference signal the
    /// application must play while it runs.
    pub fn bd_calc_init(&self) -> AfeResult<Vec<i16>> {
        if !is_live(self.id) {
            return Err(AfeError::BadArg("handle is not the live instance"));
        }
        self.with_pipeline(|p| p.calibrator.init())
    }

    /// Waits for the armed session to finish. Returns the delay in ms, or
    /// [`BULK_DELAY_ERROR`] on timeout, failure or when nothing is armed.
    pub fn bd_calc_wait_for_complete(&self, timeout: Duration) -> i32 {
        match self.calibration.wait(timeout) {
            Some(delay) => delay,
            None => self
                .with_pipeline(|p| Ok(p.calibrator.expire_unless_completed()))
                .unwrap_or(BULK_DELAY_ERROR),
        }
    }

    pub fn bd_calc_deinit(&self) -> AfeResult<()> {
        self.with_pipeline(|p| {
            p.calibrator.deinit();
            Ok(())
        })
    }

    pub fn calibration_status(&self) -> AfeResult<CalibrationStatus> {
        self.with_pipeline(|p| Ok(p.calibrator.status()))
    }

    /// Drops the pipeline and the context region. Worker threads must be
    /// stopped first.
    fn release(&self) {
        let pipeline = self.pipeline.lock().take();
        if let Some(mut pipeline) = pipeline {
            pipeline.calibrator.deinit();
        }
        drop(self.region.lock().take());
    }
}

/// Cloneable feeding handle for capture threads.
#[derive(Clone)]
pub struct Feeder {
    ctx: Arc<AfeContext>,
}

impl Feeder {
    pub fn handle(&self) -> AfeHandle {
        self.ctx.handle()
    }

    pub fn feed(&self, input: Arc<[i16]>, aec_ref: Option<Arc<[i16]>>) -> AfeResult<()> {
        self.ctx.feed(input, aec_ref)
    }

    pub fn feed_from_isr(&self, input: Arc<[i16]>, aec_ref: Option<Arc<[i16]>>) -> AfeResult<()> {
        self.ctx.feed_from_isr(input, aec_ref)
    }
}

pub struct AudioFrontEnd {
    ctx: Arc<AfeContext>,
    processing: Option<ProcessingTask>,
    tuner: Option<TunerTask>,
    deleted: bool,
}

impl AudioFrontEnd {
    /// Creates the process-wide front end.
    pub fn create(config: AfeConfig) -> AfeResult<Self> {
        if LIVE_INSTANCE.load(Ordering::Acquire) != 0 {
            log::error!("Audio front end is already initialized");
            return Err(AfeError::AlreadyInitialized);
        }
        validate(&config)?;

        let id = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        if LIVE_INSTANCE
            .compare_exchange(0, id, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(AfeError::AlreadyInitialized);
        }

        match Self::build(id, config) {
            Ok(afe) => {
                log::info!("Audio front end created");
                Ok(afe)
            }
            Err(e) => {
                log::error!("Audio front end create failed: {}", e);
                release_instance(id);
                Err(e)
            }
        }
    }

    fn build(id: u64, config: AfeConfig) -> AfeResult<Self> {
        let AfeConfig {
            filter_settings,
            mw_settings,
            output_callback,
            output_buffer,
            alloc_memory,
            free_memory,
            tuner,
            license,
            engine,
            delay_estimator,
            num_channels,
            components,
            queue_capacity,
            debug_routing,
            tuner_poll_interval,
            calibration_timeout,
            board,
        } = config;
        let (Some(filter_settings), Some(output_callback)) = (filter_settings, output_callback)
        else {
            return Err(AfeError::BadArg("filter settings and output callback are required"));
        };

        let memory = MemoryManager::from_callbacks(alloc_memory, free_memory)?;
        log::debug!(
            "Memory regions from {} provider",
            if memory.is_external() { "application" } else { "heap" }
        );
        let region = memory.alloc(MemTag::AfeContext, std::mem::size_of::<AfeContext>())?;

        let (queue, rx) = frame_queue(queue_capacity)?;
        let taps = if cfg!(feature = "tuning") {
            Some(DebugTaps::alloc(&memory)?)
        } else {
            None
        };

        let gate = ComponentSet::compiled().intersect(components);
        let settings = EngineSettings {
            filter_settings,
            mw_settings,
            sample_rate: SAMPLE_RATE_HZ,
            frame_size: MONO_FRAME_SAMPLES,
            num_mics: num_channels,
            components: gate,
        };
        let engine = engine.unwrap_or_else(PassthroughEngine::factory);
        let enhancer = SpeechEnhancer::init(engine(), &settings, &memory, debug_routing)?;
        let calibrator = BulkDelayCalibrator::new(
            delay_estimator.unwrap_or_else(default_estimator_factory),
            MONO_FRAME_SAMPLES,
            SAMPLE_RATE_HZ,
        );
        let calibration = calibrator.signal();

        let ctx = Arc::new(AfeContext {
            id,
            num_channels,
            gate,
            queue: queue.clone(),
            stats: AfeStats::default(),
            pipeline: Mutex::new(Some(Pipeline {
                enhancer,
                calibrator,
            })),
            calibration,
            calibration_timeout,
            license: license.unwrap_or_else(|| Arc::new(PerpetualLicense)),
            memory: memory.clone(),
            board,
            region: Mutex::new(Some(region)),
        });

        let out_buf: Box<dyn OutputBufferProvider> = match output_buffer {
            Some(provider) => provider,
            None => Box::new(InternalOutputBuffer::new(memory)),
        };
        let processor = FrameProcessor::new(ctx.clone(), output_callback, out_buf, taps);

        let mut afe = Self {
            ctx: ctx.clone(),
            processing: None,
            tuner: None,
            deleted: false,
        };
        afe.processing = Some(ProcessingTask::start(processor, rx, queue)?);
        if let Some(callbacks) = tuner {
            afe.tuner = Some(TunerTask::start(ctx, callbacks, tuner_poll_interval)?);
        }
        Ok(afe)
    }

    pub fn handle(&self) -> AfeHandle {
        self.ctx.handle()
    }

    pub fn context(&self) -> &Arc<AfeContext> {
        &self.ctx
    }

    pub fn feeder(&self) -> Feeder {
        Feeder {
            ctx: self.ctx.clone(),
        }
    }

    pub fn feed(&self, input: Arc<[i16]>, aec_ref: Option<Arc<[i16]>>) -> AfeResult<()> {
        self.ctx.feed(input, aec_ref)
    }

    pub fn feed_from_isr(&self, input: Arc<[i16]>, aec_ref: Option<Arc<[i16]>>) -> AfeResult<()> {
        self.ctx.feed_from_isr(input, aec_ref)
    }

    /// Stops both threads and frees every region. A handle that does not
    /// name this live instance is rejected and nothing is torn down.
    pub fn delete(&mut self, handle: AfeHandle) -> AfeResult<()> {
        if self.deleted || handle != self.ctx.handle() || !is_live(handle.0) {
            log::error!("Invalid handle passed to delete");
            return Err(AfeError::BadArg("handle is not the live instance"));
        }
        self.teardown();
        log::info!("Audio front end deleted");
        Ok(())
    }

    fn teardown(&mut self) {
        if self.deleted {
            return;
        }
        self.deleted = true;
        if let Some(mut task) = self.processing.take() {
            task.stop();
        }
        // 唤醒可能正在等待校准结果的 tuner 线程
        let _ = self.ctx.bd_calc_deinit();
        if let Some(mut task) = self.tuner.take() {
            task.stop();
        }
        self.ctx.release();
        release_instance(self.ctx.id);
    }
}

impl Drop for AudioFrontEnd {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn validate(config: &AfeConfig) -> AfeResult<()> {
    if config.output_callback.is_none() {
        return Err(AfeError::BadArg("output callback is required"));
    }
    if config.filter_settings.as_ref().is_none_or(|f| f.is_empty()) {
        return Err(AfeError::BadArg("filter settings are required"));
    }
    if config.alloc_memory.is_some() != config.free_memory.is_some() {
        return Err(AfeError::BadArg(
            "alloc and free memory callbacks must be supplied together",
        ));
    }
    if !(1..=MAX_INPUT_CHANNELS).contains(&config.num_channels) {
        return Err(AfeError::BadArg("input channels must be 1 or 2"));
    }
    if config.queue_capacity == 0 {
        return Err(AfeError::BadArg("queue capacity must be at least one frame"));
    }
    Ok(())
}
