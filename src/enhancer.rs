//! Speech-enhancement adapter.
//!
//! The DSP itself sits behind [`SpeechEngine`]. [`SpeechEnhancer`] owns one
//! engine instance together with the regions it asked for, the monitor output
//! buffer and the sound meter, and maps engine failures onto [`AfeError`].
//! Runtime access from the tuner goes through [`EnhancerControl`], which
//! checks the build-time component gate before it takes the pipeline lock.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::debug::{DebugRouting, DebugSignal, OutLocator, plan_debug_output};
use crate::error::{AfeError, AfeResult};
use crate::memory::{AfeBuffer, MemTag, MemoryManager};
use crate::processing::Pipeline;
use crate::{AUDIO_METER_MAX, MONITOR_OUT_SAMPLES, MONO_FRAME_SAMPLES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    /// High-pass filter
    Hpf,
    /// Acoustic echo canceller
    Aec,
    /// Beam former, also called the inference canceller on the wire
    Bf,
    /// De-reverberation
    Dr,
    /// Noise suppressor
    Ns,
    /// Echo suppressor
    Es,
}

impl Component {
    pub const ALL: [Component; 6] = [
        Component::Hpf,
        Component::Aec,
        Component::Bf,
        Component::Dr,
        Component::Ns,
        Component::Es,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Component::Hpf => "hpf",
            Component::Aec => "aec",
            Component::Bf => "bf",
            Component::Dr => "dr",
            Component::Ns => "ns",
            Component::Es => "es",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }

    fn bit(self) -> u8 {
        1 << self as u8
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A set of components, used for the build-time gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ComponentSet(u8);

impl ComponentSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        Component::ALL
            .into_iter()
            .fold(Self::empty(), |set, c| set.with(c))
    }

    /// Components compiled into this build through cargo features.
    pub fn compiled() -> Self {
        let mut set = Self::empty();
        if cfg!(feature = "hpf") {
            set = set.with(Component::Hpf);
        }
        if cfg!(feature = "aec") {
            set = set.with(Component::Aec);
        }
        if cfg!(feature = "bf") {
            set = set.with(Component::Bf);
        }
        if cfg!(feature = "dr") {
            set = set.with(Component::Dr);
        }
        if cfg!(feature = "ns") {
            set = set.with(Component::Ns);
        }
        if cfg!(feature = "es") {
            set = set.with(Component::Es);
        }
        set
    }

    /// Parses a comma separated list of component names. Unknown names are
    /// skipped with a warning.
    pub fn parse_list(list: &str) -> Self {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .fold(Self::empty(), |set, name| match Component::from_name(name) {
                Some(c) => set.with(c),
                None => {
                    log::warn!("Ignoring unknown component '{}'", name);
                    set
                }
            })
    }

    #[must_use]
    pub fn with(self, c: Component) -> Self {
        Self(self.0 | c.bit())
    }

    #[must_use]
    pub fn without(self, c: Component) -> Self {
        Self(self.0 & !c.bit())
    }

    #[must_use]
    pub fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub fn contains(self, c: Component) -> bool {
        self.0 & c.bit() != 0
    }

    pub fn iter(self) -> impl Iterator<Item = Component> {
        Component::ALL.into_iter().filter(move |c| self.contains(*c))
    }
}

impl fmt::Display for ComponentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(Component::name).collect();
        f.write_str(&names.join(","))
    }
}

/// Aggressiveness of the beam former and echo suppressor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Low = 0,
    Medium = 1,
    High = 2,
}

impl Level {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Level::Low),
            "medium" => Some(Level::Medium),
            "high" => Some(Level::High),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Level::Low => "low",
            Level::Medium => "medium",
            Level::High => "high",
        }
    }

    pub fn parse_value(value: i32) -> Option<Self> {
        match value {
            0 => Some(Level::Low),
            1 => Some(Level::Medium),
            2 => Some(Level::High),
            _ => None,
        }
    }

    /// Engine value to label. Anything above medium reads as high.
    pub fn from_value(value: i32) -> Self {
        match value {
            0 => Level::Low,
            1 => Level::Medium,
            _ => Level::High,
        }
    }
}

/// Memory the engine asks for during init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineMemId {
    Handle,
    Scratch,
    Persistent,
    BfPersistent,
    NsPersistent,
    EsPersistent,
    GdePersistent,
    Other,
}

impl EngineMemId {
    pub fn mem_tag(self) -> MemTag {
        match self {
            EngineMemId::Handle => MemTag::AfeContext,
            EngineMemId::Persistent => MemTag::AlgorithmPersistentMemory,
            EngineMemId::Scratch => MemTag::AlgorithmScratchMemory,
            EngineMemId::BfPersistent => MemTag::AlgorithmBfMemory,
            EngineMemId::NsPersistent => MemTag::AlgorithmNsMemory,
            EngineMemId::EsPersistent => MemTag::AlgorithmEsMemory,
            EngineMemId::GdePersistent => MemTag::GdePersistentMem,
            EngineMemId::Other => MemTag::GenericMemory,
        }
    }
}

pub struct EngineRegion {
    pub id: EngineMemId,
    pub buffer: AfeBuffer,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("invalid parameters")]
    InvalidParams,
    #[error("{0}")]
    Failed(String),
}

/// Parameter block of one component, as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ComponentParams {
    Hpf {
        cutoff_hz: i32,
    },
    Aec {
        bulk_delay_ms: i32,
        tail_len_ms: i32,
    },
    Bf {
        aggressiveness: i32,
        mic_distance_mm: i32,
        num_beams: i32,
        angle_start: i32,
        angle_stop: i32,
    },
    Es {
        aggressiveness: i32,
    },
    Ns {
        gain_db: i32,
    },
}

impl ComponentParams {
    /// The value `set_config` writes and `get` reads back.
    pub fn primary(&self) -> i32 {
        match *self {
            ComponentParams::Hpf { cutoff_hz } => cutoff_hz,
            ComponentParams::Aec { bulk_delay_ms, .. } => bulk_delay_ms,
            ComponentParams::Bf { aggressiveness, .. } => aggressiveness,
            ComponentParams::Es { aggressiveness } => aggressiveness,
            ComponentParams::Ns { gain_db } => gain_db,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub filter_settings: Vec<i32>,
    pub mw_settings: Vec<u8>,
    pub sample_rate: u32,
    pub frame_size: usize,
    pub num_mics: usize,
    pub components: ComponentSet,
}

/// Buffers for one `process` call.
pub struct EngineIo<'a> {
    pub input1: &'a [i16],
    pub input2: Option<&'a [i16]>,
    pub aec_ref: Option<&'a [i16]>,
    pub output: &'a mut [i16],
    /// One frame per enabled debug output, in the order they were enabled.
    pub monitor: &'a mut [i16],
    pub meter: &'a mut [i16; AUDIO_METER_MAX],
}

/// The speech-enhancement engine seam.
///
/// Engines lay out their debug outputs in the order `configure_debug_output`
/// enabled them: the echo canceller takes one frame per microphone, the beam
/// former and de-reverberation one frame each.
pub trait SpeechEngine: Send {
    fn memory_requirements(&self, settings: &EngineSettings) -> Vec<(EngineMemId, usize)>;
    fn init(
        &mut self,
        settings: &EngineSettings,
        regions: Vec<EngineRegion>,
    ) -> Result<(), EngineError>;
    fn process(&mut self, io: EngineIo<'_>) -> Result<(), EngineError>;
    /// Hands the regions back. Called once before the engine is dropped.
    fn deinit(&mut self) -> Vec<EngineRegion>;
    fn set_component_enabled(&mut self, c: Component, enable: bool) -> Result<(), EngineError>;
    fn component_enabled(&self, c: Component) -> Result<bool, EngineError>;
    fn set_config(&mut self, c: Component, value: i32) -> Result<(), EngineError>;
    fn params(&self, c: Component) -> Result<ComponentParams, EngineError>;
    /// `None` with `enable == false` disables every debug output.
    fn configure_debug_output(
        &mut self,
        c: Option<Component>,
        enable: bool,
    ) -> Result<(), EngineError>;
}

pub type EngineFactory = Arc<dyn Fn() -> Box<dyn SpeechEngine> + Send + Sync>;

/// Reference engine: forwards the first microphone unchanged while keeping
/// full parameter state, so the whole control surface can be exercised
/// without a DSP library.
pub struct PassthroughEngine {
    available: ComponentSet,
    enabled: ComponentSet,
    num_mics: usize,
    hpf_cutoff_hz: i32,
    aec_bulk_delay_ms: i32,
    aec_tail_len_ms: i32,
    bf_level: i32,
    bf_mic_distance_mm: i32,
    bf_num_beams: i32,
    bf_angles: (i32, i32),
    es_level: i32,
    ns_gain_db: i32,
    debug_outputs: Vec<Component>,
    regions: Vec<EngineRegion>,
}

impl PassthroughEngine {
    const PERSISTENT_BYTES: usize = 1024;
    const SCRATCH_BYTES: usize = 640;
    const COMPONENT_BYTES: usize = 256;
    const MAX_BULK_DELAY_MS: i32 = 500;
    const MAX_NS_GAIN_DB: i32 = 40;

    pub fn new() -> Self {
        Self {
            available: ComponentSet::empty(),
            enabled: ComponentSet::empty(),
            num_mics: 1,
            hpf_cutoff_hz: 100,
            aec_bulk_delay_ms: 0,
            aec_tail_len_ms: 128,
            bf_level: Level::Medium as i32,
            bf_mic_distance_mm: 40,
            bf_num_beams: 8,
            bf_angles: (0, 360),
            es_level: Level::Medium as i32,
            ns_gain_db: 12,
            debug_outputs: Vec::new(),
            regions: Vec::new(),
        }
    }

    pub fn factory() -> EngineFactory {
        Arc::new(|| Box::new(PassthroughEngine::new()))
    }

    fn check_available(&self, c: Component) -> Result<(), EngineError> {
        if self.available.contains(c) {
            Ok(())
        } else {
            Err(EngineError::InvalidParams)
        }
    }

    fn peak(samples: &[i16]) -> i16 {
        samples
            .iter()
            .map(|s| s.unsigned_abs().min(i16::MAX as u16))
            .max()
            .unwrap_or(0) as i16
    }
}

impl Default for PassthroughEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeechEngine for PassthroughEngine {
    fn memory_requirements(&self, settings: &EngineSettings) -> Vec<(EngineMemId, usize)> {
        let mut reqs = vec![
            (EngineMemId::Persistent, Self::PERSISTENT_BYTES),
            (EngineMemId::Scratch, Self::SCRATCH_BYTES),
        ];
        if settings.components.contains(Component::Bf) {
            reqs.push((EngineMemId::BfPersistent, Self::COMPONENT_BYTES));
        }
        if settings.components.contains(Component::Ns) {
            reqs.push((EngineMemId::NsPersistent, Self::COMPONENT_BYTES));
        }
        if settings.components.contains(Component::Es) {
            reqs.push((EngineMemId::EsPersistent, Self::COMPONENT_BYTES));
        }
        reqs
    }

    fn init(
        &mut self,
        settings: &EngineSettings,
        regions: Vec<EngineRegion>,
    ) -> Result<(), EngineError> {
        if settings.filter_settings.is_empty() {
            return Err(EngineError::Failed("empty filter settings".into()));
        }
        if settings.frame_size != MONO_FRAME_SAMPLES || !(1..=2).contains(&settings.num_mics) {
            return Err(EngineError::InvalidParams);
        }
        self.available = settings.components;
        self.enabled = settings.components;
        self.num_mics = settings.num_mics;
        self.regions = regions;
        Ok(())
    }

    fn process(&mut self, io: EngineIo<'_>) -> Result<(), EngineError> {
        let n = MONO_FRAME_SAMPLES;
        if io.input1.len() < n || io.output.len() < n {
            return Err(EngineError::InvalidParams);
        }
        let input1 = &io.input1[..n];
        io.output[..n].copy_from_slice(input1);

        let mut slots = io.monitor.chunks_exact_mut(n);
        for c in &self.debug_outputs {
            match c {
                Component::Aec => {
                    if let Some(slot) = slots.next() {
                        slot.copy_from_slice(input1);
                    }
                    if self.num_mics == 2 {
                        if let Some(slot) = slots.next() {
                            match io.input2 {
                                Some(input2) => slot.copy_from_slice(&input2[..n]),
                                None => slot.fill(0),
                            }
                        }
                    }
                }
                Component::Bf => {
                    if let Some(slot) = slots.next() {
                        let input2 = io.input2.unwrap_or(input1);
                        for ((o, a), b) in slot.iter_mut().zip(input1).zip(input2) {
                            *o = ((*a as i32 + *b as i32) / 2) as i16;
                        }
                    }
                }
                _ => {
                    if let Some(slot) = slots.next() {
                        slot.copy_from_slice(&io.output[..n]);
                    }
                }
            }
        }

        io.meter.fill(0);
        io.meter[0] = Self::peak(input1);
        match io.input2 {
            Some(input2) => {
                io.meter[1] = Self::peak(&input2[..n]);
                io.meter[2] = Self::peak(&io.output[..n]);
            }
            None => io.meter[1] = Self::peak(&io.output[..n]),
        }
        Ok(())
    }

    fn deinit(&mut self) -> Vec<EngineRegion> {
        self.debug_outputs.clear();
        std::mem::take(&mut self.regions)
    }

    fn set_component_enabled(&mut self, c: Component, enable: bool) -> Result<(), EngineError> {
        self.check_available(c)?;
        self.enabled = if enable {
            self.enabled.with(c)
        } else {
            self.enabled.without(c)
        };
        Ok(())
    }

    fn component_enabled(&self, c: Component) -> Result<bool, EngineError> {
        self.check_available(c)?;
        Ok(self.enabled.contains(c))
    }

    fn set_config(&mut self, c: Component, value: i32) -> Result<(), EngineError> {
        self.check_available(c)?;
        let field = match c {
            Component::Hpf if value > 0 => &mut self.hpf_cutoff_hz,
            Component::Aec if (0..=Self::MAX_BULK_DELAY_MS).contains(&value) => {
                &mut self.aec_bulk_delay_ms
            }
            Component::Bf if Level::parse_value(value).is_some() => &mut self.bf_level,
            Component::Es if Level::parse_value(value).is_some() => &mut self.es_level,
            Component::Ns if (0..=Self::MAX_NS_GAIN_DB).contains(&value) => &mut self.ns_gain_db,
            _ => return Err(EngineError::InvalidParams),
        };
        *field = value;
        Ok(())
    }

    fn params(&self, c: Component) -> Result<ComponentParams, EngineError> {
        self.check_available(c)?;
        match c {
            Component::Hpf => Ok(ComponentParams::Hpf {
                cutoff_hz: self.hpf_cutoff_hz,
            }),
            Component::Aec => Ok(ComponentParams::Aec {
                bulk_delay_ms: self.aec_bulk_delay_ms,
                tail_len_ms: self.aec_tail_len_ms,
            }),
            Component::Bf => Ok(ComponentParams::Bf {
                aggressiveness: self.bf_level,
                mic_distance_mm: self.bf_mic_distance_mm,
                num_beams: self.bf_num_beams,
                angle_start: self.bf_angles.0,
                angle_stop: self.bf_angles.1,
            }),
            Component::Es => Ok(ComponentParams::Es {
                aggressiveness: self.es_level,
            }),
            Component::Ns => Ok(ComponentParams::Ns {
                gain_db: self.ns_gain_db,
            }),
            Component::Dr => Err(EngineError::InvalidParams),
        }
    }

    fn configure_debug_output(
        &mut self,
        c: Option<Component>,
        enable: bool,
    ) -> Result<(), EngineError> {
        match (c, enable) {
            (None, false) => self.debug_outputs.clear(),
            (Some(c), true) => {
                self.check_available(c)?;
                if !self.debug_outputs.contains(&c) {
                    self.debug_outputs.push(c);
                }
            }
            (Some(c), false) => self.debug_outputs.retain(|d| *d != c),
            (None, true) => return Err(EngineError::InvalidParams),
        }
        Ok(())
    }
}

/// Adapter around one engine instance.
pub struct SpeechEnhancer {
    engine: Box<dyn SpeechEngine>,
    gate: ComponentSet,
    num_mics: usize,
    monitor: AfeBuffer,
    meter: [i16; AUDIO_METER_MAX],
    routing: DebugRouting,
    locator: OutLocator,
    released: bool,
}

impl SpeechEnhancer {
    /// Allocates every region the engine asks for, initialises it and applies
    /// the initial debug routing.
    pub fn init(
        mut engine: Box<dyn SpeechEngine>,
        settings: &EngineSettings,
        memory: &MemoryManager,
        routing: DebugRouting,
    ) -> AfeResult<Self> {
        let mut regions = Vec::new();
        for (id, size) in engine.memory_requirements(settings) {
            let buffer = memory.alloc(id.mem_tag(), size).inspect_err(|e| {
                log::error!("Speech enhancement memory {:?} allocation failed: {}", id, e);
            })?;
            regions.push(EngineRegion { id, buffer });
        }
        log::debug!(
            "Speech enhancement regions allocated: {:?}",
            regions.iter().map(|r| (r.id, r.buffer.len())).collect::<Vec<_>>()
        );

        if let Err(e) = engine.init(settings, regions) {
            log::error!("Speech enhancement init failed: {}", e);
            drop(engine.deinit());
            return Err(AfeError::SystemModule(format!(
                "speech enhancement init failed: {}",
                e
            )));
        }

        let monitor = match memory.alloc_samples(MemTag::AfeDbgOutBuffer, MONITOR_OUT_SAMPLES) {
            Ok(m) => m,
            Err(e) => {
                drop(engine.deinit());
                return Err(e);
            }
        };

        let mut enhancer = Self {
            engine,
            gate: settings.components,
            num_mics: settings.num_mics,
            monitor,
            meter: [0; AUDIO_METER_MAX],
            routing,
            locator: OutLocator::default(),
            released: false,
        };
        enhancer.update_debug_routing(routing)?;
        log::info!(
            "Speech enhancement ready: {} mic(s), components [{}]",
            enhancer.num_mics,
            enhancer.gate
        );
        Ok(enhancer)
    }

    pub fn gate(&self) -> ComponentSet {
        self.gate
    }

    pub fn num_mics(&self) -> usize {
        self.num_mics
    }

    pub fn process(
        &mut self,
        input1: &[i16],
        input2: Option<&[i16]>,
        aec_ref: Option<&[i16]>,
        output: &mut [i16],
    ) -> AfeResult<()> {
        let monitor = self.monitor.samples_mut()?;
        self.engine
            .process(EngineIo {
                input1,
                input2,
                aec_ref,
                output,
                monitor,
                meter: &mut self.meter,
            })
            .map_err(|e| AfeError::SystemModule(format!("speech enhancement process: {}", e)))
    }

    pub fn set_component_enabled(&mut self, c: Component, enable: bool) -> AfeResult<()> {
        self.engine
            .set_component_enabled(c, enable)
            .map_err(tuner_error)
    }

    pub fn component_enabled(&self, c: Component) -> AfeResult<bool> {
        self.engine.component_enabled(c).map_err(tuner_error)
    }

    pub fn set_config(&mut self, c: Component, value: i32) -> AfeResult<()> {
        self.engine.set_config(c, value).map_err(tuner_error)
    }

    pub fn params(&self, c: Component) -> AfeResult<ComponentParams> {
        self.engine.params(c).map_err(|e| match e {
            EngineError::InvalidParams => AfeError::BadArg("component has no parameter block"),
            EngineError::Failed(msg) => AfeError::TunerGeneric(msg),
        })
    }

    pub fn sound_meter(&self) -> [i16; AUDIO_METER_MAX] {
        self.meter
    }

    pub fn debug_routing(&self) -> DebugRouting {
        self.routing
    }

    /// Re-plans which engine debug outputs feed which monitor slot.
    pub fn update_debug_routing(&mut self, routing: DebugRouting) -> AfeResult<()> {
        let (locator, outputs) = plan_debug_output(&routing, self.gate, self.num_mics);
        self.engine
            .configure_debug_output(None, false)
            .map_err(|e| AfeError::SystemModule(format!("debug output reset: {}", e)))?;
        for c in outputs {
            self.engine
                .configure_debug_output(Some(c), true)
                .map_err(|e| AfeError::SystemModule(format!("debug output {}: {}", c, e)))?;
        }
        self.routing = routing;
        self.locator = locator;
        Ok(())
    }

    /// Monitor frame for an output-type debug signal, if it is routed.
    pub fn monitor_slot(&self, signal: DebugSignal) -> Option<&[i16]> {
        let index = self.locator.slot(signal)?;
        let samples = self.monitor.samples().ok()?;
        samples.chunks_exact(MONO_FRAME_SAMPLES).nth(index)
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            drop(self.engine.deinit());
            log::debug!("Speech enhancement released");
        }
    }
}

impl Drop for SpeechEnhancer {
    fn drop(&mut self) {
        self.release();
    }
}

fn tuner_error(e: EngineError) -> AfeError {
    match e {
        EngineError::InvalidParams => AfeError::TunerInvalidCmdParams,
        EngineError::Failed(msg) => AfeError::TunerGeneric(msg),
    }
}

/// Locking accessor used by the tuner and the application.
///
/// Every call checks the build-time gate first, then takes the pipeline
/// lock so it never races the processing thread.
pub struct EnhancerControl<'a> {
    gate: ComponentSet,
    pipeline: &'a Mutex<Option<Pipeline>>,
}

impl<'a> EnhancerControl<'a> {
    pub(crate) fn new(gate: ComponentSet, pipeline: &'a Mutex<Option<Pipeline>>) -> Self {
        Self { gate, pipeline }
    }

    pub fn gate(&self) -> ComponentSet {
        self.gate
    }

    fn ensure_enabled(&self, c: Component) -> AfeResult<()> {
        if self.gate.contains(c) {
            Ok(())
        } else {
            Err(AfeError::TunerComponentNotEnabled(c))
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut SpeechEnhancer) -> AfeResult<T>) -> AfeResult<T> {
        let mut guard = self.pipeline.lock();
        let pipeline = guard
            .as_mut()
            .ok_or(AfeError::BadArg("front end has been deleted"))?;
        f(&mut pipeline.enhancer)
    }

    pub fn set_component_enabled(&self, c: Component, enable: bool) -> AfeResult<()> {
        self.ensure_enabled(c)?;
        self.with(|e| e.set_component_enabled(c, enable))
    }

    pub fn component_enabled(&self, c: Component) -> AfeResult<bool> {
        self.ensure_enabled(c)?;
        self.with(|e| e.component_enabled(c))
    }

    pub fn set_config(&self, c: Component, value: i32) -> AfeResult<()> {
        self.ensure_enabled(c)?;
        self.with(|e| e.set_config(c, value))
    }

    pub fn config_value(&self, c: Component) -> AfeResult<i32> {
        self.params(c).map(|p| p.primary())
    }

    pub fn params(&self, c: Component) -> AfeResult<ComponentParams> {
        self.ensure_enabled(c)?;
        self.with(|e| e.params(c))
    }

    pub fn sound_meter(&self) -> AfeResult<[i16; AUDIO_METER_MAX]> {
        self.with(|e| Ok(e.sound_meter()))
    }

    pub fn debug_routing(&self) -> AfeResult<DebugRouting> {
        self.with(|e| Ok(e.debug_routing()))
    }

    pub fn update_debug_routing(&self, routing: DebugRouting) -> AfeResult<()> {
        self.with(|e| e.update_debug_routing(routing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::tests::CountingProvider;

    fn settings(num_mics: usize, components: ComponentSet) -> EngineSettings {
        EngineSettings {
            filter_settings: vec![1, 2, 3],
            mw_settings: Vec::new(),
            sample_rate: crate::SAMPLE_RATE_HZ,
            frame_size: MONO_FRAME_SAMPLES,
            num_mics,
            components,
        }
    }

    fn enhancer(num_mics: usize, components: ComponentSet) -> SpeechEnhancer {
        SpeechEnhancer::init(
            Box::new(PassthroughEngine::new()),
            &settings(num_mics, components),
            &MemoryManager::heap(),
            DebugRouting::default(),
        )
        .unwrap()
    }

    #[test]
    fn component_list_parsing() {
        let set = ComponentSet::parse_list("hpf, aec,bogus,,ns");
        assert!(set.contains(Component::Hpf));
        assert!(set.contains(Component::Aec));
        assert!(set.contains(Component::Ns));
        assert!(!set.contains(Component::Dr));
        assert_eq!(set.to_string(), "hpf,aec,ns");
        assert_eq!(ComponentSet::all().without(Component::Bf).iter().count(), 5);
    }

    #[test]
    fn level_labels() {
        assert_eq!(Level::parse("medium"), Some(Level::Medium));
        assert_eq!(Level::parse("MEDIUM"), None);
        assert_eq!(Level::from_value(7).as_str(), "high");
        assert_eq!(Level::from_value(0).as_str(), "low");
    }

    #[test]
    fn passthrough_copies_first_mic_and_meters() {
        let mut e = enhancer(2, ComponentSet::all());
        let in1 = vec![100i16; MONO_FRAME_SAMPLES];
        let in2 = vec![-300i16; MONO_FRAME_SAMPLES];
        let mut out = vec![0i16; MONO_FRAME_SAMPLES];
        e.process(&in1, Some(&in2), None, &mut out).unwrap();
        assert_eq!(out, in1);
        assert_eq!(e.sound_meter(), [100, 300, 100]);
    }

    #[test]
    fn meter_saturates_on_min_sample() {
        let mut e = enhancer(1, ComponentSet::all());
        let in1 = vec![i16::MIN; MONO_FRAME_SAMPLES];
        let mut out = vec![0i16; MONO_FRAME_SAMPLES];
        e.process(&in1, None, None, &mut out).unwrap();
        assert_eq!(e.sound_meter()[0], i16::MAX);
    }

    #[test]
    fn routed_monitor_slots_follow_the_plan() {
        // default routing: input0, aec out1, bf, dr
        let mut e = enhancer(2, ComponentSet::all());
        let in1 = vec![10i16; MONO_FRAME_SAMPLES];
        let in2 = vec![30i16; MONO_FRAME_SAMPLES];
        let mut out = vec![0i16; MONO_FRAME_SAMPLES];
        e.process(&in1, Some(&in2), None, &mut out).unwrap();

        assert_eq!(e.monitor_slot(DebugSignal::SigA1).unwrap()[0], 30);
        assert_eq!(e.monitor_slot(DebugSignal::SigB).unwrap()[0], 20);
        assert_eq!(e.monitor_slot(DebugSignal::SigC).unwrap()[0], 10);
        assert!(e.monitor_slot(DebugSignal::SigA0).is_none());
    }

    #[test]
    fn engine_rejections_map_to_tuner_errors() {
        let mut e = enhancer(1, ComponentSet::all());
        assert_eq!(
            e.set_config(Component::Aec, 9999),
            Err(AfeError::TunerInvalidCmdParams)
        );
        e.set_config(Component::Aec, 40).unwrap();
        assert_eq!(e.params(Component::Aec).unwrap().primary(), 40);
        assert!(matches!(e.params(Component::Dr), Err(AfeError::BadArg(_))));
    }

    #[test]
    fn failed_init_returns_every_region() {
        let provider = Arc::new(CountingProvider::default());
        let memory = MemoryManager::with_provider(provider.clone());
        let mut s = settings(1, ComponentSet::all());
        s.filter_settings.clear();
        let err = SpeechEnhancer::init(
            Box::new(PassthroughEngine::new()),
            &s,
            &memory,
            DebugRouting::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, AfeError::SystemModule(_)));
        assert_eq!(provider.outstanding(), 0);
    }

    #[test]
    fn drop_releases_engine_and_monitor() {
        let provider = Arc::new(CountingProvider::default());
        let memory = MemoryManager::with_provider(provider.clone());
        let e = SpeechEnhancer::init(
            Box::new(PassthroughEngine::new()),
            &settings(2, ComponentSet::all()),
            &memory,
            DebugRouting::default(),
        )
        .unwrap();
        assert!(provider.outstanding() > 0);
        drop(e);
        assert_eq!(provider.outstanding(), 0);
    }
}
