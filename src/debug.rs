//! Debug taps.
//!
//! Four tap channels ride along with every processed frame so a tuning host
//! can listen to intermediate signals. Each channel is routed to one
//! [`DebugSignal`]. Input-type signals are copied before enhancement runs,
//! output-type signals after it, from the engine's monitor output.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::enhancer::{Component, ComponentSet, SpeechEnhancer};
use crate::error::{AfeError, AfeResult};
use crate::memory::{AfeBuffer, MemTag, MemoryManager};
use crate::{DEBUG_CHANNELS, MONO_FRAME_SAMPLES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DebugSignal {
    AecRef = 0,
    Input0 = 1,
    Input1 = 2,
    Output = 3,
    /// Echo canceller output, first mic
    SigA0 = 4,
    /// Echo canceller output, second mic
    SigA1 = 5,
    /// Beam former output
    SigB = 6,
    /// De-reverberation output
    SigC = 7,
}

impl DebugSignal {
    pub const COUNT: usize = 8;

    /// Signals available before enhancement runs.
    pub fn is_input(self) -> bool {
        matches!(
            self,
            DebugSignal::AecRef | DebugSignal::Input0 | DebugSignal::Input1
        )
    }
}

impl TryFrom<i32> for DebugSignal {
    type Error = AfeError;

    fn try_from(value: i32) -> AfeResult<Self> {
        Ok(match value {
            0 => DebugSignal::AecRef,
            1 => DebugSignal::Input0,
            2 => DebugSignal::Input1,
            3 => DebugSignal::Output,
            4 => DebugSignal::SigA0,
            5 => DebugSignal::SigA1,
            6 => DebugSignal::SigB,
            7 => DebugSignal::SigC,
            _ => return Err(AfeError::BadArg("debug signal out of range")),
        })
    }
}

/// Signal routed to each tap channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugRouting {
    pub channels: [DebugSignal; DEBUG_CHANNELS],
}

impl Default for DebugRouting {
    fn default() -> Self {
        Self {
            channels: [
                DebugSignal::Input0,
                DebugSignal::SigA1,
                DebugSignal::SigB,
                DebugSignal::SigC,
            ],
        }
    }
}

impl DebugRouting {
    pub fn new(channels: [DebugSignal; DEBUG_CHANNELS]) -> Self {
        Self { channels }
    }

    pub fn selects(&self, signal: DebugSignal) -> bool {
        self.channels.contains(&signal)
    }
}

impl FromStr for DebugRouting {
    type Err = AfeError;

    /// Parses `"1,5,6,7"`.
    fn from_str(s: &str) -> AfeResult<Self> {
        let values: Vec<&str> = s.split(',').map(str::trim).collect();
        if values.len() != DEBUG_CHANNELS {
            return Err(AfeError::BadArg("expected four debug channels"));
        }
        let mut channels = [DebugSignal::AecRef; DEBUG_CHANNELS];
        for (slot, v) in channels.iter_mut().zip(values) {
            let n: i32 = v
                .parse()
                .map_err(|_| AfeError::BadArg("debug channel is not a number"))?;
            *slot = DebugSignal::try_from(n)?;
        }
        Ok(Self { channels })
    }
}

impl fmt::Display for DebugRouting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.channels;
        write!(f, "{},{},{},{}", a as u8, b as u8, c as u8, d as u8)
    }
}

/// Monitor slot index for each output-type signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutLocator {
    slots: [Option<usize>; DebugSignal::COUNT],
}

impl OutLocator {
    pub fn slot(&self, signal: DebugSignal) -> Option<usize> {
        self.slots[signal as usize]
    }
}

/// Works out which engine debug outputs to enable, in order, and where each
/// routed signal lands in the monitor buffer.
///
/// The echo canceller occupies one slot per microphone whenever either of
/// its signals is routed, so the beam former slot does not move when only
/// one of them is selected.
pub(crate) fn plan_debug_output(
    routing: &DebugRouting,
    gate: ComponentSet,
    num_mics: usize,
) -> (OutLocator, Vec<Component>) {
    let mut locator = OutLocator::default();
    let mut outputs = Vec::new();
    let mut next = 0;

    let wants_aec = routing.selects(DebugSignal::SigA0) || routing.selects(DebugSignal::SigA1);
    if wants_aec {
        if gate.contains(Component::Aec) {
            outputs.push(Component::Aec);
            if routing.selects(DebugSignal::SigA0) {
                locator.slots[DebugSignal::SigA0 as usize] = Some(next);
            }
            next += 1;
            if num_mics == 2 {
                if routing.selects(DebugSignal::SigA1) {
                    locator.slots[DebugSignal::SigA1 as usize] = Some(next);
                }
                next += 1;
            }
        } else {
            log::warn!("AEC debug output requested but AEC is not enabled");
        }
    }

    if num_mics == 2 && routing.selects(DebugSignal::SigB) {
        if gate.contains(Component::Bf) {
            outputs.push(Component::Bf);
            locator.slots[DebugSignal::SigB as usize] = Some(next);
            next += 1;
        } else {
            log::warn!("BF debug output requested but BF is not enabled");
        }
    }

    if routing.selects(DebugSignal::SigC) {
        if gate.contains(Component::Dr) {
            outputs.push(Component::Dr);
            locator.slots[DebugSignal::SigC as usize] = Some(next);
        } else {
            log::warn!("DR debug output requested but DR is not enabled");
        }
    }

    (locator, outputs)
}

/// The four tap buffers handed to the output callback.
pub(crate) struct DebugTaps {
    buffers: Vec<AfeBuffer>,
}

impl DebugTaps {
    pub fn alloc(memory: &MemoryManager) -> AfeResult<Self> {
        let buffers = (0..DEBUG_CHANNELS)
            .map(|_| memory.alloc_samples(MemTag::AfeDbgOutBuffer, MONO_FRAME_SAMPLES))
            .collect::<AfeResult<Vec<_>>>()?;
        Ok(Self { buffers })
    }

    /// Copies input-type signals. Runs before enhancement.
    pub fn fill_inputs(
        &mut self,
        routing: &DebugRouting,
        input1: &[i16],
        input2: Option<&[i16]>,
        aec_ref: Option<&[i16]>,
    ) -> AfeResult<()> {
        for (buf, signal) in self.buffers.iter_mut().zip(routing.channels) {
            let src = match signal {
                DebugSignal::AecRef => aec_ref,
                DebugSignal::Input0 => Some(input1),
                DebugSignal::Input1 => input2,
                _ => continue,
            };
            copy_or_zero(buf.samples_mut()?, src);
        }
        Ok(())
    }

    /// Copies output-type signals. Runs after enhancement.
    pub fn fill_outputs(
        &mut self,
        routing: &DebugRouting,
        output: &[i16],
        enhancer: &SpeechEnhancer,
    ) -> AfeResult<()> {
        for (buf, signal) in self.buffers.iter_mut().zip(routing.channels) {
            let src = match signal {
                s if s.is_input() => continue,
                DebugSignal::Output => Some(output),
                s => enhancer.monitor_slot(s),
            };
            copy_or_zero(buf.samples_mut()?, src);
        }
        Ok(())
    }

    pub fn views(&self) -> AfeResult<[Option<&[i16]>; DEBUG_CHANNELS]> {
        let mut views = [None; DEBUG_CHANNELS];
        for (view, buf) in views.iter_mut().zip(&self.buffers) {
            *view = Some(buf.samples()?);
        }
        Ok(views)
    }
}

fn copy_or_zero(dst: &mut [i16], src: Option<&[i16]>) {
    match src {
        Some(src) => {
            let n = dst.len().min(src.len());
            dst[..n].copy_from_slice(&src[..n]);
            dst[n..].fill(0);
        }
        None => dst.fill(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_text_round_trip() {
        let r: DebugRouting = "0, 3,4,7".parse().unwrap();
        assert_eq!(r.channels[1], DebugSignal::Output);
        assert_eq!(r.to_string(), "0,3,4,7");
        assert_eq!(DebugRouting::default().to_string(), "1,5,6,7");
        assert!("1,2,3".parse::<DebugRouting>().is_err());
        assert!("1,2,3,8".parse::<DebugRouting>().is_err());
    }

    #[test]
    fn stereo_plan_reserves_both_aec_slots() {
        let routing = DebugRouting::default();
        let (loc, outputs) = plan_debug_output(&routing, ComponentSet::all(), 2);
        assert_eq!(outputs, vec![Component::Aec, Component::Bf, Component::Dr]);
        assert_eq!(loc.slot(DebugSignal::SigA0), None);
        assert_eq!(loc.slot(DebugSignal::SigA1), Some(1));
        assert_eq!(loc.slot(DebugSignal::SigB), Some(2));
        assert_eq!(loc.slot(DebugSignal::SigC), Some(3));
    }

    #[test]
    fn mono_plan_skips_beam_former() {
        let routing = DebugRouting::new([
            DebugSignal::SigA0,
            DebugSignal::SigA1,
            DebugSignal::SigB,
            DebugSignal::SigC,
        ]);
        let (loc, outputs) = plan_debug_output(&routing, ComponentSet::all(), 1);
        assert_eq!(outputs, vec![Component::Aec, Component::Dr]);
        assert_eq!(loc.slot(DebugSignal::SigA0), Some(0));
        assert_eq!(loc.slot(DebugSignal::SigA1), None);
        assert_eq!(loc.slot(DebugSignal::SigB), None);
        assert_eq!(loc.slot(DebugSignal::SigC), Some(1));
    }

    #[test]
    fn gated_component_gets_no_slot() {
        let routing = DebugRouting::default();
        let gate = ComponentSet::all().without(Component::Dr);
        let (loc, outputs) = plan_debug_output(&routing, gate, 2);
        assert!(!outputs.contains(&Component::Dr));
        assert_eq!(loc.slot(DebugSignal::SigC), None);
    }

    #[test]
    fn input_taps_zero_missing_sources() {
        let mut taps = DebugTaps::alloc(&MemoryManager::heap()).unwrap();
        let routing = DebugRouting::new([
            DebugSignal::AecRef,
            DebugSignal::Input0,
            DebugSignal::Input1,
            DebugSignal::Output,
        ]);
        let input1 = vec![7i16; MONO_FRAME_SAMPLES];
        taps.fill_inputs(&routing, &input1, None, None).unwrap();
        let views = taps.views().unwrap();
        assert!(views[0].unwrap().iter().all(|&s| s == 0));
        assert!(views[1].unwrap().iter().all(|&s| s == 7));
        assert!(views[2].unwrap().iter().all(|&s| s == 0));
    }
}
