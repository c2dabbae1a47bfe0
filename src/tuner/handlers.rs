//! Tuner command handlers.

use std::time::Instant;

use super::command::{FnCommand, HandlerFn, TunerContext};
use super::protocol::{TunerReply, TunerRequest, TunerStatus};
use super::{ConfigAction, ConfigName};
use crate::bulk_delay::BULK_DELAY_ERROR;
use crate::debug::{DebugRouting, DebugSignal};
use crate::enhancer::{Component, ComponentParams, Level};
use crate::error::AfeError;
use crate::{DEBUG_CHANNELS, FRAME_SIZE_MS, HW_INPUT_GAIN_RANGE, SAMPLE_RATE_HZ};

const SET: &str = "set";
const GET: &str = "get";

/// Command table: verb, name, minimum argument count, handler.
const COMMANDS: &[(&str, Option<&str>, usize, HandlerFn)] = &[
    (SET, Some("input_gain"), 1, input_gain),
    (GET, Some("input_gain"), 0, input_gain),
    (SET, Some("hpf"), 1, hpf),
    (GET, Some("hpf"), 0, hpf),
    (SET, Some("bulk_delay"), 1, bulk_delay),
    (GET, Some("bulk_delay"), 0, bulk_delay),
    (GET, Some("ic"), 0, level_setting),
    (SET, Some("ic"), 1, level_setting),
    (GET, Some("es"), 0, level_setting),
    (SET, Some("es"), 1, level_setting),
    (GET, Some("ns"), 0, noise_suppressor),
    (SET, Some("ns"), 1, noise_suppressor),
    (SET, Some("comp_bf"), 1, component_state),
    (GET, Some("comp_bf"), 0, component_state),
    (SET, Some("comp_dr"), 1, component_state),
    (GET, Some("comp_dr"), 0, component_state),
    (SET, Some("comp_ns"), 1, component_state),
    (GET, Some("comp_ns"), 0, component_state),
    (SET, Some("comp_es"), 1, component_state),
    (GET, Some("comp_es"), 0, component_state),
    (SET, Some("comp_aec"), 1, component_state),
    (GET, Some("comp_aec"), 0, component_state),
    ("start_stream", None, 0, stream),
    ("stop_stream", None, 0, stream),
    (SET, Some("audio-channels"), DEBUG_CHANNELS, set_audio_channels),
    (GET, Some("audio-channels"), 0, get_audio_channels),
    ("start", Some("aec-calibration"), 0, aec_calibration),
    (GET, Some("sound_meter"), 0, sound_meter),
    (GET, Some("hpf_param"), 0, component_params),
    (GET, Some("aec_param"), 0, component_params),
    (GET, Some("bf_param"), 0, component_params),
    (GET, Some("es_param"), 0, component_params),
    (GET, Some("ns_param"), 0, component_params),
    (GET, Some("input_param"), 0, input_param),
];

pub fn commands() -> impl Iterator<Item = FnCommand> {
    COMMANDS
        .iter()
        .map(|&(verb, name, min_args, handler)| FnCommand::new(verb, name, min_args, handler))
}

fn name_of(req: &TunerRequest) -> &str {
    req.name.as_deref().unwrap_or_default()
}

/// Hardware gain lives in the application's codec driver.
fn input_gain(ctx: &mut TunerContext<'_>, req: &TunerRequest) -> TunerReply {
    if req.is_set() {
        let gain = match req.int_arg(0) {
            Ok(g) if HW_INPUT_GAIN_RANGE.contains(&g) => g,
            Ok(g) => {
                log::warn!("{}", AfeError::TunerHwInputGainOutOfRange(g));
                return TunerReply::status(TunerStatus::InvalidCmdParams);
            }
            Err(e) => return TunerReply::from_error(&e),
        };
        match ctx.notify(ConfigAction::Update, ConfigName::InputGain, gain) {
            Ok(_) => TunerReply::ok(),
            Err(e) => {
                log::error!("Failed to write input gain to application: {}", e);
                TunerReply::status(TunerStatus::InternalError)
            }
        }
    } else {
        match ctx.notify(ConfigAction::Read, ConfigName::InputGain, 0) {
            Ok(gain) => TunerReply::ok_with(gain.to_string()),
            Err(e) => {
                log::error!("Failed to read input gain from application: {}", e);
                TunerReply::status(TunerStatus::InternalError)
            }
        }
    }
}

fn hpf(ctx: &mut TunerContext<'_>, req: &TunerRequest) -> TunerReply {
    if req.is_set() {
        // 算法暂不支持修改截止频率
        return TunerReply::status(TunerStatus::NotSupported);
    }
    ctx.afe
        .enhancer()
        .config_value(Component::Hpf)
        .map(|v| v.to_string())
        .into()
}

fn bulk_delay(ctx: &mut TunerContext<'_>, req: &TunerRequest) -> TunerReply {
    if !req.is_set() {
        return ctx
            .afe
            .enhancer()
            .config_value(Component::Aec)
            .map(|v| v.to_string())
            .into();
    }
    let delay = match req.int_arg(0) {
        Ok(d) => d,
        Err(e) => return TunerReply::from_error(&e),
    };
    if let Err(e) = ctx.afe.enhancer().set_config(Component::Aec, delay) {
        log::error!("Failed to update bulk delay: {}", e);
        return TunerReply::from_error(&e);
    }
    let _ = ctx.notify(ConfigAction::Notify, ConfigName::AecBulkDelay, delay);
    TunerReply::ok()
}

/// `ic` drives the beam former, `es` the echo suppressor.
fn level_setting(ctx: &mut TunerContext<'_>, req: &TunerRequest) -> TunerReply {
    let (component, setting) = match name_of(req) {
        "ic" => (Component::Bf, ConfigName::InferenceCanceller),
        _ => (Component::Es, ConfigName::EchoSuppressor),
    };
    if !req.is_set() {
        return ctx
            .afe
            .enhancer()
            .config_value(component)
            .map(|v| Level::from_value(v).as_str())
            .into();
    }
    let Some(level) = req.arg(0).and_then(Level::parse) else {
        log::warn!("Invalid level for {}", component);
        return TunerReply::status(TunerStatus::InvalidCmdParams);
    };
    if let Err(e) = ctx.afe.enhancer().set_config(component, level as i32) {
        log::error!("Failed to update {} level: {}", component, e);
        return TunerReply::from_error(&e);
    }
    let _ = ctx.notify(ConfigAction::Notify, setting, level as i32);
    TunerReply::ok()
}

fn noise_suppressor(ctx: &mut TunerContext<'_>, req: &TunerRequest) -> TunerReply {
    if !req.is_set() {
        return ctx
            .afe
            .enhancer()
            .config_value(Component::Ns)
            .map(|v| v.to_string())
            .into();
    }
    let gain_db = match req.int_arg(0) {
        Ok(g) => g,
        Err(e) => return TunerReply::from_error(&e),
    };
    if let Err(e) = ctx.afe.enhancer().set_config(Component::Ns, gain_db) {
        log::error!("Failed to update noise suppression gain: {}", e);
        return TunerReply::from_error(&e);
    }
    let _ = ctx.notify(ConfigAction::Notify, ConfigName::NoiseSuppressor, gain_db);
    TunerReply::ok()
}

fn component_state(ctx: &mut TunerContext<'_>, req: &TunerRequest) -> TunerReply {
    let component = match name_of(req) {
        "comp_bf" => Component::Bf,
        "comp_dr" => Component::Dr,
        "comp_ns" => Component::Ns,
        "comp_es" => Component::Es,
        "comp_aec" => Component::Aec,
        _ => return TunerReply::status(TunerStatus::InvalidCmdParams),
    };
    let enhancer = ctx.afe.enhancer();
    if req.is_set() {
        let enable = match req.int_arg(0) {
            Ok(v) => v != 0,
            Err(e) => return TunerReply::from_error(&e),
        };
        match enhancer.set_component_enabled(component, enable) {
            Ok(()) => {
                log::info!("Component {} {}", component, if enable { "enabled" } else { "disabled" });
                TunerReply::ok()
            }
            Err(e) => TunerReply::from_error(&e),
        }
    } else {
        enhancer
            .component_enabled(component)
            .map(|on| if on { "1" } else { "0" })
            .into()
    }
}

fn stream(ctx: &mut TunerContext<'_>, req: &TunerRequest) -> TunerReply {
    let state = i32::from(req.verb == "start_stream");
    match ctx.notify(ConfigAction::Update, ConfigName::Stream, state) {
        Ok(_) => TunerReply::ok(),
        Err(e) => {
            log::error!("Failed to update stream state: {}", e);
            TunerReply::status(TunerStatus::InternalError)
        }
    }
}

fn set_audio_channels(ctx: &mut TunerContext<'_>, req: &TunerRequest) -> TunerReply {
    let mut channels = [DebugSignal::Input0; DEBUG_CHANNELS];
    for (i, slot) in channels.iter_mut().enumerate() {
        let signal = req
            .int_arg(i)
            .ok()
            .and_then(|v| DebugSignal::try_from(v).ok());
        match signal {
            Some(s) => *slot = s,
            None => {
                log::warn!("Invalid debug channel selector {:?}", req.arg(i));
                return TunerReply::status(TunerStatus::InvalidCmd);
            }
        }
    }
    match ctx.afe.enhancer().update_debug_routing(DebugRouting::new(channels)) {
        Ok(()) => TunerReply::ok(),
        Err(e) => {
            log::error!("Failed to update debug channels: {}", e);
            TunerReply::status(TunerStatus::InternalError)
        }
    }
}

fn get_audio_channels(ctx: &mut TunerContext<'_>, _req: &TunerRequest) -> TunerReply {
    ctx.afe
        .enhancer()
        .debug_routing()
        .map(|r| r.to_string())
        .into()
}

/// Blocks the tuner thread until calibration finishes or times out.
fn aec_calibration(ctx: &mut TunerContext<'_>, _req: &TunerRequest) -> TunerReply {
    if let Err(e) = ctx.notify(ConfigAction::Notify, ConfigName::BulkDelayCalcStart, 0) {
        log::error!("Application failed to start bulk delay calculation: {}", e);
    }

    let started = Instant::now();
    let delay = ctx
        .afe
        .bd_calc_wait_for_complete(ctx.afe.calibration_timeout());
    log::info!(
        "Bulk delay calculation finished in {:?}: {} ms",
        started.elapsed(),
        delay
    );

    let _ = ctx.notify(ConfigAction::Notify, ConfigName::BulkDelayCalcStopped, delay);

    let status = if delay == BULK_DELAY_ERROR {
        TunerStatus::InternalError
    } else {
        TunerStatus::Ok
    };
    TunerReply {
        status,
        data: Some(delay.to_string()),
    }
}

fn sound_meter(ctx: &mut TunerContext<'_>, _req: &TunerRequest) -> TunerReply {
    let meter = match ctx.afe.enhancer().sound_meter() {
        Ok(m) => m,
        Err(e) => return TunerReply::from_error(&e),
    };
    let data = if ctx.afe.num_channels() == 2 {
        format!("{},{},{}", meter[0], meter[1], meter[2])
    } else {
        format!("{},{}", meter[0], meter[1])
    };
    TunerReply::ok_with(data)
}

fn component_params(ctx: &mut TunerContext<'_>, req: &TunerRequest) -> TunerReply {
    let component = match name_of(req) {
        "hpf_param" => Component::Hpf,
        "aec_param" => Component::Aec,
        "bf_param" => Component::Bf,
        "es_param" => Component::Es,
        "ns_param" => Component::Ns,
        _ => return TunerReply::status(TunerStatus::InvalidCmdParams),
    };
    ctx.afe
        .enhancer()
        .params(component)
        .map(|params| format_params(&params))
        .into()
}

fn format_params(params: &ComponentParams) -> String {
    match *params {
        ComponentParams::Hpf { cutoff_hz } => cutoff_hz.to_string(),
        ComponentParams::Aec {
            bulk_delay_ms,
            tail_len_ms,
        } => format!("{},{}", bulk_delay_ms, tail_len_ms),
        ComponentParams::Bf {
            aggressiveness,
            mic_distance_mm,
            num_beams,
            angle_start,
            angle_stop,
        } => format!(
            "{},{},{},{},{}",
            Level::from_value(aggressiveness).as_str(),
            mic_distance_mm,
            num_beams,
            angle_start,
            angle_stop
        ),
        ComponentParams::Es { aggressiveness } => Level::from_value(aggressiveness).as_str().into(),
        ComponentParams::Ns { gain_db } => gain_db.to_string(),
    }
}

fn input_param(ctx: &mut TunerContext<'_>, _req: &TunerRequest) -> TunerReply {
    let gain = match ctx.notify(ConfigAction::Read, ConfigName::InputGain, 0) {
        Ok(g) => g,
        Err(e) => {
            log::error!("Failed to read input gain from application: {}", e);
            return TunerReply::status(TunerStatus::InternalError);
        }
    };
    let board = ctx.afe.board_config();
    TunerReply::ok_with(format!(
        "{},{},{},{},{},{},{},{}",
        gain,
        ctx.afe.num_channels(),
        board.input_source,
        FRAME_SIZE_MS,
        SAMPLE_RATE_HZ,
        board.aec_reference,
        board.target_speaker,
        board.uart_baud_rate
    ))
}
