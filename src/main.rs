//! Demo host for the audio front end.
//!
//! Feeds a synthetic two-microphone capture in real time, answers tuner
//! requests typed on stdin (`get,ns`, `set,input_gain,6`,
//! `start,aec-calibration`, ...) and prints the frame statistics on exit.
//! While calibration runs the simulated speaker plays the reference signal
//! and the microphones hear it back 40 ms later.

use std::collections::VecDeque;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use audio_front_end::tuner::{NotifySettingsFn, ReadRequestFn, WriteResponseFn};
use audio_front_end::{
    AfeBufferInfo, AfeConfig, AfeContext, AfeError, AudioFrontEnd, Config, ConfigAction,
    ConfigName, ConfigSetting, MONO_FRAME_SAMPLES, OutputCallback, SAMPLE_RATE_HZ, TunerCallbacks,
};

/// Speaker to microphone path of the simulated room.
const ECHO_DELAY_MS: usize = 40;

/// What the simulated speaker is playing.
#[derive(Default)]
struct Playback {
    reference: Option<Arc<Vec<i16>>>,
    position: usize,
}

impl Playback {
    fn next_frame(&mut self) -> Vec<i16> {
        match &self.reference {
            Some(reference) if !reference.is_empty() => {
                let frame = (0..MONO_FRAME_SAMPLES)
                    .map(|i| reference[(self.position + i) % reference.len()])
                    .collect();
                self.position = (self.position + MONO_FRAME_SAMPLES) % reference.len();
                frame
            }
            _ => vec![0; MONO_FRAME_SAMPLES],
        }
    }
}

fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    let board = Config::new().unwrap_or_default();
    log::info!(
        "{} v{} on {} ({})",
        board.app_name,
        board.app_version,
        board.board_name,
        board.board_type
    );

    let seconds: u64 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(10);

    // stdin 按行读取，交给 tuner 的读回调
    let (line_tx, mut line_rx) = mpsc::channel::<Vec<u8>>(16);
    thread::Builder::new()
        .name("stdin-reader".into())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                let mut bytes = line.trim_end().as_bytes().to_vec();
                bytes.extend_from_slice(b"\r\n");
                if line_tx.blocking_send(bytes).is_err() {
                    break;
                }
            }
        })?;

    let mut pending: VecDeque<u8> = VecDeque::new();
    let read_request: ReadRequestFn = Box::new(move |buf: &mut [u8]| {
        while let Ok(bytes) = line_rx.try_recv() {
            pending.extend(bytes);
        }
        let n = buf.len().min(pending.len());
        for (dst, src) in buf.iter_mut().zip(pending.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    });
    let write_response: WriteResponseFn = Box::new(|bytes: &[u8]| {
        let mut out = io::stdout().lock();
        out.write_all(bytes)
            .and_then(|_| out.flush())
            .map_err(|e| AfeError::Generic(e.to_string()))
    });

    let input_gain = Arc::new(AtomicI32::new(0));
    let playback = Arc::new(Mutex::new(Playback::default()));
    let notify_settings: NotifySettingsFn = {
        let input_gain = input_gain.clone();
        let playback = playback.clone();
        Box::new(move |ctx: &AfeContext, setting: &mut ConfigSetting| {
            match (setting.action, setting.name) {
                (ConfigAction::Read, ConfigName::InputGain) => {
                    setting.value = input_gain.load(Ordering::Relaxed);
                }
                (ConfigAction::Update, ConfigName::InputGain) => {
                    input_gain.store(setting.value, Ordering::Relaxed);
                    log::info!("Hardware input gain set to {} dB", setting.value);
                }
                (ConfigAction::Notify, ConfigName::BulkDelayCalcStart) => {
                    let reference = ctx.bd_calc_init()?;
                    *playback.lock() = Playback {
                        reference: Some(Arc::new(reference)),
                        position: 0,
                    };
                }
                (ConfigAction::Notify, ConfigName::BulkDelayCalcStopped) => {
                    *playback.lock() = Playback::default();
                    ctx.bd_calc_deinit()?;
                    log::info!("Calibrated bulk delay: {} ms", setting.value);
                }
                (action, name) => log::info!("{:?} {:?} = {}", action, name, setting.value),
            }
            Ok(())
        })
    };

    let mut processed = 0u64;
    let output_callback: OutputCallback =
        Box::new(move |_ctx: &AfeContext, info: &AfeBufferInfo<'_>| {
            processed += 1;
            if processed % 500 == 0 {
                let energy: f64 = info.output.iter().map(|&s| (s as f64).powi(2)).sum();
                let rms = (energy / info.output.len() as f64).sqrt();
                log::info!("{} frames processed, output rms {:.1}", processed, rms);
            }
            Ok(())
        });

    let config = AfeConfig {
        filter_settings: Some(vec![0; 16]),
        output_callback: Some(output_callback),
        tuner: Some(TunerCallbacks {
            read_request,
            write_response,
            notify_settings,
        }),
        num_channels: 2,
        board,
        ..AfeConfig::default()
    };
    let mut afe = AudioFrontEnd::create(config)?;
    let feeder = afe.feeder();

    // 模拟采集：每 10ms 一帧
    let echo_delay = ECHO_DELAY_MS * SAMPLE_RATE_HZ as usize / 1000;
    let mut echo: VecDeque<i16> = std::iter::repeat_n(0, echo_delay).collect();
    let frames = seconds * 100;
    let started = Instant::now();
    for frame_index in 0..frames {
        let speaker = playback.lock().next_frame();
        echo.extend(speaker.iter().copied());

        // 两路麦克风：第二路紧跟在第一路后面
        let mic0: Vec<i16> = (0..MONO_FRAME_SAMPLES)
            .map(|i| {
                let n = frame_index as usize * MONO_FRAME_SAMPLES + i;
                let t = n as f64 / SAMPLE_RATE_HZ as f64;
                let voice = (2.0 * std::f64::consts::PI * 440.0 * t).sin() * 1000.0;
                let heard = echo.pop_front().unwrap_or(0) as f64;
                (voice + heard).clamp(i16::MIN as f64, i16::MAX as f64) as i16
            })
            .collect();
        let mut input = mic0.clone();
        input.extend(mic0.iter().map(|s| s / 2));
        if let Err(e) = feeder.feed(input.into(), Some(speaker.into())) {
            log::warn!("Feed failed: {}", e);
        }

        let next = Duration::from_millis(10 * (frame_index + 1));
        if let Some(wait) = next.checked_sub(started.elapsed()) {
            thread::sleep(wait);
        }
    }

    let stats = afe.context().stats();
    afe.delete(afe.handle())?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
