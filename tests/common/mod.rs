//! Shared fixtures for the integration tests.
//!
//! Only one front end may be live per process, so every test takes the
//! [`serial`] guard first.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard, const_mutex};

use audio_front_end::{
    AfeBufferInfo, AfeConfig, AfeContext, AfeResult, AllocCallback, ConfigAction, ConfigName,
    ConfigSetting, FreeCallback, MONO_FRAME_SAMPLES, MemTag, TunerCallbacks,
};

pub const TIMEOUT: Duration = Duration::from_secs(10);

static SERIAL: Mutex<()> = const_mutex(());

pub fn serial() -> MutexGuard<'static, ()> {
    let _ = env_logger::builder().is_test(true).try_init();
    SERIAL.lock()
}

/// `channels` mono frames back to back, every sample of channel `c` set to
/// `value + c`.
pub fn frame(value: i16, channels: usize) -> Arc<[i16]> {
    (0..channels)
        .flat_map(|c| std::iter::repeat_n(value + c as i16, MONO_FRAME_SAMPLES))
        .collect()
}

/// What the output callback saw for one frame.
#[derive(Debug, Clone)]
pub struct Delivered {
    pub input: Vec<i16>,
    pub output: Vec<i16>,
    pub debug: Vec<Option<Vec<i16>>>,
}

impl Delivered {
    fn from_info(info: &AfeBufferInfo<'_>) -> Self {
        Self {
            input: info.input.to_vec(),
            output: info.output.to_vec(),
            debug: info.debug.iter().map(|d| d.map(<[i16]>::to_vec)).collect(),
        }
    }
}

/// A config whose output callback forwards every frame to the returned
/// receiver.
pub fn collecting_config(channels: usize) -> (AfeConfig, mpsc::Receiver<Delivered>) {
    let (tx, rx) = mpsc::channel();
    let config = AfeConfig {
        filter_settings: Some(vec![1; 8]),
        output_callback: Some(Box::new(move |_ctx: &AfeContext, info: &AfeBufferInfo<'_>| {
            let _ = tx.send(Delivered::from_info(info));
            Ok(())
        })),
        num_channels: channels,
        ..AfeConfig::default()
    };
    (config, rx)
}

pub fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    done()
}

/// Heap allocator that keeps count of regions per tag.
#[derive(Clone, Default)]
pub struct CountingAllocator {
    live: Arc<Mutex<HashMap<MemTag, i32>>>,
    fail_tag: Arc<Mutex<Option<MemTag>>>,
}

impl CountingAllocator {
    pub fn fail_on(&self, tag: MemTag) {
        *self.fail_tag.lock() = Some(tag);
    }

    pub fn outstanding(&self) -> i32 {
        self.live.lock().values().sum()
    }

    pub fn allocated(&self, tag: MemTag) -> i32 {
        self.live.lock().get(&tag).copied().unwrap_or(0)
    }

    pub fn callbacks(&self) -> (AllocCallback, FreeCallback) {
        let alloc: AllocCallback = {
            let this = self.clone();
            Arc::new(move |tag: MemTag, size: usize| {
                if *this.fail_tag.lock() == Some(tag) {
                    return None;
                }
                *this.live.lock().entry(tag).or_default() += 1;
                Some(vec![0xa5u8; size].into_boxed_slice())
            })
        };
        let free: FreeCallback = {
            let this = self.clone();
            Arc::new(move |tag: MemTag, _buffer: Box<[u8]>| {
                *this.live.lock().entry(tag).or_default() -= 1;
            })
        };
        (alloc, free)
    }
}

/// Test side of the tuner transport.
pub struct TunerLink {
    requests: mpsc::Sender<Vec<u8>>,
    responses: mpsc::Receiver<Vec<u8>>,
    pub input_gain: Arc<AtomicI32>,
    pub settings: Arc<Mutex<Vec<ConfigSetting>>>,
    /// Reference handed out by the last calibration start.
    pub reference: Arc<Mutex<Option<Vec<i16>>>>,
}

impl TunerLink {
    /// Wires a transport and an application that keeps the input gain,
    /// records every notification and starts or stops calibration when
    /// asked.
    pub fn new() -> (Self, TunerCallbacks) {
        let (req_tx, req_rx) = mpsc::channel::<Vec<u8>>();
        let (rsp_tx, rsp_rx) = mpsc::channel::<Vec<u8>>();
        let input_gain = Arc::new(AtomicI32::new(0));
        let settings = Arc::new(Mutex::new(Vec::new()));
        let reference = Arc::new(Mutex::new(None));

        let mut pending: VecDeque<u8> = VecDeque::new();
        let callbacks = TunerCallbacks {
            read_request: Box::new(move |buf: &mut [u8]| {
                while let Ok(bytes) = req_rx.try_recv() {
                    pending.extend(bytes);
                }
                let n = buf.len().min(pending.len());
                for (dst, src) in buf.iter_mut().zip(pending.drain(..n)) {
                    *dst = src;
                }
                Ok(n)
            }),
            write_response: Box::new(move |bytes: &[u8]| {
                let _ = rsp_tx.send(bytes.to_vec());
                Ok(())
            }),
            notify_settings: {
                let input_gain = input_gain.clone();
                let settings = settings.clone();
                let reference = reference.clone();
                Box::new(move |ctx: &AfeContext, setting: &mut ConfigSetting| -> AfeResult<()> {
                    match (setting.action, setting.name) {
                        (ConfigAction::Read, ConfigName::InputGain) => {
                            setting.value = input_gain.load(Ordering::SeqCst);
                        }
                        (ConfigAction::Update, ConfigName::InputGain) => {
                            input_gain.store(setting.value, Ordering::SeqCst);
                        }
                        (ConfigAction::Notify, ConfigName::BulkDelayCalcStart) => {
                            *reference.lock() = Some(ctx.bd_calc_init()?);
                        }
                        (ConfigAction::Notify, ConfigName::BulkDelayCalcStopped) => ctx.bd_calc_deinit()?,
                        _ => {}
                    }
                    settings.lock().push(*setting);
                    Ok(())
                })
            },
        };

        (
            Self {
                requests: req_tx,
                responses: rsp_rx,
                input_gain,
                settings,
                reference,
            },
            callbacks,
        )
    }

    pub fn send_raw(&self, bytes: &[u8]) {
        let _ = self.requests.send(bytes.to_vec());
    }

    pub fn response(&self) -> String {
        let bytes = self
            .responses
            .recv_timeout(TIMEOUT)
            .unwrap_or_else(|_| panic!("no tuner response within {:?}", TIMEOUT));
        String::from_utf8(bytes).unwrap()
    }

    /// Sends one request line and returns the response line.
    pub fn request(&self, line: &str) -> String {
        self.send_raw(format!("{}\r\n", line).as_bytes());
        self.response()
    }

    pub fn no_response_for(&self, wait: Duration) -> bool {
        self.responses.recv_timeout(wait).is_err()
    }

    pub fn notified(&self, name: ConfigName) -> Vec<ConfigSetting> {
        self.settings
            .lock()
            .iter()
            .filter(|s| s.name == name)
            .copied()
            .collect()
    }
}
