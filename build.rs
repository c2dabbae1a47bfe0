use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    board: Board,
    audio: Audio,
    tuner: Tuner,
    components: Components,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Board {
    #[serde(rename = "type")]
    type_: String,
    name: String,
}

#[derive(Deserialize)]
struct Audio {
    input_channels: u8,
    input_source: i32,
    aec_reference: i32,
    target_speaker: i32,
    queue_capacity: usize,
}

#[derive(Deserialize)]
struct Tuner {
    poll_interval_ms: u64,
    uart_baud_rate: i32,
    calibration_timeout_ms: u64,
    debug_channels: [u8; 4],
}

#[derive(Deserialize)]
struct Components {
    hpf: bool,
    aec: bool,
    bf: bool,
    dr: bool,
    ns: bool,
    es: bool,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    if config.audio.input_channels == 0 || config.audio.input_channels > 2 {
        panic!(
            "audio.input_channels must be 1 or 2, got {}",
            config.audio.input_channels
        );
    }

    // 应用和板子信息
    println!("cargo:rustc-env=AFE_APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=AFE_APP_VERSION={}", config.application.version);
    println!("cargo:rustc-env=AFE_BOARD_TYPE={}", config.board.type_);
    println!("cargo:rustc-env=AFE_BOARD_NAME={}", config.board.name);

    // 音频输入配置
    println!("cargo:rustc-env=AFE_INPUT_CHANNELS={}", config.audio.input_channels);
    println!("cargo:rustc-env=AFE_INPUT_SOURCE={}", config.audio.input_source);
    println!("cargo:rustc-env=AFE_AEC_REFERENCE={}", config.audio.aec_reference);
    println!("cargo:rustc-env=AFE_TARGET_SPEAKER={}", config.audio.target_speaker);
    println!("cargo:rustc-env=AFE_QUEUE_CAPACITY={}", config.audio.queue_capacity);

    // Tuner 配置
    println!("cargo:rustc-env=AFE_TUNER_POLL_INTERVAL_MS={}", config.tuner.poll_interval_ms);
    println!("cargo:rustc-env=AFE_TUNER_UART_BAUD={}", config.tuner.uart_baud_rate);
    println!(
        "cargo:rustc-env=AFE_CALIBRATION_TIMEOUT_MS={}",
        config.tuner.calibration_timeout_ms
    );
    let channels: Vec<String> = config
        .tuner
        .debug_channels
        .iter()
        .map(|c| c.to_string())
        .collect();
    println!("cargo:rustc-env=AFE_DEBUG_CHANNELS={}", channels.join(","));

    // 算法组件
    let c = &config.components;
    let enabled: Vec<&str> = [
        ("hpf", c.hpf),
        ("aec", c.aec),
        ("bf", c.bf),
        ("dr", c.dr),
        ("ns", c.ns),
        ("es", c.es),
    ]
    .iter()
    .filter(|(_, on)| *on)
    .map(|(name, _)| *name)
    .collect();
    println!("cargo:rustc-env=AFE_COMPONENTS={}", enabled.join(","));
}
