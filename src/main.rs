mod audio;
mod cli;
mod config;
mod encoder;
mod error;
mod pipeline;
mod protocol;
mod screen;
mod server;
mod session;

use anyhow::{Context, Result};
use cli::{Cli, Commands};
use config::{HardwareMode, ServerConfig};
use encoder::stream::{probe_hardware, FfmpegLauncher};
use protocol::SettingsChange;
use session::arbitrator::{Devices, EncoderSetup, SystemDevices};
use session::{Arbitrator, Hub};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    match cli.command {
        Commands::GenConfig { write: false } => {
            print!("{}", ServerConfig::default().to_toml()?);
        }
        Commands::GenConfig { write: true } => {
            if cli.config.exists() {
                anyhow::bail!("{} already exists", cli.config.display());
            }
            ServerConfig::write_default(&cli.config)
                .with_context(|| format!("writing {}", cli.config.display()))?;
            println!("✅ Wrote default configuration to {}", cli.config.display());
        }
        Commands::Serve {
            addr,
            preset,
            ffmpeg,
        } => {
            let mut config = load_config(&cli.config);
            if let Some(addr) = addr {
                config.server.addr = addr;
            }
            if let Some(ffmpeg) = ffmpeg {
                config.encoder.ffmpeg = ffmpeg;
            }
            serve(config, preset).await?;
        }
        Commands::Sources => {
            load_config(&cli.config);
            list_sources();
        }
        Commands::Probe => {
            let config = load_config(&cli.config);
            probe(&config);
        }
    }

    Ok(())
}

/// Load the config file and start logging at its level. Problems with the
/// file are logged once a subscriber exists.
fn load_config(path: &Path) -> ServerConfig {
    let loaded = ServerConfig::load(path);
    let config = match &loaded {
        Ok(config) => config.clone(),
        Err(_) => ServerConfig::default(),
    };
    init_tracing(&config);
    match loaded {
        Ok(_) if !path.exists() => {
            tracing::info!("no config at {}; using defaults", path.display())
        }
        Ok(_) => tracing::debug!("loaded config from {}", path.display()),
        Err(e) => tracing::warn!("{}; using defaults", e),
    }
    config
}

fn init_tracing(config: &ServerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn serve(config: ServerConfig, preset: Option<String>) -> Result<()> {
    let ffmpeg = config.encoder.ffmpeg.clone();
    let hardware = tokio::task::spawn_blocking(move || probe_hardware(&ffmpeg))
        .await
        .context("ffmpeg probe task failed")?;
    let hw_available = config.encoder.hardware.try_hardware(&hardware);
    if !hardware.ffmpeg {
        tracing::warn!("ffmpeg not available; H.264 shares will fail to start, use codec = \"jpeg\"");
    }
    tracing::info!(
        nvenc = hardware.h264_nvenc,
        mode = ?config.encoder.hardware,
        "hardware encoding {}",
        if hw_available { "enabled" } else { "disabled" }
    );

    let mut settings = config.settings();
    if let Some(name) = preset {
        settings.apply(&SettingsChange {
            preset: Some(name),
            ..Default::default()
        });
    }
    tracing::info!(
        fps = settings.fps,
        resolution = settings.resolution_limit.as_str(),
        codec = %settings.codec,
        bitrate = %settings.bitrate,
        "default share settings"
    );

    let devices: Arc<dyn Devices> = Arc::new(SystemDevices);
    let encoder = EncoderSetup {
        launcher: Arc::new(FfmpegLauncher::new(config.encoder.ffmpeg.clone())),
        hardware,
        hw_available,
        adaptive_quality: config.capture.adaptive_quality,
        stats_interval: pipeline::STATS_INTERVAL,
    };
    let arbitrator = tokio::task::spawn_blocking(move || {
        Arc::new(Arbitrator::new(Hub::new(), devices, encoder, settings))
    })
    .await
    .context("audio probe task failed")?;
    let server = server::ShareServer::new(config.server.addr.clone(), Arc::clone(&arbitrator));

    let result = tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            Ok(())
        }
    };
    arbitrator.shutdown().await;
    result
}

fn list_sources() {
    let sources = screen::capture::list_sources();
    if sources.is_empty() {
        println!("No capturable sources found.");
        return;
    }
    for s in sources {
        let kind = match s.kind {
            screen::capture::SourceKind::Monitor => "monitor",
            screen::capture::SourceKind::Window => "window",
        };
        println!("{:<8} {:>12}  {:>5}x{:<5} {}", kind, s.id, s.width, s.height, s.name);
    }
}

fn probe(config: &ServerConfig) {
    let hardware = probe_hardware(&config.encoder.ffmpeg);
    println!("ffmpeg ({}): {}", config.encoder.ffmpeg.display(), yes_no(hardware.ffmpeg));
    println!("h264_nvenc: {}", yes_no(hardware.h264_nvenc));
    let mode = config.encoder.hardware;
    let used = mode.try_hardware(&hardware);
    println!(
        "hardware mode {:?}: {}",
        mode,
        if used { "NVENC first, libx264 fallback" } else { "libx264 only" }
    );
    if mode == HardwareMode::On && !hardware.h264_nvenc {
        println!("warning: hardware forced on but NVENC was not detected");
    }
    println!("audio capture: {}", yes_no(audio::audio_available()));
}

fn yes_no(b: bool) -> &'static str {
    if b {
        "yes"
    } else {
        "no"
    }
}
