//! voxbridged - the voxbridge daemon
//!
//! Wires the whole orchestrator together from one TOML config: audio fork
//! server, speech chains, AI bridge, signaling and media engine clients,
//! call engine, webhook delivery and the HTTP control API. Runs until
//! SIGINT.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use voxbridge_call_engine::config::EngineConfig;
use voxbridge_call_engine::conversation::SpeechStack;
use voxbridge_call_engine::device::{ConfigFileSource, DeviceRegistry};
use voxbridge_call_engine::engine::CallEngine;
use voxbridge_call_engine::media::engine::RemoteMediaEngine;
use voxbridge_call_engine::sip::wire::WireSipStack;
use voxbridge_control_api::{router, webhook, AppState};
use voxbridge_media_core::fork::{AudioForkServer, ForkConfig};
use voxbridge_speech_core::gateway::{AiBridge, AiBridgeConfig};
use voxbridge_speech_core::store;
use voxbridge_speech_core::stt::{SttChain, SttChainConfig};
use voxbridge_speech_core::tts::{TtsChain, TtsChainConfig};
use voxbridge_speech_core::AudioStore;

#[derive(Parser, Debug)]
#[command(name = "voxbridged", about = "SIP/PBX to conversational AI call orchestrator")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "voxbridge.toml")]
    config: std::path::PathBuf,

    /// Log filter (overrides RUST_LOG)
    #[arg(long)]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = match &args.log {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = EngineConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    info!(config = %args.config.display(), "voxbridged starting");

    // Audio artifacts and their sweeper
    let store = AudioStore::open(&config.audio_dir, config.audio_base_url())
        .context("opening audio store")?;
    store.spawn_sweeper(store::DEFAULT_MAX_AGE, store::DEFAULT_SWEEP_INTERVAL);

    // Audio fork server
    let fork_server = AudioForkServer::bind(ForkConfig {
        bind_addr: ([0, 0, 0, 0], config.ws_port).into(),
        ..ForkConfig::default()
    })
    .await
    .context("binding audio fork server")?;
    let expectations = fork_server.expectations();
    tokio::spawn(fork_server.run());

    // Speech stack
    let tts = TtsChain::from_config(
        &TtsChainConfig {
            cloud_tts_key: config.cloud_tts_key.clone(),
            moss_tts_url: config.moss_tts_url.clone(),
            moss_enabled: config.moss_enabled,
            openai_key: config.openai_key.clone(),
            elevenlabs_key: config.elevenlabs_key.clone(),
        },
        store.clone(),
    );
    let stt = SttChain::from_config(&SttChainConfig {
        cloud_stt_key: config.cloud_stt_key.clone(),
        openai_key: config.openai_key.clone(),
    });
    info!(tts = ?tts.provider_names(), stt = ?stt.provider_names(), "speech chains ready");

    let speech = Arc::new(SpeechStack {
        tts: Arc::new(tts),
        stt: Arc::new(stt),
        ai: Arc::new(AiBridge::new(AiBridgeConfig::new(config.ai_gateway_url.clone()))),
    });

    // Telephony edge
    let stack = Arc::new(
        WireSipStack::connect(&config.sip_host, config.sip_port, &config.sip_secret)
            .await
            .context("connecting to signaling server")?,
    );
    let media = Arc::new(
        RemoteMediaEngine::connect(&config.media_host, config.media_port, &config.media_secret)
            .await
            .context("connecting to media engine")?,
    );

    let devices = Arc::new(
        DeviceRegistry::new(&config.devices, &config.language_default)
            .with_source(Box::new(ConfigFileSource::new(&args.config))),
    );

    let http_port = config.http_port;
    let static_dir = config.audio_dir.join("static");
    let (engine, events) = CallEngine::new(config, stack, media, speech, devices, expectations);
    engine.start();
    webhook::spawn_delivery(events);

    // Control API
    let app = router(AppState::new(engine.clone(), store, static_dir));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", http_port))
        .await
        .with_context(|| format!("binding control api on port {}", http_port))?;
    info!(port = http_port, "control api listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("control api server")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }

    engine.stop();
    info!("voxbridged stopped");
    Ok(())
}
