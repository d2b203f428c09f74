//! selkie: live voice sessions with a conversational agent from the terminal.

use anyhow::Context;
use selkie::audio::{CpalMicrophone, CpalOutputDevice};
use selkie::client::{ClientEvent, VoiceClient};
use selkie::config::VoiceConfig;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("selkie=info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut config_path: Option<PathBuf> = None;
    let mut list_devices = false;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                let path = args.get(i).context("--config requires a path")?;
                config_path = Some(PathBuf::from(path));
            }
            "devices" => list_devices = true,
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => anyhow::bail!("unknown argument: {other} (try --help)"),
        }
        i += 1;
    }

    if list_devices {
        return print_audio_devices();
    }

    let config = load_config(config_path)?;
    run_session(config).await
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<VoiceConfig> {
    if let Some(path) = path {
        return VoiceConfig::from_file(&path)
            .with_context(|| format!("loading config from {}", path.display()));
    }
    let default_path = VoiceConfig::default_config_path();
    if default_path.exists() {
        VoiceConfig::from_file(&default_path)
            .with_context(|| format!("loading config from {}", default_path.display()))
    } else {
        Ok(VoiceConfig::default())
    }
}

async fn run_session(config: VoiceConfig) -> anyhow::Result<()> {
    println!("selkie {}", env!("CARGO_PKG_VERSION"));
    println!("model: {} (voice {})", config.agent.model, config.agent.voice);
    println!("press ctrl-c to hang up");

    let client = VoiceClient::new(config);
    let handle = client.handle();
    let cancel = client.cancel_token();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nhanging up...");
            cancel.cancel();
        }
    });

    let mut events = handle.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    handle.connect().await?;
    client.run().await?;
    Ok(())
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::StateChanged { state } => println!("state: {state:?}"),
        ClientEvent::Speaking { active: true } => println!("agent speaking"),
        ClientEvent::Speaking { active: false } => println!("agent quiet"),
        ClientEvent::Error { message } => eprintln!("error: {message}"),
    }
}

fn print_audio_devices() -> anyhow::Result<()> {
    println!("input devices:");
    for name in CpalMicrophone::list_input_devices()? {
        println!("  {name}");
    }
    println!("output devices:");
    for name in CpalOutputDevice::list_output_devices()? {
        println!("  {name}");
    }
    Ok(())
}

fn print_help() {
    println!("selkie - live voice sessions with a conversational agent");
    println!();
    println!("usage: selkie [--config PATH]");
    println!("       selkie devices");
    println!();
    println!("options:");
    println!("  --config PATH   load configuration from PATH");
    println!("  -h, --help      show this help");
    println!();
    println!("environment:");
    println!("  GEMINI_API_KEY     API key used when agent.api_key is unset");
    println!("  SELKIE_CONFIG_DIR  override the config directory");
}
