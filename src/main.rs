/*
 * RPG Scribe - Rust Edition
 * Copyright (c) 2024 RPG Scribe Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

mod audio;
mod bus;
mod config;
mod error;
mod resilience;
mod session;
mod storage;
mod summarizer;
mod transcriber;
mod types;

use audio::FileAudioSource;
use config::{CampaignFile, Config};
use session::ScribeSession;
use storage::sqlite::SqliteStorageGateway;
use summarizer::HttpLlmClient;
use transcriber::HttpSttClient;
use types::AudioSourceTag;

/// RPG Scribe - real-time voice transcription and narrative summarization
/// for tabletop RPG sessions.
#[derive(Parser)]
#[command(name = "rpg-scribe")]
#[command(version = "0.1.0")]
#[command(about = "Real-time transcription and narrative summarization for tabletop RPG sessions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a session, feeding WAV files in as if they were a live voice
    /// feed, running until every file reaches EOF or Ctrl-C is pressed.
    Run {
        /// Path to the campaign TOML file.
        #[arg(long)]
        campaign: PathBuf,

        /// One audio source per speaker, as `speaker_id:path/to/file.wav`.
        /// Repeat for every speaker in the session.
        #[arg(long = "audio", value_name = "SPEAKER_ID:PATH")]
        audio: Vec<String>,
    },

    /// Replay a fixed set of WAV files as a standalone batch session,
    /// finalizing as soon as every file is exhausted.
    Replay {
        /// Path to the campaign TOML file.
        #[arg(long)]
        campaign: PathBuf,

        /// One audio source per speaker, as `speaker_id:path/to/file.wav`.
        #[arg(long = "audio", value_name = "SPEAKER_ID:PATH")]
        audio: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging().await?;

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Run { campaign, audio } => {
            run_session(config, campaign, audio, true).await?;
        }
        Commands::Replay { campaign, audio } => {
            run_session(config, campaign, audio, false).await?;
        }
    }

    Ok(())
}

async fn run_session(
    config: Config,
    campaign_path: PathBuf,
    audio_args: Vec<String>,
    wait_for_ctrl_c: bool,
) -> Result<()> {
    let campaign_file = CampaignFile::load(&campaign_path)
        .with_context(|| format!("loading campaign file {}", campaign_path.display()))?;
    let campaign = campaign_file.to_context();

    let files = parse_audio_args(&audio_args, &campaign)?;
    let source = Arc::new(FileAudioSource::new(files));

    let storage: Arc<dyn storage::StorageGateway> =
        Arc::new(SqliteStorageGateway::connect(&config.database_path).await?);
    let stt_client = Arc::new(HttpSttClient::new(config.stt_api_key.clone()));
    let llm_client = Arc::new(HttpLlmClient::new(config.llm_api_key.clone()));

    let scribe_session = ScribeSession::start(
        campaign,
        config,
        source,
        AudioSourceTag::File,
        stt_client,
        llm_client,
        storage,
    )
    .await?;

    tracing::info!(session_id = %scribe_session.session_id, "session started");

    if wait_for_ctrl_c {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("ctrl-c received, finalizing session");
            }
            _ = scribe_session.wait_for_source_eof() => {
                tracing::info!("all audio sources reached eof, finalizing session");
            }
        }
    } else {
        scribe_session.wait_for_source_eof().await;
    }

    let summary = scribe_session.finalize().await?;
    println!("{summary}");

    Ok(())
}

/// Parses `speaker_id:path` pairs, resolving each speaker's display name
/// from the campaign's player list (falling back to the speaker id itself
/// for an unregistered speaker, e.g. the DM).
fn parse_audio_args(
    audio_args: &[String],
    campaign: &types::CampaignContext,
) -> Result<Vec<(String, String, PathBuf)>> {
    audio_args
        .iter()
        .map(|arg| {
            let (speaker_id, path) = arg
                .split_once(':')
                .with_context(|| format!("--audio value '{arg}' is not SPEAKER_ID:PATH"))?;
            let speaker_name = campaign
                .players
                .iter()
                .find(|p| p.speaker_id == speaker_id)
                .map(|p| p.speaker_name.clone())
                .unwrap_or_else(|| speaker_id.to_string());
            Ok((speaker_id.to_string(), speaker_name, PathBuf::from(path)))
        })
        .collect()
}

async fn setup_logging() -> Result<()> {
    use tracing_appender::rolling::{RollingFileAppender, Rotation};
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let log_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".rpg-scribe")
        .join("logs");
    std::fs::create_dir_all(&log_dir).context("failed to create log directory")?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "rpg-scribe.log");

    let subscriber = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_filter(
                    EnvFilter::from_default_env()
                        .add_directive("rpg_scribe=debug".parse()?)
                        .add_directive("debug".parse()?),
                ),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true)
                .with_target(false)
                .with_thread_ids(false)
                .compact()
                .with_filter(
                    EnvFilter::from_default_env()
                        .add_directive("rpg_scribe=info".parse()?)
                        .add_directive("warn".parse()?),
                ),
        );

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
