use std::io::{self, BufRead, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use portrait_stage::backend::HttpBackend;
use portrait_stage::config::Configuration;
use portrait_stage::events::{BackgroundLoaded, InvalidImage, LoadBackground, StageEvent};
use portrait_stage::pointer::PointerTracker;
use portrait_stage::stage::{Backends, InitialData, Stage};
use portrait_stage::stage_model::{CharacterId, CharacterProfile, ChatMessage, PersistedState};
use portrait_stage::store::ImageLookup;
use portrait_stage::tasks;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "portrait-stage",
    version,
    about = "Preview host for the portrait stage"
)]
struct Args {
    /// Path to YAML config
    #[arg(value_name = "CONFIG")]
    config: PathBuf,
    /// YAML list of character profiles
    #[arg(long, value_name = "FILE")]
    roster: Option<PathBuf>,
    /// Persisted chat/message state (JSON); read at startup, written on exit
    #[arg(long, value_name = "FILE")]
    state: Option<PathBuf>,
    /// Show this background instead of the persisted one
    #[arg(long, value_name = "URL")]
    background: Option<String>,
    /// Depth map for --background
    #[arg(long, value_name = "URL", requires = "background")]
    depth: Option<String>,
    /// Run without a window; stdin lines of the form `author: text` are fed
    /// to the stage as replies
    #[arg(long)]
    headless: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // init tracing (RUST_LOG controls level, default = info)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let Args {
        config,
        roster,
        state,
        background,
        depth,
        headless,
    } = Args::parse();

    let cfg = Configuration::from_yaml_file(&config)
        .with_context(|| format!("failed to load configuration from {}", config.display()))?
        .validated()
        .context("invalid configuration values")?;
    tracing::debug!("loaded configuration from {}:\n{:#?}", config.display(), cfg);

    let characters = match &roster {
        Some(path) => read_roster(path)?,
        None => Vec::new(),
    };
    let persisted = match &state {
        Some(path) if path.exists() => read_state(path)?,
        _ => PersistedState::default(),
    };
    tracing::info!(characters = characters.len(), "starting stage");

    let backend = Arc::new(HttpBackend::new(&cfg.backend).context("failed to build backend client")?);
    let backends = Backends {
        generator: backend.clone(),
        classifier: Some(backend),
    };

    let mut stage = Stage::new(
        cfg.clone(),
        InitialData {
            characters,
            state: persisted,
        },
        backends,
    );
    let pointer = PointerTracker::new(cfg.pointer.clone());
    if !headless {
        stage = stage.with_pointer(pointer.subscribe());
    }

    let events = stage.subscribe();
    let load = stage.load();
    tracing::info!(success = load.success, "stage load finished");

    if let Some(url) = background {
        let mut message = stage.snapshot().message;
        message.background.url = Some(url);
        message.background.depth_url = depth;
        stage.set_state(message);
    }

    let (to_load_tx, to_load_rx) = mpsc::channel::<LoadBackground>(4); // Stage -> Loader
    let (invalid_tx, invalid_rx) = mpsc::channel::<InvalidImage>(16); // Loader -> Bridge
    let (loaded_tx, loaded_rx) = mpsc::channel::<BackgroundLoaded>(2); // Loader -> Viewer

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!("ctrl-c handler failed: {err}");
                return;
            }
            tracing::info!("ctrl-c received; initiating shutdown");
            cancel.cancel();
        });
    }

    let mut tasks = JoinSet::new();

    // BackgroundLoader
    tasks.spawn({
        let client = reqwest::Client::builder()
            .timeout(cfg.backend.timeout)
            .build()
            .context("failed to build image client")?;
        let loader = tasks::loader::BackgroundLoader::new(client);
        let cancel = cancel.clone();
        async move {
            tasks::loader::run(loader, to_load_rx, invalid_tx, loaded_tx, cancel)
                .await
                .context("loader task failed")
        }
    });

    // Stage events -> loader requests
    if let Some(initial) = LoadBackground::from_state(&stage.store().background_state()) {
        let _ = to_load_tx.send(initial).await;
    }
    tasks.spawn({
        let cancel = cancel.clone();
        async move {
            bridge_events(events, invalid_rx, to_load_tx, cancel)
                .await
                .context("event bridge failed")
        }
    });

    if headless {
        run_headless(&stage, cancel.clone()).await;
    } else if let Err(e) =
        tasks::viewer::run_windowed(loaded_rx, pointer, cancel.clone(), cfg.parallax.clone())
            .context("viewer failed")
    {
        tracing::error!("{e:?}");
    }
    cancel.cancel();

    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("task error: {e:?}"),
            Err(e) => tracing::error!("join error: {e}"),
        }
    }

    if let Some(path) = &state {
        write_state(path, &stage.snapshot())?;
        tracing::info!(path = %path.display(), "state saved");
    }
    stage.shutdown().await.context("stage shutdown failed")?;
    Ok(())
}

fn read_roster(path: &Path) -> Result<Vec<CharacterProfile>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read roster {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("invalid roster {}", path.display()))
}

fn read_state(path: &Path) -> Result<PersistedState> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read state {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid state {}", path.display()))
}

fn write_state(path: &Path, state: &PersistedState) -> Result<()> {
    let json = serde_json::to_string_pretty(state)?;
    std::fs::write(path, json).with_context(|| format!("failed to write state {}", path.display()))
}

/// Forward background changes to the loader and report undecodable images.
async fn bridge_events(
    mut events: broadcast::Receiver<StageEvent>,
    mut invalid_rx: mpsc::Receiver<InvalidImage>,
    to_load: mpsc::Sender<LoadBackground>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Ok(StageEvent::BackgroundChanged(state)) => {
                    if let Some(request) = LoadBackground::from_state(&state) {
                        if to_load.send(request).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(StageEvent::PackUpdated { key, emotion, url }) => {
                    tracing::info!(character = %key.character, outfit = %key.outfit, %emotion, %url, "image ready");
                }
                Ok(StageEvent::EmotionChanged { .. }) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "event bridge lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            Some(InvalidImage(url)) = invalid_rx.recv() => {
                tracing::warn!(%url, "background could not be displayed");
            }
        }
    }
    Ok(())
}

fn parse_line(line: &str) -> Option<ChatMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (author, content) = line.split_once(':')?;
    Some(ChatMessage {
        author: CharacterId::new(author.trim()),
        content: content.trim().to_string(),
        is_bot: true,
    })
}

async fn run_headless(stage: &Stage, cancel: CancellationToken) {
    let (line_tx, mut line_rx) = mpsc::channel::<String>(16);
    let interactive = io::stdin().is_terminal();
    tokio::task::spawn_blocking(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if line_tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!("stdin read failed: {err}");
                    break;
                }
            }
        }
    });
    if interactive {
        tracing::info!("reading `author: text` replies from stdin; ctrl-d to finish");
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            line = line_rx.recv() => {
                let Some(line) = line else { break };
                let Some(message) = parse_line(&line) else {
                    tracing::warn!(%line, "expected `author: text`");
                    continue;
                };
                stage.after_response(&message).await;
                for pose in stage.render().speakers {
                    tracing::info!(
                        character = %pose.character,
                        emotion = %pose.emotion,
                        x = pose.placement.x_vw,
                        speaking = pose.placement.speaking,
                        image = %pose.image_url,
                        "speaker"
                    );
                }
            }
        }
    }
}
