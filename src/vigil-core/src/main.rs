//! Vigil - multi-stream video safety monitoring CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use vigil_ai::DEFAULT_PROMPT_TEMPLATE;
use vigil_capture::{FfmpegSource, FrameStream, RetryPolicy, SourceLocator};
use vigil_core::settings::SETTINGS_FILE;
use vigil_core::{AnalysisScheduler, ReidStore, Settings, StreamManager};
use vigil_db::Database;
use vigil_web::AppState;

const DATABASE_FILE: &str = "vigil.db";

#[derive(Parser)]
#[command(name = "vigil")]
#[command(about = "Multi-stream video capture with AI safety analysis")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory for the database and settings
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture and analyse all configured streams
    Run {
        /// Web server port
        #[arg(short, long, default_value = "5001")]
        port: u16,

        /// Do not start the web server
        #[arg(long)]
        no_web: bool,
    },

    /// Add a stream (rtsp/rtmp/http/https url or camera index)
    Add {
        url: String,

        /// Prompt template name
        #[arg(short, long, default_value = DEFAULT_PROMPT_TEMPLATE)]
        template: String,
    },

    /// Remove a stream and its results
    Remove { id: i64 },

    /// List configured streams
    List,

    /// Assign a prompt template to a stream
    SetTemplate { id: i64, name: String },

    /// Show recent analysis results
    Results {
        /// Only this stream
        #[arg(short, long)]
        stream: Option<i64>,

        /// Maximum number of results
        #[arg(short, long, default_value = "10")]
        limit: i64,
    },

    /// Read frames from a source to test it
    Probe {
        url: String,

        /// Frames to read
        #[arg(short, long, default_value = "1")]
        frames: usize,

        /// Save the last frame as JPEG
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check dependencies (FFmpeg, credentials)
    Check,

    /// Show or change settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective settings
    Show,

    /// Set the AI endpoint
    SetAi {
        model: String,
        api_key: String,

        #[arg(long)]
        api_base: Option<String>,
    },

    /// Set seconds between analysis cycles
    SetInterval { secs: u64 },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let settings_path = cli.config.clone().unwrap_or_else(|| match &cli.data_dir {
        Some(dir) => dir.join(SETTINGS_FILE),
        None => Settings::default_path(),
    });
    let settings = Settings::load_or_default(&settings_path)?;
    let data_dir = cli
        .data_dir
        .clone()
        .unwrap_or_else(|| settings.resolve_data_dir());

    match cli.command {
        Commands::Run { port, no_web } => {
            cmd_run(settings, data_dir, port, !no_web)?;
        }
        Commands::Add { url, template } => {
            cmd_add(&data_dir, &url, &template)?;
        }
        Commands::Remove { id } => {
            cmd_remove(&data_dir, id)?;
        }
        Commands::List => {
            cmd_list(&data_dir)?;
        }
        Commands::SetTemplate { id, name } => {
            cmd_set_template(&settings, &data_dir, id, &name)?;
        }
        Commands::Results { stream, limit } => {
            cmd_results(&data_dir, stream, limit)?;
        }
        Commands::Probe { url, frames, output } => {
            cmd_probe(&url, frames, output)?;
        }
        Commands::Check => {
            cmd_check(&settings, &data_dir)?;
        }
        Commands::Config { action } => {
            cmd_config(settings, &settings_path, action)?;
        }
    }

    Ok(())
}

fn open_database(data_dir: &Path) -> Result<Database> {
    let db_path = data_dir.join(DATABASE_FILE);
    Database::open(&db_path).with_context(|| format!("failed to open database {:?}", db_path))
}

#[tokio::main]
async fn cmd_run(settings: Settings, data_dir: PathBuf, port: u16, web: bool) -> Result<()> {
    info!("starting vigil");
    info!("data directory: {:?}", data_dir);

    if !vigil_capture::check_ffmpeg() || !vigil_capture::check_ffprobe() {
        warn!("ffmpeg/ffprobe not found in PATH, streams will fail to open");
    }
    if settings.ai.api_key.is_empty() {
        warn!("no ai api key configured, set one with 'vigil config set-ai'");
    }

    let db = open_database(&data_dir)?;
    let records = vigil_db::get_all_streams(db.connection())?;
    let people = vigil_db::get_person_features(db.connection())?;
    let db = Arc::new(Mutex::new(db.into_connection()));

    let reid = Arc::new(ReidStore::new());
    let restored = reid.hydrate(people);
    if restored > 0 {
        info!("restored {} tracked person(s)", restored);
    }

    let manager = Arc::new(StreamManager::new(
        Arc::new(FfmpegSource::default()),
        settings.manager_config(),
        settings.analysis_settings(),
    ));
    for record in records {
        manager.add_stream_config(record.into());
    }
    if manager.stream_ids().is_empty() {
        warn!("no streams configured, add one with 'vigil add <url>'");
    }
    manager.start_all_streams();

    let scheduler = AnalysisScheduler::new(
        manager.clone(),
        reid,
        db.clone(),
        settings.prompt_library(),
        settings.scheduler_config(),
    );

    let mut events = scheduler.subscribe();
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => debug!(
                    "result for stream {} ({}) {}: {}",
                    event.stream_id,
                    event.source_url,
                    event.frame_name,
                    event.result.to_json()
                ),
                Err(RecvError::Lagged(skipped)) => warn!("result log skipped {} event(s)", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Setup signal handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("received shutdown signal");
        r.store(false, Ordering::SeqCst);
    })?;

    let (web_shutdown, web_signal) = tokio::sync::oneshot::channel::<()>();
    let web_task = web.then(|| {
        let state = AppState::new(db.clone(), manager.clone());
        tokio::spawn(async move {
            let shutdown = async move {
                let _ = web_signal.await;
            };
            if let Err(e) = vigil_web::serve(state, port, shutdown).await {
                error!("web server error: {:#}", e);
            }
        })
    });

    scheduler.start_processing();
    let runner = scheduler.clone();
    let scheduler_task = tokio::spawn(async move { runner.run().await });

    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    info!("shutting down");
    scheduler.stop_processing();
    if let Err(e) = scheduler_task.await {
        error!("analysis scheduler task failed: {}", e);
    }

    let _ = web_shutdown.send(());
    if let Some(task) = web_task {
        if let Err(e) = task.await {
            error!("web server task failed: {}", e);
        }
    }

    let stop = manager.stop_all_streams();
    let summary = tokio::task::spawn_blocking(move || stop.wait()).await?;
    if summary.abandoned > 0 {
        warn!("{} stream worker(s) could not be terminated", summary.abandoned);
    }

    event_log.abort();
    info!("vigil stopped");
    Ok(())
}

fn cmd_add(data_dir: &Path, url: &str, template: &str) -> Result<()> {
    SourceLocator::parse(url).with_context(|| format!("invalid stream source '{}'", url))?;

    let db = open_database(data_dir)?;
    let id = vigil_db::add_stream(db.connection(), url.trim(), template)?;

    println!("added stream {}: {} (template {})", id, url.trim(), template);
    Ok(())
}

fn cmd_remove(data_dir: &Path, id: i64) -> Result<()> {
    let db = open_database(data_dir)?;
    if vigil_db::remove_stream(db.connection(), id)? {
        println!("removed stream {}", id);
    } else {
        println!("no stream with id {}", id);
    }
    Ok(())
}

fn cmd_list(data_dir: &Path) -> Result<()> {
    let db = open_database(data_dir)?;
    let streams = vigil_db::get_all_streams(db.connection())?;

    if streams.is_empty() {
        println!("no streams configured");
        return Ok(());
    }

    println!("{} stream(s):\n", streams.len());
    for stream in streams {
        let results = vigil_db::count_analysis_results(db.connection(), stream.id)?;
        println!("  [{}] {}", stream.id, stream.url);
        println!("      template: {}", stream.prompt_template);
        println!("      added:    {}", stream.added_time.format("%Y-%m-%d %H:%M:%S"));
        println!("      results:  {}", results);
    }
    Ok(())
}

fn cmd_set_template(settings: &Settings, data_dir: &Path, id: i64, name: &str) -> Result<()> {
    if settings.prompt_library().get(name).is_none() {
        warn!(
            "unknown prompt template '{}', analysis will fall back to '{}'",
            name, settings.analysis.default_prompt
        );
    }

    let db = open_database(data_dir)?;
    vigil_db::set_stream_prompt_template(db.connection(), id, name)?;
    println!("stream {} now uses template {}", id, name);
    Ok(())
}

fn cmd_results(data_dir: &Path, stream: Option<i64>, limit: i64) -> Result<()> {
    let db = open_database(data_dir)?;
    let results = vigil_db::recent_analysis_results(db.connection(), stream, limit.max(1))?;

    if results.is_empty() {
        println!("no analysis results");
        return Ok(());
    }

    for result in results {
        let violation = result
            .result
            .get("violation_detected")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        println!(
            "{} stream {}{}",
            result.timestamp.format("%Y-%m-%d %H:%M:%S"),
            result.stream_id,
            if violation { " VIOLATION" } else { "" }
        );
        println!("   {}", result.result);
    }
    Ok(())
}

fn cmd_probe(url: &str, frames: usize, output: Option<PathBuf>) -> Result<()> {
    let locator =
        SourceLocator::parse(url).with_context(|| format!("invalid stream source '{}'", url))?;
    info!("probing {:?}", locator);

    let mut stream = FrameStream::new(
        Arc::new(FfmpegSource::default()),
        url.trim(),
        RetryPolicy::default(),
    );

    let mut last = None;
    for (i, frame) in stream.by_ref().take(frames.max(1)).enumerate() {
        println!(
            "frame {}: {}x{} captured at {}",
            i + 1,
            frame.width(),
            frame.height(),
            frame.captured_at().format("%H:%M:%S%.3f")
        );
        last = Some(frame);
    }

    let Some(frame) = last else {
        return Err(match stream.exhaustion_error() {
            Some(e) => anyhow::Error::from(e),
            None => anyhow::anyhow!("no frames read from {}", url),
        });
    };

    if let Some(path) = output {
        frame.save_jpeg(&path, 85)?;
        println!("saved snapshot to {:?}", path);
    }
    Ok(())
}

fn cmd_check(settings: &Settings, data_dir: &Path) -> Result<()> {
    println!("checking dependencies...\n");

    let ffmpeg_ok = vigil_capture::check_ffmpeg();
    let ffprobe_ok = vigil_capture::check_ffprobe();
    let key_ok = !settings.ai.api_key.is_empty();

    println!("  ffmpeg:  {}", if ffmpeg_ok { "OK" } else { "NOT FOUND" });
    println!("  ffprobe: {}", if ffprobe_ok { "OK" } else { "NOT FOUND" });
    println!("  ai key:  {}", if key_ok { "configured" } else { "missing" });
    println!("  ai base: {}", settings.ai.api_base);
    println!("  data:    {:?}", data_dir);

    println!();

    if !ffmpeg_ok || !ffprobe_ok {
        println!("WARNING: FFmpeg and FFprobe are required to decode streams.");
        println!("Please install FFmpeg and ensure it's in your PATH.");
    }
    if !key_ok {
        println!("WARNING: set an API key with 'vigil config set-ai <model> <key>'.");
    }
    if ffmpeg_ok && ffprobe_ok && key_ok {
        println!("all checks passed!");
    }

    Ok(())
}

fn cmd_config(mut settings: Settings, path: &Path, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            if !settings.ai.api_key.is_empty() {
                settings.ai.api_key = mask_key(&settings.ai.api_key);
            }
            println!("# {:?}", path);
            print!("{}", toml::to_string_pretty(&settings)?);
        }
        ConfigAction::SetAi {
            model,
            api_key,
            api_base,
        } => {
            settings.ai.model = model;
            settings.ai.api_key = api_key;
            if let Some(base) = api_base {
                settings.ai.api_base = base;
            }
            settings.save(path)?;
            println!("ai settings saved to {:?}", path);
        }
        ConfigAction::SetInterval { secs } => {
            if secs == 0 {
                anyhow::bail!("analysis interval must be at least one second");
            }
            settings.general.analysis_interval_secs = secs;
            settings.save(path)?;
            println!("analysis interval set to {}s", secs);
        }
    }
    Ok(())
}

fn mask_key(key: &str) -> String {
    let visible: String = key.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
    format!("****{}", visible)
}
