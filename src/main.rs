use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;

use mediavault::config::{load_config, validate_config, Config};
use mediavault::models::DeliveryMode;
use mediavault::paths::{ensure_dir, resolve_config_path, BaseRoots, EnginePaths};
use mediavault::run::{RunManager, RunOptions};
use mediavault::scheduler::Scheduler;
use mediavault::search::SearchResolutionService;
use mediavault::search_adapters::default_registry;
use mediavault::server::{self, ServerCtx};
use mediavault::status::{EngineStatus, StopEvent};
use mediavault::tools::ToolUpdater;
use mediavault::{db::HistoryStore, jobs::JobStore};

const ENV_CONFIG: &str = "MEDIAVAULT_CONFIG";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Self-hosted media archiver powered by yt-dlp.
#[derive(Debug, Parser)]
#[command(name = "mediavault", about, disable_version_flag = true)]
struct Cli {
    /// Config file (under the config root; defaults to config.json).
    #[arg(long)]
    config: Option<String>,

    /// Download a single URL and exit (no playlist scan).
    #[arg(long)]
    single_url: Option<String>,

    /// Destination directory for --single-url downloads.
    #[arg(long)]
    destination: Option<String>,

    /// Override final format/container (e.g. mp3, mp4, webm, mkv).
    #[arg(long = "format")]
    final_format: Option<String>,

    /// Force JS runtime (e.g. node:/usr/bin/node or deno:/usr/bin/deno).
    #[arg(long = "js-runtime")]
    js_runtime: Option<String>,

    /// Run the HTTP API server instead of a one-shot archive run.
    #[arg(long)]
    serve: bool,

    /// Show runtime/build info as JSON and exit.
    #[arg(long)]
    version: bool,
}

/// Writes each log record to stderr and the archiver log file, which backs
/// `GET /api/logs`.
struct TeeWriter {
    file: Mutex<std::fs::File>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let _ = std::io::stderr().write_all(buf);
        if let Ok(mut file) = self.file.lock() {
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let _ = std::io::stderr().flush();
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
        Ok(())
    }
}

fn setup_logging(log_path: &std::path::Path) {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path);
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    );
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] {}",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S"),
            record.level(),
            record.args()
        )
    });
    match file {
        Ok(file) => {
            builder.target(env_logger::Target::Pipe(Box::new(TeeWriter {
                file: Mutex::new(file),
            })));
        }
        Err(err) => eprintln!("warning: cannot open log file {}: {err}", log_path.display()),
    }
    builder.init();
}

fn spawn_signal_handler(stop: StopEvent) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut interrupt =
                signal(SignalKind::interrupt()).expect("install SIGINT handler");
            let mut terminate =
                signal(SignalKind::terminate()).expect("install SIGTERM handler");
            tokio::select! {
                _ = interrupt.recv() => log::warn!("SIGINT received; stopping after current operation"),
                _ = terminate.recv() => log::warn!("SIGTERM received; stopping after current operation"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            log::warn!("Ctrl-C received; stopping after current operation");
        }
        stop.set();
    });
}

fn load_config_or_default(path: &std::path::Path) -> Config {
    if !path.exists() {
        log::warn!("Config file not found at {}; using defaults", path.display());
        return Config::default();
    }
    match load_config(path) {
        Ok(config) => {
            for error in validate_config(&config) {
                log::error!("Config problem: {error}");
            }
            config
        }
        Err(err) => {
            log::error!("Failed to load config: {err:#}");
            Config::default()
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let roots = match BaseRoots::from_env() {
        Ok(roots) => roots,
        Err(err) => {
            eprintln!("error: {err:#}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = roots.ensure_dirs() {
        eprintln!("error: {err:#}");
        return ExitCode::FAILURE;
    }
    let paths = EnginePaths::build(&roots);
    for dir in [
        &paths.temp_downloads_dir,
        &paths.ytdlp_temp_dir,
        &paths.tools_dir,
    ] {
        let _ = ensure_dir(dir);
    }

    let log_path = paths.log_dir.join("mediavault.log");
    setup_logging(&log_path);

    if cli.version {
        let info = mediavault::tools::runtime_info(&paths.tools_dir).await;
        println!("{}", serde_json::to_string_pretty(&info).unwrap_or_default());
        return ExitCode::SUCCESS;
    }

    let config_path = {
        let requested = cli
            .config
            .clone()
            .or_else(|| std::env::var(ENV_CONFIG).ok());
        match resolve_config_path(requested.as_deref(), &roots.config) {
            Ok(path) => path,
            Err(err) => {
                log::error!("Invalid config path: {err}");
                return ExitCode::FAILURE;
            }
        }
    };

    let stop = StopEvent::new();
    spawn_signal_handler(stop.clone());

    let status = EngineStatus::new();
    let manager = RunManager::new(roots.clone(), paths.clone(), status, stop.clone());

    if cli.serve {
        return serve(manager, paths, config_path, log_path, stop).await;
    }

    // One-shot archive run (single URL or full playlist pass).
    let config = load_config_or_default(&config_path);
    let opts = RunOptions {
        single_url: cli.single_url.clone(),
        destination: cli.destination,
        final_format_override: cli.final_format,
        js_runtime_override: cli.js_runtime,
        delivery_mode: DeliveryMode::Server,
        run_source: "manual",
    };

    if let Err(err) = manager.run_archive(config, opts).await {
        log::error!("Run failed: {err:#}");
        return ExitCode::FAILURE;
    }

    if stop.is_set() {
        log::warn!("Stopped by signal");
        return ExitCode::from(130);
    }
    if cli.single_url.is_some() {
        let ok = manager
            .status
            .snapshot()
            .single_download_ok
            .unwrap_or(false);
        if !ok {
            return ExitCode::FAILURE;
        }
    }
    ExitCode::SUCCESS
}

async fn serve(
    manager: Arc<RunManager>,
    paths: EnginePaths,
    config_path: PathBuf,
    log_path: PathBuf,
    stop: StopEvent,
) -> ExitCode {
    let scheduler = Arc::new(Scheduler::new(HistoryStore::new(&paths.db_path)));
    let search = Arc::new(SearchResolutionService::new(
        paths.search_db_path.clone(),
        JobStore::new(&paths.db_path),
        default_registry(),
        manager.roots.downloads.clone(),
    ));
    let updater = ToolUpdater::new(paths.tools_dir.clone());

    let ctx = ServerCtx::new(
        manager,
        scheduler,
        search,
        updater,
        stop.clone(),
        config_path,
        log_path,
    );

    // Wire the interval trigger from the startup config; run_on_startup
    // dispatches once at process start only.
    if let Ok(config) = ctx.load_valid_config() {
        let schedule = config.schedule_or_default();
        server::apply_schedule(&ctx, &schedule);
        if schedule.enabled && schedule.run_on_startup {
            let startup_ctx = Arc::clone(&ctx);
            tokio::spawn(async move {
                server::startup_kick(startup_ctx).await;
            });
        }
    }

    server::spawn_resolver_loop(Arc::clone(&ctx));

    let result = server::serve(Arc::clone(&ctx)).await;
    ctx.scheduler.shutdown();

    // Give an active run a bounded window to observe the stop event.
    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    while ctx.manager.is_running() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    if ctx.manager.is_running() {
        log::warn!("Shutdown timeout while waiting for archive run to stop");
    }

    match result {
        Ok(()) => {
            if stop.is_set() {
                ExitCode::from(130)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(err) => {
            log::error!("Server failed: {err:#}");
            ExitCode::FAILURE
        }
    }
}
