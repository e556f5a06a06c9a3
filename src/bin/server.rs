#![forbid(unsafe_code)]

//! HTTP server entry point: resolves settings, checks the engine and serves
//! the API until Ctrl+C.

use std::{
    net::IpAddr,
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use groovify_server::{
    api::{AppState, router},
    config::{RuntimeOverrides, resolve_runtime_settings},
    engine::{YtDlpEngine, locate_ffmpeg},
    files::DownloadsDir,
    security::ensure_not_root,
    service::DownloadService,
    tasks::{InMemoryTaskStore, SystemClock, TaskStore, spawn_sweeper},
};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "groovify_server=info,server=info";

#[derive(Debug, Clone, Default, PartialEq)]
struct ServerArgs {
    downloads_dir: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    env_file: Option<PathBuf>,
}

impl ServerArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut parsed = Self::default();
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--downloads-dir=") {
                parsed.downloads_dir = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--host=") {
                parsed.host = Some(parse_host_arg(value)?.to_string());
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                parsed.port = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--env-file=") {
                parsed.env_file = Some(PathBuf::from(value));
                continue;
            }

            match arg.as_str() {
                "--downloads-dir" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--downloads-dir requires a value"))?;
                    parsed.downloads_dir = Some(PathBuf::from(value));
                }
                "--host" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--host requires a value"))?;
                    parsed.host = Some(parse_host_arg(&value)?.to_string());
                }
                "--port" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--port requires a value"))?;
                    parsed.port = Some(parse_port_arg(&value)?);
                }
                "--env-file" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--env-file requires a value"))?;
                    parsed.env_file = Some(PathBuf::from(value));
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }
        Ok(parsed)
    }

    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            downloads_dir: self.downloads_dir,
            host: self.host,
            port: self.port,
            env_path: self.env_file,
        }
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .trim()
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/GROOVIFY_HOST")
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = ServerArgs::parse()?;
    ensure_not_root("server")?;

    let mut settings = resolve_runtime_settings(args.into_overrides())?;
    let addr = settings.bind_address()?;

    DownloadsDir::new(&settings.downloads_dir)
        .ensure()
        .with_context(|| format!("creating {}", settings.downloads_dir.display()))?;

    settings.engine.ffmpeg_location = locate_ffmpeg(settings.ffmpeg_hint.as_deref());
    match &settings.engine.ffmpeg_location {
        Some(path) => info!(ffmpeg = %path.display(), "using ffmpeg"),
        None => warn!("ffmpeg not found; audio conversion will fail until it is installed"),
    }

    let engine = YtDlpEngine::new(&settings.yt_dlp_bin, settings.engine.socket_timeout);
    let probe = engine.clone();
    match tokio::task::spawn_blocking(move || probe.check_available()).await {
        Ok(Ok(version)) => info!(%version, program = %engine.program().display(), "yt-dlp ready"),
        Ok(Err(err)) => warn!(%err, "yt-dlp is not usable; downloads will fail"),
        Err(err) => warn!(%err, "yt-dlp probe did not finish"),
    }

    let settings = Arc::new(settings);
    let clock = Arc::new(SystemClock);
    let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new(clock.clone()));
    if let Some(ttl) = settings.task_ttl {
        info!(ttl_secs = ttl.as_secs(), "evicting finished tasks");
        spawn_sweeper(store.clone(), clock, ttl);
    }

    let service = DownloadService::new(Arc::new(engine), store, settings.clone());
    let app = router(AppState::new(service));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(
        %addr,
        downloads = %settings.downloads_dir.display(),
        workers = settings.max_concurrent_downloads,
        isolate = settings.isolate_task_output,
        "server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running server")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(%err, "failed to install Ctrl+C handler");
    }
    info!("shutting down");
}
