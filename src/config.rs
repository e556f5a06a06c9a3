use anyhow::{Context, Result, bail};
use std::{
    collections::HashMap,
    env, fs,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use crate::engine::EngineOptions;

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DOWNLOADS_DIR: &str = "/tmp/downloads";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_YT_DLP_BIN: &str = "yt-dlp";
pub const DEFAULT_WINDOW_SECS: u64 = 60;
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 2;
pub const DEFAULT_MAX_CONCURRENT_LOOKUPS: usize = 4;
pub const DEFAULT_SEARCH_LIMIT: usize = 20;
pub const DEFAULT_ALLOWED_HOSTS: &[&str] = &["youtube.com", "youtu.be"];

/// Everything the server needs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub downloads_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub yt_dlp_bin: PathBuf,
    /// Explicit `FFMPEG_PATH`; discovery falls back to well-known locations.
    pub ffmpeg_hint: Option<PathBuf>,
    pub resolution_window: Duration,
    pub max_concurrent_downloads: usize,
    /// Searches get their own pool so long downloads cannot starve them.
    pub max_concurrent_lookups: usize,
    pub isolate_task_output: bool,
    pub task_ttl: Option<Duration>,
    pub allowed_hosts: Vec<String>,
    pub search_limit: usize,
    pub engine: EngineOptions,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            downloads_dir: PathBuf::from(DEFAULT_DOWNLOADS_DIR),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            yt_dlp_bin: PathBuf::from(DEFAULT_YT_DLP_BIN),
            ffmpeg_hint: None,
            resolution_window: Duration::from_secs(DEFAULT_WINDOW_SECS),
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            max_concurrent_lookups: DEFAULT_MAX_CONCURRENT_LOOKUPS,
            isolate_task_output: false,
            task_ttl: None,
            allowed_hosts: DEFAULT_ALLOWED_HOSTS.iter().map(|h| h.to_string()).collect(),
            search_limit: DEFAULT_SEARCH_LIMIT,
            engine: EngineOptions::default(),
        }
    }
}

impl RuntimeSettings {
    pub fn bind_address(&self) -> Result<SocketAddr> {
        let ip = self
            .host
            .trim()
            .parse::<IpAddr>()
            .with_context(|| format!("GROOVIFY_HOST {:?} is not an IP address", self.host))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Values supplied on the command line; they beat both the environment and
/// the `.env` file.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub downloads_dir: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_settings_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimeSettings> {
    build_runtime_settings_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeSettings> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);
    let number = |key: &str| lookup(key).and_then(|value| value.parse::<u64>().ok());
    let defaults = RuntimeSettings::default();

    let downloads_dir = overrides
        .downloads_dir
        .or_else(|| lookup("DOWNLOADS_DIR").map(PathBuf::from))
        .unwrap_or(defaults.downloads_dir);
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("GROOVIFY_HOST"))
        .unwrap_or(defaults.host);
    let port = overrides
        .port
        .or_else(|| {
            lookup("GROOVIFY_PORT")
                .or_else(|| lookup("PORT"))
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(defaults.port);

    let resolution_window = number("RESOLUTION_WINDOW_SECS")
        .map(Duration::from_secs)
        .unwrap_or(defaults.resolution_window);
    if resolution_window.is_zero() {
        bail!("RESOLUTION_WINDOW_SECS must be greater than zero");
    }
    let max_concurrent_downloads = number("MAX_CONCURRENT_DOWNLOADS")
        .map(|value| value as usize)
        .unwrap_or(defaults.max_concurrent_downloads);
    if max_concurrent_downloads == 0 {
        bail!("MAX_CONCURRENT_DOWNLOADS must be greater than zero");
    }
    let max_concurrent_lookups = number("MAX_CONCURRENT_LOOKUPS")
        .map(|value| value as usize)
        .unwrap_or(defaults.max_concurrent_lookups);
    if max_concurrent_lookups == 0 {
        bail!("MAX_CONCURRENT_LOOKUPS must be greater than zero");
    }
    let search_limit = number("SEARCH_LIMIT")
        .map(|value| value as usize)
        .unwrap_or(defaults.search_limit);
    if search_limit == 0 {
        bail!("SEARCH_LIMIT must be greater than zero");
    }

    let allowed_hosts = lookup("ALLOWED_HOSTS")
        .map(|value| {
            value
                .split(',')
                .map(|host| host.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|host| !host.is_empty())
                .collect::<Vec<_>>()
        })
        .filter(|hosts| !hosts.is_empty())
        .unwrap_or(defaults.allowed_hosts);

    let engine = EngineOptions {
        retries: number("MAX_RETRIES")
            .map(|value| value as u32)
            .unwrap_or(defaults.engine.retries),
        fragment_retries: number("FRAGMENT_RETRIES")
            .map(|value| value as u32)
            .unwrap_or(defaults.engine.fragment_retries),
        socket_timeout: number("REQUEST_TIMEOUT")
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.engine.socket_timeout),
        concurrent_fragments: number("CONCURRENT_FRAGMENTS")
            .filter(|count| *count > 0)
            .map(|value| value as u32)
            .unwrap_or(defaults.engine.concurrent_fragments),
        ..defaults.engine
    };

    Ok(RuntimeSettings {
        downloads_dir,
        host,
        port,
        yt_dlp_bin: lookup("YT_DLP_BIN")
            .map(PathBuf::from)
            .unwrap_or(defaults.yt_dlp_bin),
        ffmpeg_hint: lookup("FFMPEG_PATH").map(PathBuf::from),
        resolution_window,
        max_concurrent_downloads,
        max_concurrent_lookups,
        isolate_task_output: lookup("ISOLATE_TASK_OUTPUT")
            .map(|value| parse_flag(&value))
            .unwrap_or(false),
        task_ttl: number("TASK_TTL_SECS")
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs),
        allowed_hosts,
        search_limit,
        engine,
    })
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn settings_from(contents: &str) -> RuntimeSettings {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_runtime_settings(&vars, |_| None).unwrap()
    }

    #[test]
    fn empty_config_uses_defaults() {
        let settings = settings_from("");
        assert_eq!(settings.downloads_dir, PathBuf::from(DEFAULT_DOWNLOADS_DIR));
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(settings.host, DEFAULT_HOST);
        assert_eq!(settings.resolution_window, Duration::from_secs(60));
        assert_eq!(settings.max_concurrent_downloads, 2);
        assert_eq!(settings.max_concurrent_lookups, 4);
        assert_eq!(settings.allowed_hosts, vec!["youtube.com", "youtu.be"]);
        assert!(!settings.isolate_task_output);
        assert!(settings.task_ttl.is_none());
        assert_eq!(settings.engine, EngineOptions::default());
    }

    #[test]
    fn file_values_are_applied() {
        let settings = settings_from(
            "DOWNLOADS_DIR=\"/srv/music\"\nGROOVIFY_PORT=\"4242\"\nRESOLUTION_WINDOW_SECS=90\n\
             ISOLATE_TASK_OUTPUT=yes\nTASK_TTL_SECS=3600\nALLOWED_HOSTS=\"youtube.com, .music.youtube.com\"\n\
             MAX_RETRIES=9\nREQUEST_TIMEOUT=12\nFFMPEG_PATH=/opt/ffmpeg/bin\n",
        );
        assert_eq!(settings.downloads_dir, PathBuf::from("/srv/music"));
        assert_eq!(settings.port, 4242);
        assert_eq!(settings.resolution_window, Duration::from_secs(90));
        assert!(settings.isolate_task_output);
        assert_eq!(settings.task_ttl, Some(Duration::from_secs(3600)));
        assert_eq!(settings.allowed_hosts, vec!["youtube.com", "music.youtube.com"]);
        assert_eq!(settings.engine.retries, 9);
        assert_eq!(settings.engine.socket_timeout, Duration::from_secs(12));
        assert_eq!(settings.ffmpeg_hint, Some(PathBuf::from("/opt/ffmpeg/bin")));
    }

    #[test]
    fn plain_port_is_a_fallback() {
        assert_eq!(settings_from("PORT=9000\n").port, 9000);
        assert_eq!(settings_from("PORT=9000\nGROOVIFY_PORT=9100\n").port, 9100);
    }

    #[test]
    fn env_beats_file() {
        let vars = read_env_file(make_config("DOWNLOADS_DIR=\"/file\"\n").path()).unwrap();
        let settings = build_runtime_settings(&vars, |key| {
            if key == "DOWNLOADS_DIR" {
                Some("/env".to_string())
            } else {
                None
            }
        })
        .unwrap();
        assert_eq!(settings.downloads_dir, PathBuf::from("/env"));
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export DOWNLOADS_DIR="/media"
            YT_DLP_BIN='/usr/local/bin/yt-dlp'
            GROOVIFY_HOST =  "0.0.0.0"
            GROOVIFY_PORT=9090
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("DOWNLOADS_DIR").unwrap(), "/media");
        assert_eq!(vars.get("YT_DLP_BIN").unwrap(), "/usr/local/bin/yt-dlp");
        assert_eq!(vars.get("GROOVIFY_HOST").unwrap(), "0.0.0.0");
        assert_eq!(vars.get("GROOVIFY_PORT").unwrap(), "9090");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn override_precedence() {
        let mut vars = HashMap::new();
        vars.insert("DOWNLOADS_DIR".to_string(), "/file-downloads".to_string());
        vars.insert("GROOVIFY_HOST".to_string(), "file-host".to_string());
        vars.insert("GROOVIFY_PORT".to_string(), "7000".to_string());

        let overrides = RuntimeOverrides {
            downloads_dir: Some(PathBuf::from("/override")),
            host: None,
            port: Some(9000),
            env_path: None,
        };
        let settings = build_runtime_settings_with_overrides(
            &vars,
            |key| {
                if key == "GROOVIFY_HOST" {
                    Some("0.0.0.0".to_string())
                } else if key == "GROOVIFY_PORT" {
                    Some("8001".to_string())
                } else {
                    None
                }
            },
            overrides,
        )
        .unwrap();

        assert_eq!(settings.downloads_dir, PathBuf::from("/override"));
        assert_eq!(settings.host, "0.0.0.0");
        assert_eq!(settings.port, 9000);
        assert_eq!(
            settings.bind_address().unwrap(),
            SocketAddr::from(([0, 0, 0, 0], 9000))
        );
    }

    #[test]
    fn bind_address_needs_an_ip_host() {
        let settings = RuntimeSettings {
            host: "localhost".into(),
            ..RuntimeSettings::default()
        };
        assert!(settings.bind_address().is_err());
    }

    #[test]
    fn blank_host_override_is_ignored() {
        let settings = build_runtime_settings_with_overrides(
            &HashMap::new(),
            |_| None,
            RuntimeOverrides {
                host: Some("   ".into()),
                ..RuntimeOverrides::default()
            },
        )
        .unwrap();
        assert_eq!(settings.host, DEFAULT_HOST);
    }

    #[test]
    fn unparseable_numbers_fall_back_to_defaults() {
        let settings = settings_from("GROOVIFY_PORT=nope\nSEARCH_LIMIT=many\nMAX_RETRIES=-1\n");
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(settings.search_limit, DEFAULT_SEARCH_LIMIT);
        assert_eq!(settings.engine.retries, 5);
    }

    #[test]
    fn zero_sizes_are_rejected() {
        for contents in [
            "RESOLUTION_WINDOW_SECS=0\n",
            "MAX_CONCURRENT_DOWNLOADS=0\n",
            "MAX_CONCURRENT_LOOKUPS=0\n",
            "SEARCH_LIMIT=0\n",
        ] {
            let vars = read_env_file(make_config(contents).path()).unwrap();
            assert!(build_runtime_settings(&vars, |_| None).is_err(), "{contents}");
        }
    }
}
