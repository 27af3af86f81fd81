#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::resolve::MirrorEndpoint;

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
pub const DEFAULT_EXTRACTOR_TIMEOUT_SECS: u64 = 45;
pub const DEFAULT_MIRROR_TIMEOUT_SECS: u64 = 8;
pub const DEFAULT_MIRROR_MAX_ATTEMPTS: usize = 5;
pub const DEFAULT_UPSTREAM_CONNECT_TIMEOUT_SECS: u64 = 15;

/// Everything the server needs, loaded once at start-up and shared read-only
/// by every request.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub port: u16,
    pub host: String,
    pub www_root: Option<PathBuf>,
    pub ytdlp_bin: PathBuf,
    pub ytdlp_cookies: Option<PathBuf>,
    pub extractor_timeout: Duration,
    pub mirrors: Vec<MirrorEndpoint>,
    pub mirror_timeout: Duration,
    pub mirror_max_attempts: usize,
    /// Shuffle the pool per request; `false` keeps the configured order.
    pub mirror_shuffle: bool,
    pub upstream_connect_timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub port: Option<u16>,
    pub host: Option<String>,
    pub www_root: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_config_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimeConfig> {
    build_runtime_config_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeConfig> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let port = overrides
        .port
        .or_else(|| lookup("PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_PORT);
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("HOST"))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let www_root = overrides
        .www_root
        .or_else(|| lookup("WWW_ROOT").map(PathBuf::from));
    let ytdlp_bin = lookup("YTDLP_BIN")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_BIN));
    let ytdlp_cookies = lookup("YTDLP_COOKIES").map(PathBuf::from);

    let mirrors = match lookup("MIRROR_ENDPOINTS") {
        Some(list) => parse_mirror_list(&list),
        None => match lookup("MIRRORS_FILE") {
            Some(path) => read_mirrors_file(Path::new(&path))?,
            None => Vec::new(),
        },
    };
    let mirrors = if mirrors.is_empty() {
        MirrorEndpoint::defaults()
    } else {
        mirrors
    };

    Ok(RuntimeConfig {
        port,
        host,
        www_root,
        ytdlp_bin,
        ytdlp_cookies,
        extractor_timeout: lookup_secs(&lookup, "EXTRACTOR_TIMEOUT_SECS")
            .unwrap_or(Duration::from_secs(DEFAULT_EXTRACTOR_TIMEOUT_SECS)),
        mirrors,
        mirror_timeout: lookup_secs(&lookup, "MIRROR_TIMEOUT_SECS")
            .unwrap_or(Duration::from_secs(DEFAULT_MIRROR_TIMEOUT_SECS)),
        mirror_max_attempts: lookup("MIRROR_MAX_ATTEMPTS")
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MIRROR_MAX_ATTEMPTS),
        mirror_shuffle: lookup("MIRROR_SHUFFLE")
            .and_then(|value| parse_flag(&value))
            .unwrap_or(true),
        upstream_connect_timeout: lookup_secs(&lookup, "UPSTREAM_CONNECT_TIMEOUT_SECS")
            .unwrap_or(Duration::from_secs(DEFAULT_UPSTREAM_CONNECT_TIMEOUT_SECS)),
    })
}

/// Positive whole seconds; anything else falls back to the caller's default.
fn lookup_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    lookup(key)
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_mirror_list(raw: &str) -> Vec<MirrorEndpoint> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(MirrorEndpoint::new)
        .collect()
}

#[derive(Debug, Deserialize)]
struct MirrorsFile {
    #[serde(default)]
    mirrors: Vec<MirrorEndpoint>,
}

/// Reads `mirrors = ["https://…", …]` from a TOML file.
pub fn read_mirrors_file(path: &Path) -> Result<Vec<MirrorEndpoint>> {
    let raw = fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let parsed: MirrorsFile =
        toml::from_str(&raw).with_context(|| format!("Parsing {}", path.display()))?;
    Ok(parsed
        .mirrors
        .into_iter()
        .map(|endpoint| MirrorEndpoint::new(endpoint.base_url.trim()))
        .filter(|endpoint| !endpoint.base_url.is_empty())
        .collect())
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
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
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
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn config_from(contents: &str) -> RuntimeConfig {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_runtime_config(&vars, |_| None).unwrap()
    }

    #[test]
    fn defaults_apply_to_empty_file() {
        let config = config_from("");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.host, DEFAULT_HOST);
        assert!(config.www_root.is_none());
        assert_eq!(config.ytdlp_bin, PathBuf::from(DEFAULT_YTDLP_BIN));
        assert_eq!(config.mirrors, MirrorEndpoint::defaults());
        assert_eq!(config.mirror_timeout, Duration::from_secs(8));
        assert_eq!(config.mirror_max_attempts, 5);
        assert!(config.mirror_shuffle);
    }

    #[test]
    fn mirror_shuffle_can_be_disabled() {
        assert!(!config_from("MIRROR_SHUFFLE=0\n").mirror_shuffle);
        assert!(!config_from("MIRROR_SHUFFLE=off\n").mirror_shuffle);
        assert!(config_from("MIRROR_SHUFFLE=yes\n").mirror_shuffle);
        assert!(config_from("MIRROR_SHUFFLE=maybe\n").mirror_shuffle);
    }

    #[test]
    fn reads_port_and_tuning_values() {
        let config = config_from(
            "PORT=\"4242\"\nMIRROR_TIMEOUT_SECS=3\nMIRROR_MAX_ATTEMPTS=2\nEXTRACTOR_TIMEOUT_SECS=10\n",
        );
        assert_eq!(config.port, 4242);
        assert_eq!(config.mirror_timeout, Duration::from_secs(3));
        assert_eq!(config.mirror_max_attempts, 2);
        assert_eq!(config.extractor_timeout, Duration::from_secs(10));
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let config = config_from("PORT=\"nope\"\nMIRROR_TIMEOUT_SECS=0\nMIRROR_MAX_ATTEMPTS=-1\n");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.mirror_timeout, Duration::from_secs(DEFAULT_MIRROR_TIMEOUT_SECS));
        assert_eq!(config.mirror_max_attempts, DEFAULT_MIRROR_MAX_ATTEMPTS);
    }

    #[test]
    fn mirror_list_from_env_value() {
        let config = config_from("MIRROR_ENDPOINTS=\" https://a/api , ,https://b/api\"\n");
        assert_eq!(
            config.mirrors,
            vec![
                MirrorEndpoint::new("https://a/api"),
                MirrorEndpoint::new("https://b/api")
            ]
        );
    }

    #[test]
    fn mirror_list_from_toml_file() {
        let mirrors = make_config("mirrors = [\"https://one/api/json\", \" \", \"https://two/api/json\"]\n");
        let env = make_config(&format!("MIRRORS_FILE={}\n", mirrors.path().display()));
        let vars = read_env_file(env.path()).unwrap();
        let config = build_runtime_config(&vars, |_| None).unwrap();
        assert_eq!(
            config.mirrors,
            vec![
                MirrorEndpoint::new("https://one/api/json"),
                MirrorEndpoint::new("https://two/api/json")
            ]
        );
    }

    #[test]
    fn missing_mirrors_file_is_an_error() {
        let vars = HashMap::from([(
            "MIRRORS_FILE".to_string(),
            "/definitely/missing/mirrors.toml".to_string(),
        )]);
        let err = build_runtime_config(&vars, |_| None).unwrap_err();
        assert!(err.to_string().contains("mirrors.toml"));
    }

    #[test]
    fn env_wins_over_file() {
        let vars = read_env_file(make_config("PORT=7000\nYTDLP_BIN=/file/yt-dlp\n").path()).unwrap();
        let config = build_runtime_config(&vars, |key| {
            if key == "YTDLP_BIN" {
                Some("/env/yt-dlp".to_string())
            } else {
                None
            }
        })
        .unwrap();
        assert_eq!(config.ytdlp_bin, PathBuf::from("/env/yt-dlp"));
        assert_eq!(config.port, 7000);
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export PORT="9090"
            HOST='127.0.0.1'
            WWW_ROOT =  "/srv/www"
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("PORT").unwrap(), "9090");
        assert_eq!(vars.get("HOST").unwrap(), "127.0.0.1");
        assert_eq!(vars.get("WWW_ROOT").unwrap(), "/srv/www");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn overrides_take_precedence() {
        let vars = HashMap::from([
            ("PORT".to_string(), "7000".to_string()),
            ("HOST".to_string(), "10.0.0.1".to_string()),
            ("WWW_ROOT".to_string(), "/file-www".to_string()),
        ]);
        let config = build_runtime_config_with_overrides(
            &vars,
            |key| (key == "PORT").then(|| "8000".to_string()),
            RuntimeOverrides {
                port: Some(9000),
                host: Some("127.0.0.1".into()),
                www_root: Some(PathBuf::from("/override-www")),
                env_path: None,
            },
        )
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.www_root, Some(PathBuf::from("/override-www")));
    }

    #[test]
    fn blank_host_override_is_ignored() {
        let config = build_runtime_config_with_overrides(
            &HashMap::new(),
            |_| None,
            RuntimeOverrides {
                host: Some("   ".into()),
                ..RuntimeOverrides::default()
            },
        )
        .unwrap();
        assert_eq!(config.host, DEFAULT_HOST);
    }
}
