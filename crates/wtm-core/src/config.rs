use std::{
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use crate::service::AssistantPolicy;

/// Typed process configuration, loaded once from the environment.
///
/// Mutable runtime state (admin, approved senders, scheduling group) lives
/// in the JSON-backed stores of `runtime_config` instead.
#[derive(Clone, Debug)]
pub struct Config {
    // Gateway
    pub gateway_url: String,
    pub gateway_timeout: Duration,

    // Operating mode
    pub assistant_mode: bool,
    pub assistant_max_schedule_hours: i64,
    pub default_timezone: Option<String>,

    // Runtime config files
    pub common_config_path: PathBuf,
    pub timed_config_path: PathBuf,

    // Storage
    pub database_url: Option<String>,

    // HTTP server
    pub listen_addr: String,
    pub enable_debug_api: bool,

    // Worker
    pub poll_interval: Duration,
    pub batch_size: i64,
}

impl Config {
    pub fn load() -> crate::Result<Self> {
        apply_dotenv(Path::new(".env"));

        let assistant_mode = env_flag("WHATSAPP_ASSISTANT_MODE");

        // The two modes run against different gateway deployments.
        let default_gateway = if assistant_mode {
            "http://whatsapp_assistant_gateway:3000"
        } else {
            "http://whatsapp_gateway:3000"
        };
        let gateway_url = env_var("WHATSAPP_GATEWAY_URL")
            .unwrap_or_else(|| default_gateway.to_string());
        let gateway_timeout = env_seconds("GATEWAY_TIMEOUT_SECONDS", 5);

        let assistant_max_schedule_hours =
            env_parse::<i64>("WHATSAPP_ASSISTANT_MAX_SCHEDULE_HOURS").unwrap_or(24);
        let default_timezone = env_var("DEFAULT_TIMEZONE");

        let common_config_path =
            env_path("WHATSAPP_COMMON_CONFIG_PATH", "config/common_runtime.json");
        let timed_config_path = env_path(
            "WHATSAPP_TIMED_MESSAGES_CONFIG_PATH",
            "config/timed_messages_runtime.json",
        );

        let database_url = env_var("DATABASE_URL");

        let listen_addr =
            env_var("LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:8000".to_string());
        let enable_debug_api = env_flag("TIMED_MESSAGES_ENABLE_DEBUG_API");

        let poll_interval = env_seconds("WORKER_POLL_INTERVAL_SECONDS", 5);
        let batch_size = env_parse::<i64>("WORKER_BATCH_SIZE").unwrap_or(10);

        Ok(Self {
            gateway_url,
            gateway_timeout,
            assistant_mode,
            assistant_max_schedule_hours,
            default_timezone,
            common_config_path,
            timed_config_path,
            database_url,
            listen_addr,
            enable_debug_api,
            poll_interval,
            batch_size,
        })
    }

    pub fn assistant_policy(&self) -> AssistantPolicy {
        AssistantPolicy {
            enabled: self.assistant_mode,
            max_schedule_hours: self.assistant_max_schedule_hours,
        }
    }
}

/// Load `.env` assignments into the process environment. Variables already
/// set in the environment win over the file.
fn apply_dotenv(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };
    for line in contents.lines() {
        let Some((key, value)) = parse_env_line(line) else {
            continue;
        };
        if env::var_os(key).is_none() {
            env::set_var(key, value);
        }
    }
}

/// One `.env` line: `KEY=value`, optionally quoted. Blank lines and `#`
/// comments yield nothing.
fn parse_env_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }

    let value = value.trim();
    let unquoted = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')));
    Some((key, unquoted.unwrap_or(value)))
}

/// Trimmed environment value; empty counts as unset.
fn env_var(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_flag(key: &str) -> bool {
    match env_var(key) {
        Some(value) => matches!(
            value.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        None => false,
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_var(key)?.parse().ok()
}

fn env_seconds(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_parse(key).unwrap_or(default))
}

fn env_path(key: &str, default: &str) -> PathBuf {
    env_var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_lines_parse_assignments_and_skip_noise() {
        assert_eq!(parse_env_line("KEY=value"), Some(("KEY", "value")));
        assert_eq!(parse_env_line("  KEY = spaced  "), Some(("KEY", "spaced")));
        assert_eq!(parse_env_line("KEY=\"quoted value\""), Some(("KEY", "quoted value")));
        assert_eq!(parse_env_line("KEY='single'"), Some(("KEY", "single")));
        // A lone opening quote is kept as-is.
        assert_eq!(parse_env_line("KEY=\"dangling"), Some(("KEY", "\"dangling")));
        assert_eq!(parse_env_line("KEY="), Some(("KEY", "")));

        assert_eq!(parse_env_line(""), None);
        assert_eq!(parse_env_line("   "), None);
        assert_eq!(parse_env_line("# comment"), None);
        assert_eq!(parse_env_line("no equals sign"), None);
        assert_eq!(parse_env_line("=value"), None);
    }
}
