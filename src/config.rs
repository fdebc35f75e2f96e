use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use thiserror::Error;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required variable is unset or empty.
    #[error("{0} is required")]
    Missing(&'static str),
    /// A variable holds a value that cannot be parsed.
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    /// Validation error.
    #[error("config validation error: {0}")]
    Validation(String),
}

pub const DEFAULT_TIMEZONE: Tz = chrono_tz::Asia::Seoul;
const DEFAULT_AGENT_COMMAND: &str = "opencode";
const DEFAULT_AGENT_MODEL: &str = "zai-coding-plan/glm-4.7";
const DEFAULT_AGENT_SKILL: &str = "/user-action";
const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 300;
const DEFAULT_SCHEDULED_TIMEOUT_SECS: u64 = 600;

/// How the external agent is launched.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Program to execute (looked up on PATH).
    pub command: String,
    /// Arguments placed before the prompt.
    pub subcommand: Vec<String>,
    /// Model selector passed as `-m <model>`; `None` omits the flag.
    pub model: Option<String>,
    /// Skill invoked for interactive chat messages.
    pub skill: String,
    /// Working directory for every invocation.
    pub workdir: PathBuf,
    pub interactive_timeout: Duration,
    pub scheduled_timeout: Duration,
}

pub struct Config {
    pub telegram_bot_token: String,
    /// Expected value of the `X-Telegram-Bot-Api-Secret-Token` header.
    pub webhook_secret: Option<String>,
    /// Default chat for the CLIs.
    pub default_chat_id: Option<i64>,
    /// Chat that receives forwarded log lines.
    pub log_chat_id: Option<i64>,
    pub timezone: Tz,
    pub agent: AgentSettings,
    /// Directory for state files (logs).
    pub data_dir: PathBuf,
    pub project_root: PathBuf,
}

impl Config {
    /// Load `.env` from the project root, then read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let project_root = find_project_root(&cwd);
        let env_file = project_root.join(".env");
        if env_file.exists()
            && let Err(e) = dotenvy::from_path(&env_file)
        {
            return Err(ConfigError::Validation(format!(
                "failed to read {}: {e}",
                env_file.display()
            )));
        }
        Self::from_lookup(&project_root, |key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    pub fn from_lookup<F>(project_root: &Path, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let telegram_bot_token = get("TELEGRAM_BOT_TOKEN").ok_or(ConfigError::Missing("TELEGRAM_BOT_TOKEN"))?;
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = telegram_bot_token.split(':').collect();
        if token_parts.len() != 2 || token_parts[0].parse::<u64>().is_err() || token_parts[1].is_empty() {
            return Err(ConfigError::Validation(
                "TELEGRAM_BOT_TOKEN appears invalid (expected format: 123456789:ABCdefGHI...)".into(),
            ));
        }

        let timezone = match get("TIMEZONE") {
            Some(name) => name.parse::<Tz>().map_err(|e| ConfigError::Invalid {
                key: "TIMEZONE",
                value: name.clone(),
                reason: e.to_string(),
            })?,
            None => DEFAULT_TIMEZONE,
        };

        let workdir = get("AGENT_WORKDIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| project_root.to_path_buf());
        let data_dir = get("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| project_root.to_path_buf());

        // An explicitly empty AGENT_MODEL disables the model flag.
        let model = match lookup("AGENT_MODEL") {
            Some(m) if m.trim().is_empty() => None,
            Some(m) => Some(m.trim().to_string()),
            None => Some(DEFAULT_AGENT_MODEL.to_string()),
        };

        let agent = AgentSettings {
            command: get("AGENT_COMMAND").unwrap_or_else(|| DEFAULT_AGENT_COMMAND.to_string()),
            subcommand: vec!["run".to_string()],
            model,
            skill: get("AGENT_SKILL").unwrap_or_else(|| DEFAULT_AGENT_SKILL.to_string()),
            workdir,
            interactive_timeout: Duration::from_secs(parse_secs(
                "AGENT_TIMEOUT_SECS",
                get("AGENT_TIMEOUT_SECS"),
                DEFAULT_AGENT_TIMEOUT_SECS,
            )?),
            scheduled_timeout: Duration::from_secs(parse_secs(
                "SCHEDULED_TIMEOUT_SECS",
                get("SCHEDULED_TIMEOUT_SECS"),
                DEFAULT_SCHEDULED_TIMEOUT_SECS,
            )?),
        };

        Ok(Self {
            telegram_bot_token,
            webhook_secret: get("TELEGRAM_WEBHOOK_SECRET"),
            default_chat_id: parse_chat_id("TELEGRAM_CHAT_ID", get("TELEGRAM_CHAT_ID"))?,
            log_chat_id: parse_chat_id("TELEGRAM_LOG_CHAT_ID", get("TELEGRAM_LOG_CHAT_ID"))?,
            timezone,
            agent,
            data_dir,
            project_root: project_root.to_path_buf(),
        })
    }
}

fn parse_secs(key: &'static str, value: Option<String>, default: u64) -> Result<u64, ConfigError> {
    let Some(value) = value else {
        return Ok(default);
    };
    match value.parse::<u64>() {
        Ok(0) => Err(ConfigError::Invalid { key, value, reason: "must be positive".into() }),
        Ok(secs) => Ok(secs),
        Err(e) => Err(ConfigError::Invalid { key, value, reason: e.to_string() }),
    }
}

fn parse_chat_id(key: &'static str, value: Option<String>) -> Result<Option<i64>, ConfigError> {
    value
        .map(|v| {
            v.parse::<i64>().map_err(|e| ConfigError::Invalid {
                key,
                value: v.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

/// Nearest ancestor of `start` holding `.git` or `.env`; `start` itself otherwise.
pub fn find_project_root(start: &Path) -> PathBuf {
    start
        .ancestors()
        .find(|dir| dir.join(".git").exists() || dir.join(".env").exists())
        .unwrap_or(start)
        .to_path_buf()
}

/// Set `key=value` in a dotenv file, replacing an existing assignment or
/// appending one. Other lines are kept as they are.
pub fn write_env_key(path: &Path, key: &str, value: &str) -> std::io::Result<()> {
    let existing = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };

    let assignment = format!("{key}={value}");
    let mut replaced = false;
    let mut lines: Vec<String> = existing
        .lines()
        .map(|line| {
            let name = line.trim_start().trim_start_matches("export ").split('=').next().unwrap_or("");
            if !replaced && line.contains('=') && name.trim() == key {
                replaced = true;
                assignment.clone()
            } else {
                line.to_string()
            }
        })
        .collect();
    if !replaced {
        lines.push(assignment);
    }

    let mut out = lines.join("\n");
    out.push('\n');
    std::fs::write(path, out)
}
