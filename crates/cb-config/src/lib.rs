//! Loads and validates the broker's YAML config file (spec §6).
//!
//! Follows the teacher's `Raw*` / validated-owned-config split: the `Raw*`
//! types mirror the file 1:1 with everything optional, `$ENV`/`${ENV}`
//! references still unresolved; `load()` applies environment substitution,
//! fills defaults, validates, and returns owned `Config`.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

use cb_tokenizer::Command;
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/chat-broker/config.yaml";
pub const DEFAULT_NOTIFICATION_HISTORY_SIZE: u64 = 1000;
pub const DEFAULT_AGENT_BUFFER_SECS: u64 = 30;
pub const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_AGENT_COOLDOWN_SECS: u64 = 60;

/// Base names of argv[0] an agent `command` is allowed to launch unless the
/// agent opts into `allow_arbitrary`.
pub const ALLOWED_AGENT_BINARIES: &[&str] =
    &["claude", "codex", "copilot", "aider", "goose", "opencode", "gemini"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read { path: String, #[source] source: std::io::Error },
    #[error("parsing {path}: {source}")]
    Parse { path: String, #[source] source: serde_yaml::Error },
    #[error("unresolved environment reference `{0}`")]
    UnresolvedEnvRef(String),
    #[error("server.socket_path is required")]
    MissingSocketPath,
    #[error("server.db_path is required")]
    MissingDbPath,
    #[error("bot `{0}`: name must be non-empty")]
    EmptyBotName(usize),
    #[error("bot `{0}`: type must be non-empty")]
    EmptyBotType(String),
    #[error("duplicate bot key `{0}`")]
    DuplicateBotKey(String),
    #[error("duplicate bot name `{0}`")]
    DuplicateBotName(String),
    #[error("agent `{0}`: command must not be empty")]
    EmptyAgentCommand(String),
    #[error("agent `{0}`: binary `{1}` is not in the allowlist and allow_arbitrary is not set")]
    DisallowedAgentBinary(String, String),
    #[error("duplicate agent name `{0}`")]
    DuplicateAgentName(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

// ---------------------------------------------------------------------------
// Raw (file-shaped) types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawFile {
    server: RawServer,
    #[serde(default)]
    bots: Vec<RawBot>,
    #[serde(default)]
    agents: Vec<RawAgent>,
}

#[derive(Debug, Deserialize)]
struct RawServer {
    socket_path: Option<String>,
    db_path: Option<String>,
    notification_history_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawBot {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    allowlist: Vec<String>,
    /// Every other scalar field (tokens, app ids, phone numbers, ...) is
    /// type-specific; kept as a flat string map rather than one struct per
    /// connector type.
    #[serde(flatten)]
    credentials: HashMap<String, serde_yaml::Value>,
}

#[derive(Debug, Deserialize)]
struct RawAgent {
    name: String,
    #[serde(default)]
    when: Option<String>,
    command: Command,
    #[serde(default)]
    workdir: Option<String>,
    #[serde(default)]
    buffer: Option<u64>,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    cooldown: Option<u64>,
    #[serde(default)]
    allow_arbitrary: bool,
}

// ---------------------------------------------------------------------------
// Validated types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub socket_path: String,
    pub db_path: String,
    pub notification_history_size: u64,
    pub bots: Vec<BotConfig>,
    pub agents: Vec<AgentConfig>,
}

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub name: String,
    pub kind: String,
    pub endpoint: Option<String>,
    pub allowlist: Vec<String>,
    pub credentials: HashMap<String, String>,
}

impl BotConfig {
    pub fn bot_key(&self) -> String {
        format!("{}:{}", self.kind, self.name)
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub name: String,
    pub when: String,
    pub command: Vec<String>,
    pub workdir: Option<String>,
    pub buffer_secs: u64,
    pub timeout_secs: u64,
    pub cooldown_secs: u64,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load, substitute, parse, and validate a config file.
pub fn load(path: &Path) -> ConfigResult<Config> {
    let raw_text = fs::read_to_string(path)
        .map_err(|source| ConfigError::Read { path: path.display().to_string(), source })?;
    let substituted = substitute_env(&raw_text)?;
    let raw: RawFile = serde_yaml::from_str(&substituted)
        .map_err(|source| ConfigError::Parse { path: path.display().to_string(), source })?;
    validate(raw)
}

/// Resolve `$NAME` and `${NAME}` references against the process
/// environment. An unresolved reference is a hard error rather than an
/// empty-string substitution, so a typo'd credential never silently becomes
/// a blank string in a live config.
fn substitute_env(text: &str) -> ConfigResult<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '$' {
            if chars.get(i + 1) == Some(&'{') {
                let start = i + 2;
                let end = chars[start..]
                    .iter()
                    .position(|&c| c == '}')
                    .map(|p| start + p);
                if let Some(end) = end {
                    let name: String = chars[start..end].iter().collect();
                    out.push_str(&resolve(&name)?);
                    i = end + 1;
                    continue;
                }
            } else if chars.get(i + 1).is_some_and(|c| c.is_alphabetic() || *c == '_') {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
                    end += 1;
                }
                let name: String = chars[start..end].iter().collect();
                out.push_str(&resolve(&name)?);
                i = end;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    Ok(out)
}

fn resolve(name: &str) -> ConfigResult<String> {
    env::var(name).map_err(|_| ConfigError::UnresolvedEnvRef(name.to_string()))
}

fn validate(raw: RawFile) -> ConfigResult<Config> {
    let socket_path = raw.server.socket_path.ok_or(ConfigError::MissingSocketPath)?;
    let db_path = raw.server.db_path.ok_or(ConfigError::MissingDbPath)?;
    let notification_history_size =
        raw.server.notification_history_size.unwrap_or(DEFAULT_NOTIFICATION_HISTORY_SIZE);

    let mut bots = Vec::with_capacity(raw.bots.len());
    let mut seen_keys = std::collections::HashSet::new();
    let mut seen_names = std::collections::HashSet::new();
    for (idx, b) in raw.bots.into_iter().enumerate() {
        if b.name.trim().is_empty() {
            return Err(ConfigError::EmptyBotName(idx));
        }
        if b.kind.trim().is_empty() {
            return Err(ConfigError::EmptyBotType(b.name.clone()));
        }
        let key = format!("{}:{}", b.kind, b.name);
        if !seen_keys.insert(key.clone()) {
            return Err(ConfigError::DuplicateBotKey(key));
        }
        if !seen_names.insert(b.name.clone()) {
            return Err(ConfigError::DuplicateBotName(b.name.clone()));
        }
        let credentials = b
            .credentials
            .into_iter()
            .filter_map(|(k, v)| scalar_string(&v).map(|s| (k, s)))
            .collect();
        bots.push(BotConfig {
            name: b.name,
            kind: b.kind,
            endpoint: b.endpoint,
            allowlist: b.allowlist,
            credentials,
        });
    }

    let mut agents = Vec::with_capacity(raw.agents.len());
    let mut seen_agent_names = std::collections::HashSet::new();
    for a in raw.agents {
        if !seen_agent_names.insert(a.name.clone()) {
            return Err(ConfigError::DuplicateAgentName(a.name));
        }
        let Command(command) = a.command;
        if command.is_empty() {
            return Err(ConfigError::EmptyAgentCommand(a.name));
        }
        if !a.allow_arbitrary {
            let binary = Path::new(&command[0])
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or(command[0].as_str());
            if !ALLOWED_AGENT_BINARIES.contains(&binary) {
                return Err(ConfigError::DisallowedAgentBinary(a.name, binary.to_string()));
            }
        }
        agents.push(AgentConfig {
            name: a.name,
            when: a.when.unwrap_or_else(|| "notify".to_string()),
            command,
            workdir: a.workdir,
            buffer_secs: a.buffer.unwrap_or(DEFAULT_AGENT_BUFFER_SECS),
            timeout_secs: a.timeout.unwrap_or(DEFAULT_AGENT_TIMEOUT_SECS),
            cooldown_secs: a.cooldown.unwrap_or(DEFAULT_AGENT_COOLDOWN_SECS),
        });
    }

    Ok(Config { socket_path, db_path, notification_history_size, bots, agents })
}

fn scalar_string(v: &serde_yaml::Value) -> Option<String> {
    match v {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let f = write_temp(
            r#"
server:
  socket_path: /tmp/broker.sock
  db_path: /tmp/broker.db
"#,
        );
        let cfg = load(f.path()).unwrap();
        assert_eq!(cfg.socket_path, "/tmp/broker.sock");
        assert_eq!(cfg.notification_history_size, DEFAULT_NOTIFICATION_HISTORY_SIZE);
        assert!(cfg.bots.is_empty());
    }

    #[test]
    fn missing_socket_path_is_error() {
        let f = write_temp("server:\n  db_path: /tmp/broker.db\n");
        assert!(matches!(load(f.path()), Err(ConfigError::MissingSocketPath)));
    }

    #[test]
    fn env_substitution_resolves_both_forms() {
        // SAFETY: test-only, single-threaded env mutation scoped to this test.
        unsafe {
            env::set_var("CB_TEST_TOKEN", "sekret");
        }
        let f = write_temp(
            r#"
server:
  socket_path: /tmp/broker.sock
  db_path: /tmp/broker.db
bots:
  - name: ops
    type: slack
    token: $CB_TEST_TOKEN
    app_token: ${CB_TEST_TOKEN}
"#,
        );
        let cfg = load(f.path()).unwrap();
        assert_eq!(cfg.bots[0].credentials.get("token").unwrap(), "sekret");
        assert_eq!(cfg.bots[0].credentials.get("app_token").unwrap(), "sekret");
        unsafe {
            env::remove_var("CB_TEST_TOKEN");
        }
    }

    #[test]
    fn unresolved_env_reference_is_error() {
        let f = write_temp(
            r#"
server:
  socket_path: /tmp/broker.sock
  db_path: /tmp/broker.db
bots:
  - name: ops
    type: slack
    token: $CB_DOES_NOT_EXIST_12345
"#,
        );
        assert!(matches!(load(f.path()), Err(ConfigError::UnresolvedEnvRef(_))));
    }

    #[test]
    fn duplicate_bot_key_is_error() {
        let f = write_temp(
            r#"
server:
  socket_path: /tmp/broker.sock
  db_path: /tmp/broker.db
bots:
  - name: ops
    type: slack
  - name: ops
    type: slack
"#,
        );
        assert!(matches!(load(f.path()), Err(ConfigError::DuplicateBotKey(_))));
    }

    #[test]
    fn agent_binary_outside_allowlist_is_rejected() {
        let f = write_temp(
            r#"
server:
  socket_path: /tmp/broker.sock
  db_path: /tmp/broker.db
agents:
  - name: triage
    command: "/bin/sh -c ls"
"#,
        );
        assert!(matches!(load(f.path()), Err(ConfigError::DisallowedAgentBinary(_, _))));
    }

    #[test]
    fn agent_binary_allowed_when_allow_arbitrary_set() {
        let f = write_temp(
            r#"
server:
  socket_path: /tmp/broker.sock
  db_path: /tmp/broker.db
agents:
  - name: triage
    command: "/bin/echo ok"
    allow_arbitrary: true
"#,
        );
        let cfg = load(f.path()).unwrap();
        assert_eq!(cfg.agents[0].command, vec!["/bin/echo", "ok"]);
    }

    #[test]
    fn agent_defaults_applied() {
        let f = write_temp(
            r#"
server:
  socket_path: /tmp/broker.sock
  db_path: /tmp/broker.db
agents:
  - name: triage
    command: claude
"#,
        );
        let cfg = load(f.path()).unwrap();
        let a = &cfg.agents[0];
        assert_eq!(a.when, "notify");
        assert_eq!(a.buffer_secs, DEFAULT_AGENT_BUFFER_SECS);
        assert_eq!(a.timeout_secs, DEFAULT_AGENT_TIMEOUT_SECS);
        assert_eq!(a.cooldown_secs, DEFAULT_AGENT_COOLDOWN_SECS);
    }
}
