//! Server configuration loaded from a TOML file.
//!
//! The file path comes from `--config <path>` or `VIGIL_CONFIG`. Unknown keys
//! are rejected so typos fail at startup rather than silently defaulting.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use vigil_core::{
    new_entity_id, Agent, AgentId, AgentPolicy, ConfigError, DispatchMode, EngineConfig,
    ProjectId, RetryConfig, UserId, VigilResult,
};
use vigil_tools::HttpToolConfig;

const DEFAULT_BIND: &str = "0.0.0.0:3000";

// ============================================================================
// TYPES
// ============================================================================

/// Top-level server configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Remote tool gateway. Without it the server only runs agents whose
    /// plans never reach a tool.
    #[serde(default)]
    pub tool: Option<ToolEndpointConfig>,
    /// Defaults to the engine defaults with spawned dispatch.
    #[serde(default = "default_server_engine")]
    pub engine: EngineConfig,
    /// Agents registered at startup.
    #[serde(default)]
    pub agents: Vec<AgentSeed>,
}

/// Tool gateway connection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolEndpointConfig {
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Wrap the gateway in a retrying invoker using `engine.retry`.
    #[serde(default)]
    pub retry: bool,
}

/// An agent definition to insert at startup.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentSeed {
    #[serde(default)]
    pub agent_id: Option<AgentId>,
    pub owner_user_id: UserId,
    pub project_id: ProjectId,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub policy: AgentPolicy,
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}

fn default_server_engine() -> EngineConfig {
    EngineConfig::default_engine().with_dispatch_mode(DispatchMode::Spawn)
}

fn default_requests_per_minute() -> u32 {
    60
}

fn default_timeout_ms() -> u64 {
    120_000
}

fn default_enabled() -> bool {
    true
}

// ============================================================================
// LOADING
// ============================================================================

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            tool: None,
            engine: default_server_engine(),
            agents: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml(source: &str) -> VigilResult<Self> {
        let config: ServerConfig = toml::from_str(source).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> VigilResult<Self> {
        let source = std::fs::read_to_string(path).map_err(|e| ConfigError::Parse {
            reason: format!("failed to read {}: {}", path.display(), e),
        })?;
        Self::from_toml(&source)
    }

    /// Load from `--config <path>` in `args`, then `VIGIL_CONFIG`, falling
    /// back to defaults plus `VIGIL_*` engine overrides when neither is set.
    pub fn load<I>(args: I) -> VigilResult<Self>
    where
        I: IntoIterator<Item = String>,
    {
        match config_path(args, std::env::var("VIGIL_CONFIG").ok())? {
            Some(path) => Self::from_path(&path),
            None => {
                let mut engine = EngineConfig::from_env()?;
                if std::env::var("VIGIL_DISPATCH_MODE").is_err() {
                    engine.dispatch_mode = DispatchMode::Spawn;
                }
                let config = Self {
                    engine,
                    ..Self::default()
                };
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn validate(&self) -> VigilResult<()> {
        self.bind_addr()?;
        self.engine.validate()?;

        if let Some(tool) = &self.tool {
            if tool.base_url.trim().is_empty() {
                return Err(ConfigError::MissingRequired {
                    field: "tool.base_url".to_string(),
                }
                .into());
            }
            if tool.requests_per_minute == 0 {
                return Err(invalid(
                    "tool.requests_per_minute",
                    tool.requests_per_minute,
                    "requests_per_minute must be greater than 0",
                ));
            }
            if tool.timeout_ms == 0 {
                return Err(invalid(
                    "tool.timeout_ms",
                    tool.timeout_ms,
                    "timeout_ms must be greater than 0",
                ));
            }
        }

        for seed in &self.agents {
            if seed.name.trim().is_empty() {
                return Err(ConfigError::MissingRequired {
                    field: "agents.name".to_string(),
                }
                .into());
            }
            seed.policy.validate()?;
        }

        Ok(())
    }

    pub fn bind_addr(&self) -> VigilResult<SocketAddr> {
        self.bind.parse::<SocketAddr>().map_err(|e| {
            invalid("bind", &self.bind, &format!("invalid socket address: {}", e))
        })
    }
}

impl ToolEndpointConfig {
    /// Resolve the key from the named variable; an unset variable means no key.
    pub fn http_config(&self) -> HttpToolConfig {
        HttpToolConfig {
            base_url: self.base_url.clone(),
            api_key: self
                .api_key_env
                .as_deref()
                .and_then(|name| std::env::var(name).ok()),
            requests_per_minute: self.requests_per_minute,
            timeout_ms: self.timeout_ms,
        }
    }

    pub fn retry_config(&self, engine: &EngineConfig) -> Option<RetryConfig> {
        self.retry.then(|| engine.retry.clone())
    }
}

impl AgentSeed {
    pub fn into_agent(self) -> Agent {
        let mut agent = Agent::new(self.owner_user_id, self.project_id, self.name, self.policy);
        agent.agent_id = self.agent_id.unwrap_or_else(new_entity_id);
        agent.enabled = self.enabled;
        agent
    }
}

fn config_path<I>(args: I, env_path: Option<String>) -> VigilResult<Option<PathBuf>>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return match args.next() {
                Some(path) => Ok(Some(PathBuf::from(path))),
                None => Err(ConfigError::MissingRequired {
                    field: "--config <path>".to_string(),
                }
                .into()),
            };
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Ok(Some(PathBuf::from(path)));
        }
    }
    Ok(env_path.map(PathBuf::from))
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> vigil_core::VigilError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::{ErrorKind, RejectAction};

    const SAMPLE: &str = r#"
bind = "127.0.0.1:8080"

[tool]
base_url = "http://localhost:9000"
api_key_env = "VIGIL_TOOL_KEY"
requests_per_minute = 30
retry = true

[engine]
dispatch_mode = "spawn"
checkpoint_interval = 2

[[agents]]
owner_user_id = "0192f7a4-5b6c-7d8e-9f00-112233445566"
project_id = "0192f7a4-5b6c-7d8e-9f00-665544332211"
name = "docs-writer"

[agents.policy]
max_steps = 10
uncertainty_threshold = 0.5
on_reject = "skip"
"#;

    #[test]
    fn test_parses_full_document() {
        let config = ServerConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.bind_addr().unwrap().port(), 8080);
        assert_eq!(config.engine.dispatch_mode, DispatchMode::Spawn);
        assert_eq!(config.engine.checkpoint_interval, 2);

        let tool = config.tool.clone().unwrap();
        assert_eq!(tool.requests_per_minute, 30);
        assert_eq!(tool.timeout_ms, 120_000);
        assert!(tool.retry_config(&config.engine).is_some());

        let agent = config.agents[0].clone().into_agent();
        assert!(agent.enabled);
        assert_eq!(agent.policy.max_steps, 10);
        assert_eq!(agent.policy.on_reject, RejectAction::Skip);
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = ServerConfig::from_toml("").unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.engine.dispatch_mode, DispatchMode::Spawn);
        assert!(config.tool.is_none());
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let err = ServerConfig::from_toml("bind = \"127.0.0.1:1\"\nport = 3\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.to_string().contains("port"));
    }

    #[test]
    fn test_invalid_values_fail_validation() {
        assert!(ServerConfig::from_toml("bind = \"not an address\"").is_err());
        assert!(ServerConfig::from_toml("[engine]\ncheckpoint_interval = 0\n").is_err());
        assert!(ServerConfig::from_toml(
            "[tool]\nbase_url = \"http://x\"\nrequests_per_minute = 0\n"
        )
        .is_err());
    }

    #[test]
    fn test_config_path_sources() {
        let args = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        let path = config_path(args(&["vigil-api", "--config", "a.toml"]), Some("b.toml".into()))
            .unwrap();
        assert_eq!(path, Some(PathBuf::from("a.toml")));

        let path = config_path(args(&["vigil-api", "--config=c.toml"]), None).unwrap();
        assert_eq!(path, Some(PathBuf::from("c.toml")));

        let path = config_path(args(&["vigil-api"]), Some("b.toml".into())).unwrap();
        assert_eq!(path, Some(PathBuf::from("b.toml")));

        assert!(config_path(args(&["vigil-api", "--config"]), None).is_err());
    }
}
