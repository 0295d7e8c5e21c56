use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resilience::{CircuitBreakerConfig, RetryPolicy};
use crate::steps::StepName;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub mailbox: MailboxConfig,
    pub reasoning: ReasoningConfig,
    pub entitlement: EntitlementConfig,
    pub ticketing: TicketingConfig,
    pub engine: EngineConfig,
    pub resilience: ResilienceConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct MailboxConfig {
    pub base_url: String,
    pub api_token: SecretString,
    pub poll_interval_secs: u64,
    pub max_concurrent_runs: u32,
}

#[derive(Clone, Debug)]
pub struct ReasoningConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct EntitlementConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct TicketingConfig {
    pub base_url: String,
    pub api_token: SecretString,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub entry_step: String,
    pub instructions_dir: PathBuf,
    pub max_iterations: u32,
    pub run_deadline_secs: u64,
    pub function_timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ResilienceConfig {
    pub retry_max_attempts: u32,
    pub retry_initial_backoff_secs: u64,
    pub retry_max_backoff_secs: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub log_level: Option<String>,
    pub reasoning_model: Option<String>,
    pub instructions_dir: Option<PathBuf>,
    pub entry_step: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mailbox: MailboxConfig {
                base_url: "http://localhost:8025".to_string(),
                api_token: String::new().into(),
                poll_interval_secs: 10,
                max_concurrent_runs: 4,
            },
            reasoning: ReasoningConfig {
                base_url: "http://localhost:11434".to_string(),
                api_key: None,
                model: "llama3.1".to_string(),
                timeout_secs: 15,
            },
            entitlement: EntitlementConfig {
                base_url: "http://localhost:8081".to_string(),
                api_key: None,
                timeout_secs: 10,
            },
            ticketing: TicketingConfig {
                base_url: "http://localhost:8082".to_string(),
                api_token: String::new().into(),
                timeout_secs: 10,
            },
            engine: EngineConfig {
                entry_step: "extract-identifier".to_string(),
                instructions_dir: PathBuf::from("steps"),
                max_iterations: 10,
                run_deadline_secs: 120,
                function_timeout_secs: 10,
            },
            resilience: ResilienceConfig {
                retry_max_attempts: 3,
                retry_initial_backoff_secs: 1,
                retry_max_backoff_secs: 10,
                breaker_failure_threshold: 5,
                breaker_cooldown_secs: 60,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                health_check_port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl MailboxConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl ReasoningConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl EntitlementConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl TicketingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl EngineConfig {
    pub fn entry_step_name(&self) -> Result<StepName, ConfigError> {
        StepName::new(self.entry_step.clone())
            .map_err(|error| ConfigError::Validation(format!("engine.entry_step: {error}")))
    }

    pub fn run_deadline(&self) -> Duration {
        Duration::from_secs(self.run_deadline_secs)
    }

    pub fn function_timeout(&self) -> Duration {
        Duration::from_secs(self.function_timeout_secs)
    }
}

impl ServerConfig {
    pub fn graceful_shutdown(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_secs)
    }
}

impl ResilienceConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            initial_delay: Duration::from_secs(self.retry_initial_backoff_secs),
            max_delay: Duration::from_secs(self.retry_max_backoff_secs),
            backoff_multiplier: 2.0,
        }
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker_failure_threshold,
            cooldown: Duration::from_secs(self.breaker_cooldown_secs),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("triago.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(mailbox) = patch.mailbox {
            if let Some(base_url) = mailbox.base_url {
                self.mailbox.base_url = base_url;
            }
            if let Some(mailbox_token_value) = mailbox.api_token {
                self.mailbox.api_token = secret_value(mailbox_token_value);
            }
            if let Some(poll_interval_secs) = mailbox.poll_interval_secs {
                self.mailbox.poll_interval_secs = poll_interval_secs;
            }
            if let Some(max_concurrent_runs) = mailbox.max_concurrent_runs {
                self.mailbox.max_concurrent_runs = max_concurrent_runs;
            }
        }

        if let Some(reasoning) = patch.reasoning {
            if let Some(base_url) = reasoning.base_url {
                self.reasoning.base_url = base_url;
            }
            if let Some(reasoning_key_value) = reasoning.api_key {
                self.reasoning.api_key = Some(secret_value(reasoning_key_value));
            }
            if let Some(model) = reasoning.model {
                self.reasoning.model = model;
            }
            if let Some(timeout_secs) = reasoning.timeout_secs {
                self.reasoning.timeout_secs = timeout_secs;
            }
        }

        if let Some(entitlement) = patch.entitlement {
            if let Some(base_url) = entitlement.base_url {
                self.entitlement.base_url = base_url;
            }
            if let Some(entitlement_key_value) = entitlement.api_key {
                self.entitlement.api_key = Some(secret_value(entitlement_key_value));
            }
            if let Some(timeout_secs) = entitlement.timeout_secs {
                self.entitlement.timeout_secs = timeout_secs;
            }
        }

        if let Some(ticketing) = patch.ticketing {
            if let Some(base_url) = ticketing.base_url {
                self.ticketing.base_url = base_url;
            }
            if let Some(ticketing_token_value) = ticketing.api_token {
                self.ticketing.api_token = secret_value(ticketing_token_value);
            }
            if let Some(timeout_secs) = ticketing.timeout_secs {
                self.ticketing.timeout_secs = timeout_secs;
            }
        }

        if let Some(engine) = patch.engine {
            if let Some(entry_step) = engine.entry_step {
                self.engine.entry_step = entry_step;
            }
            if let Some(instructions_dir) = engine.instructions_dir {
                self.engine.instructions_dir = PathBuf::from(instructions_dir);
            }
            if let Some(max_iterations) = engine.max_iterations {
                self.engine.max_iterations = max_iterations;
            }
            if let Some(run_deadline_secs) = engine.run_deadline_secs {
                self.engine.run_deadline_secs = run_deadline_secs;
            }
            if let Some(function_timeout_secs) = engine.function_timeout_secs {
                self.engine.function_timeout_secs = function_timeout_secs;
            }
        }

        if let Some(resilience) = patch.resilience {
            if let Some(retry_max_attempts) = resilience.retry_max_attempts {
                self.resilience.retry_max_attempts = retry_max_attempts;
            }
            if let Some(retry_initial_backoff_secs) = resilience.retry_initial_backoff_secs {
                self.resilience.retry_initial_backoff_secs = retry_initial_backoff_secs;
            }
            if let Some(retry_max_backoff_secs) = resilience.retry_max_backoff_secs {
                self.resilience.retry_max_backoff_secs = retry_max_backoff_secs;
            }
            if let Some(breaker_failure_threshold) = resilience.breaker_failure_threshold {
                self.resilience.breaker_failure_threshold = breaker_failure_threshold;
            }
            if let Some(breaker_cooldown_secs) = resilience.breaker_cooldown_secs {
                self.resilience.breaker_cooldown_secs = breaker_cooldown_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("TRIAGO_MAILBOX_BASE_URL") {
            self.mailbox.base_url = value;
        }
        if let Some(value) = read_env("TRIAGO_MAILBOX_API_TOKEN") {
            self.mailbox.api_token = secret_value(value);
        }
        if let Some(value) = read_env("TRIAGO_MAILBOX_POLL_INTERVAL_SECS") {
            self.mailbox.poll_interval_secs =
                parse_u64("TRIAGO_MAILBOX_POLL_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("TRIAGO_MAILBOX_MAX_CONCURRENT_RUNS") {
            self.mailbox.max_concurrent_runs =
                parse_u32("TRIAGO_MAILBOX_MAX_CONCURRENT_RUNS", &value)?;
        }

        if let Some(value) = read_env("TRIAGO_REASONING_BASE_URL") {
            self.reasoning.base_url = value;
        }
        if let Some(value) = read_env("TRIAGO_REASONING_API_KEY") {
            self.reasoning.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("TRIAGO_REASONING_MODEL") {
            self.reasoning.model = value;
        }
        if let Some(value) = read_env("TRIAGO_REASONING_TIMEOUT_SECS") {
            self.reasoning.timeout_secs = parse_u64("TRIAGO_REASONING_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("TRIAGO_ENTITLEMENT_BASE_URL") {
            self.entitlement.base_url = value;
        }
        if let Some(value) = read_env("TRIAGO_ENTITLEMENT_API_KEY") {
            self.entitlement.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("TRIAGO_ENTITLEMENT_TIMEOUT_SECS") {
            self.entitlement.timeout_secs = parse_u64("TRIAGO_ENTITLEMENT_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("TRIAGO_TICKETING_BASE_URL") {
            self.ticketing.base_url = value;
        }
        if let Some(value) = read_env("TRIAGO_TICKETING_API_TOKEN") {
            self.ticketing.api_token = secret_value(value);
        }
        if let Some(value) = read_env("TRIAGO_TICKETING_TIMEOUT_SECS") {
            self.ticketing.timeout_secs = parse_u64("TRIAGO_TICKETING_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("TRIAGO_ENGINE_ENTRY_STEP") {
            self.engine.entry_step = value;
        }
        if let Some(value) = read_env("TRIAGO_ENGINE_INSTRUCTIONS_DIR") {
            self.engine.instructions_dir = PathBuf::from(value);
        }
        if let Some(value) = read_env("TRIAGO_ENGINE_MAX_ITERATIONS") {
            self.engine.max_iterations = parse_u32("TRIAGO_ENGINE_MAX_ITERATIONS", &value)?;
        }
        if let Some(value) = read_env("TRIAGO_ENGINE_RUN_DEADLINE_SECS") {
            self.engine.run_deadline_secs = parse_u64("TRIAGO_ENGINE_RUN_DEADLINE_SECS", &value)?;
        }
        if let Some(value) = read_env("TRIAGO_ENGINE_FUNCTION_TIMEOUT_SECS") {
            self.engine.function_timeout_secs =
                parse_u64("TRIAGO_ENGINE_FUNCTION_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("TRIAGO_RESILIENCE_RETRY_MAX_ATTEMPTS") {
            self.resilience.retry_max_attempts =
                parse_u32("TRIAGO_RESILIENCE_RETRY_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("TRIAGO_RESILIENCE_RETRY_INITIAL_BACKOFF_SECS") {
            self.resilience.retry_initial_backoff_secs =
                parse_u64("TRIAGO_RESILIENCE_RETRY_INITIAL_BACKOFF_SECS", &value)?;
        }
        if let Some(value) = read_env("TRIAGO_RESILIENCE_RETRY_MAX_BACKOFF_SECS") {
            self.resilience.retry_max_backoff_secs =
                parse_u64("TRIAGO_RESILIENCE_RETRY_MAX_BACKOFF_SECS", &value)?;
        }
        if let Some(value) = read_env("TRIAGO_RESILIENCE_BREAKER_FAILURE_THRESHOLD") {
            self.resilience.breaker_failure_threshold =
                parse_u32("TRIAGO_RESILIENCE_BREAKER_FAILURE_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("TRIAGO_RESILIENCE_BREAKER_COOLDOWN_SECS") {
            self.resilience.breaker_cooldown_secs =
                parse_u64("TRIAGO_RESILIENCE_BREAKER_COOLDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("TRIAGO_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("TRIAGO_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port = parse_u16("TRIAGO_SERVER_HEALTH_CHECK_PORT", &value)?;
        }
        if let Some(value) = read_env("TRIAGO_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("TRIAGO_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level = read_env("TRIAGO_LOGGING_LEVEL").or_else(|| read_env("TRIAGO_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("TRIAGO_LOGGING_FORMAT").or_else(|| read_env("TRIAGO_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(reasoning_model) = overrides.reasoning_model {
            self.reasoning.model = reasoning_model;
        }
        if let Some(instructions_dir) = overrides.instructions_dir {
            self.engine.instructions_dir = instructions_dir;
        }
        if let Some(entry_step) = overrides.entry_step {
            self.engine.entry_step = entry_step;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_mailbox(&self.mailbox)?;
        validate_reasoning(&self.reasoning)?;
        validate_entitlement(&self.entitlement)?;
        validate_ticketing(&self.ticketing)?;
        validate_engine(&self.engine)?;
        validate_resilience(&self.resilience)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    if let Some(from_env) = read_env("TRIAGO_CONFIG_PATH") {
        let path = PathBuf::from(from_env);
        return path.exists().then_some(path);
    }

    [PathBuf::from("triago.toml"), PathBuf::from("config/triago.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_base_url(field: &str, url: &str) -> Result<(), ConfigError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(ConfigError::Validation(format!("{field} is required")));
    }
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(ConfigError::Validation(format!(
            "{field} must start with http:// or https://"
        )));
    }
    Ok(())
}

fn validate_timeout(field: &str, timeout_secs: u64) -> Result<(), ConfigError> {
    if timeout_secs == 0 || timeout_secs > 300 {
        return Err(ConfigError::Validation(format!("{field} must be in range 1..=300")));
    }
    Ok(())
}

fn validate_mailbox(mailbox: &MailboxConfig) -> Result<(), ConfigError> {
    validate_base_url("mailbox.base_url", &mailbox.base_url)?;

    if mailbox.api_token.expose_secret().is_empty() {
        return Err(ConfigError::Validation(
            "mailbox.api_token is required to fetch and mark messages".to_string(),
        ));
    }

    if mailbox.poll_interval_secs == 0 || mailbox.poll_interval_secs > 3600 {
        return Err(ConfigError::Validation(
            "mailbox.poll_interval_secs must be in range 1..=3600".to_string(),
        ));
    }

    if mailbox.max_concurrent_runs == 0 || mailbox.max_concurrent_runs > 64 {
        return Err(ConfigError::Validation(
            "mailbox.max_concurrent_runs must be in range 1..=64".to_string(),
        ));
    }

    Ok(())
}

fn validate_reasoning(reasoning: &ReasoningConfig) -> Result<(), ConfigError> {
    validate_base_url("reasoning.base_url", &reasoning.base_url)?;
    validate_timeout("reasoning.timeout_secs", reasoning.timeout_secs)?;

    if reasoning.model.trim().is_empty() {
        return Err(ConfigError::Validation("reasoning.model is required".to_string()));
    }

    if let Some(api_key) = &reasoning.api_key {
        if api_key.expose_secret().trim().is_empty() {
            return Err(ConfigError::Validation(
                "reasoning.api_key may not be set to an empty value".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_entitlement(entitlement: &EntitlementConfig) -> Result<(), ConfigError> {
    validate_base_url("entitlement.base_url", &entitlement.base_url)?;
    validate_timeout("entitlement.timeout_secs", entitlement.timeout_secs)?;

    if let Some(api_key) = &entitlement.api_key {
        if api_key.expose_secret().trim().is_empty() {
            return Err(ConfigError::Validation(
                "entitlement.api_key may not be set to an empty value".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_ticketing(ticketing: &TicketingConfig) -> Result<(), ConfigError> {
    validate_base_url("ticketing.base_url", &ticketing.base_url)?;
    validate_timeout("ticketing.timeout_secs", ticketing.timeout_secs)?;

    if ticketing.api_token.expose_secret().is_empty() {
        return Err(ConfigError::Validation(
            "ticketing.api_token is required to create tickets and append notes".to_string(),
        ));
    }

    Ok(())
}

fn validate_engine(engine: &EngineConfig) -> Result<(), ConfigError> {
    engine.entry_step_name()?;

    if engine.instructions_dir.as_os_str().is_empty() {
        return Err(ConfigError::Validation("engine.instructions_dir is required".to_string()));
    }

    if engine.max_iterations == 0 || engine.max_iterations > 100 {
        return Err(ConfigError::Validation(
            "engine.max_iterations must be in range 1..=100".to_string(),
        ));
    }

    if engine.run_deadline_secs == 0 || engine.run_deadline_secs > 3600 {
        return Err(ConfigError::Validation(
            "engine.run_deadline_secs must be in range 1..=3600".to_string(),
        ));
    }

    validate_timeout("engine.function_timeout_secs", engine.function_timeout_secs)?;

    Ok(())
}

fn validate_resilience(resilience: &ResilienceConfig) -> Result<(), ConfigError> {
    if resilience.retry_max_attempts == 0 || resilience.retry_max_attempts > 10 {
        return Err(ConfigError::Validation(
            "resilience.retry_max_attempts must be in range 1..=10".to_string(),
        ));
    }

    if resilience.retry_initial_backoff_secs == 0 {
        return Err(ConfigError::Validation(
            "resilience.retry_initial_backoff_secs must be greater than zero".to_string(),
        ));
    }

    if resilience.retry_max_backoff_secs < resilience.retry_initial_backoff_secs {
        return Err(ConfigError::Validation(
            "resilience.retry_max_backoff_secs must be >= retry_initial_backoff_secs".to_string(),
        ));
    }

    if resilience.breaker_failure_threshold == 0 {
        return Err(ConfigError::Validation(
            "resilience.breaker_failure_threshold must be greater than zero".to_string(),
        ));
    }

    if resilience.breaker_cooldown_secs == 0 || resilience.breaker_cooldown_secs > 3600 {
        return Err(ConfigError::Validation(
            "resilience.breaker_cooldown_secs must be in range 1..=3600".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server.health_check_port must be greater than zero".to_string(),
        ));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    mailbox: Option<MailboxPatch>,
    reasoning: Option<ReasoningPatch>,
    entitlement: Option<EntitlementPatch>,
    ticketing: Option<TicketingPatch>,
    engine: Option<EnginePatch>,
    resilience: Option<ResiliencePatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct MailboxPatch {
    base_url: Option<String>,
    api_token: Option<String>,
    poll_interval_secs: Option<u64>,
    max_concurrent_runs: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct ReasoningPatch {
    base_url: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct EntitlementPatch {
    base_url: Option<String>,
    api_key: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct TicketingPatch {
    base_url: Option<String>,
    api_token: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct EnginePatch {
    entry_step: Option<String>,
    instructions_dir: Option<String>,
    max_iterations: Option<u32>,
    run_deadline_secs: Option<u64>,
    function_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ResiliencePatch {
    retry_max_attempts: Option<u32>,
    retry_initial_backoff_secs: Option<u64>,
    retry_max_backoff_secs: Option<u64>,
    breaker_failure_threshold: Option<u32>,
    breaker_cooldown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    fn set_required_tokens() {
        env::set_var("TRIAGO_MAILBOX_API_TOKEN", "mb-token");
        env::set_var("TRIAGO_TICKETING_API_TOKEN", "tk-token");
    }

    const REQUIRED_TOKEN_VARS: &[&str] =
        &["TRIAGO_MAILBOX_API_TOKEN", "TRIAGO_TICKETING_API_TOKEN"];

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_MAILBOX_TOKEN", "mb-from-env");
        env::set_var("TRIAGO_TICKETING_API_TOKEN", "tk-token");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("triago.toml");
            fs::write(
                &path,
                r#"
[mailbox]
api_token = "${TEST_MAILBOX_TOKEN}"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.mailbox.api_token.expose_secret() == "mb-from-env",
                "mailbox token should be loaded from environment",
            )?;
            Ok(())
        })();

        clear_vars(&["TEST_MAILBOX_TOKEN", "TRIAGO_TICKETING_API_TOKEN"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        set_required_tokens();
        env::set_var("TRIAGO_LOG_LEVEL", "warn");
        env::set_var("TRIAGO_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(REQUIRED_TOKEN_VARS);
        clear_vars(&["TRIAGO_LOG_LEVEL", "TRIAGO_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        set_required_tokens();
        env::set_var("TRIAGO_REASONING_MODEL", "model-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("triago.toml");
            fs::write(
                &path,
                r#"
[reasoning]
model = "model-from-file"

[engine]
entry_step = "classify-intent"

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    log_level: Some("debug".to_string()),
                    entry_step: Some("extract-identifier".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.reasoning.model == "model-from-env",
                "env reasoning model should win over the file value",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(
                config.engine.entry_step == "extract-identifier",
                "override entry step should win over the file value",
            )?;
            Ok(())
        })();

        clear_vars(REQUIRED_TOKEN_VARS);
        clear_vars(&["TRIAGO_REASONING_MODEL"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TRIAGO_MAILBOX_API_TOKEN", "mb-token");
        // No ticketing token: validation should name the missing field.

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("ticketing.api_token")
            );
            ensure(has_message, "validation failure should mention ticketing.api_token")
        })();

        clear_vars(REQUIRED_TOKEN_VARS);
        result
    }

    #[test]
    fn entry_step_must_be_a_valid_step_name() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        set_required_tokens();
        env::set_var("TRIAGO_ENGINE_ENTRY_STEP", "Not A Step");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => return Err("expected entry step validation failure".to_string()),
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("engine.entry_step")
            );
            ensure(has_message, "validation failure should mention engine.entry_step")
        })();

        clear_vars(REQUIRED_TOKEN_VARS);
        clear_vars(&["TRIAGO_ENGINE_ENTRY_STEP"]);
        result
    }

    #[test]
    fn backoff_bounds_are_ordered() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        set_required_tokens();
        env::set_var("TRIAGO_RESILIENCE_RETRY_MAX_BACKOFF_SECS", "1");
        env::set_var("TRIAGO_RESILIENCE_RETRY_INITIAL_BACKOFF_SECS", "5");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => return Err("expected resilience validation failure".to_string()),
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message)
                    if message.contains("retry_max_backoff_secs")
            );
            ensure(has_message, "validation failure should mention retry_max_backoff_secs")
        })();

        clear_vars(REQUIRED_TOKEN_VARS);
        clear_vars(&[
            "TRIAGO_RESILIENCE_RETRY_MAX_BACKOFF_SECS",
            "TRIAGO_RESILIENCE_RETRY_INITIAL_BACKOFF_SECS",
        ]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TRIAGO_MAILBOX_API_TOKEN", "mailbox-secret-value");
        env::set_var("TRIAGO_TICKETING_API_TOKEN", "ticketing-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(
                !debug.contains("mailbox-secret-value"),
                "debug output should not contain the mailbox token",
            )?;
            ensure(
                !debug.contains("ticketing-secret-value"),
                "debug output should not contain the ticketing token",
            )?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            Ok(())
        })();

        clear_vars(REQUIRED_TOKEN_VARS);
        result
    }

    #[test]
    fn resilience_defaults_convert_to_policy_objects() {
        let config = AppConfig::default();
        let retry = config.resilience.retry_policy();
        let breaker = config.resilience.breaker_config();

        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.initial_delay.as_secs(), 1);
        assert_eq!(retry.max_delay.as_secs(), 10);
        assert_eq!(breaker.failure_threshold, 5);
        assert_eq!(breaker.cooldown.as_secs(), 60);
    }
}
