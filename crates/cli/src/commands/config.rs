use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::ExposeSecret;
use toml::Value;
use triago_core::config::{AppConfig, LoadOptions};

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    let mut line = |key: &str, value: &str, env_key: &str| {
        let source =
            field_source(key, env_key, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(format!("- {key} = {value} (source: {source})"));
    };

    line("mailbox.base_url", &config.mailbox.base_url, "TRIAGO_MAILBOX_BASE_URL");
    line(
        "mailbox.api_token",
        &redact_token(config.mailbox.api_token.expose_secret()),
        "TRIAGO_MAILBOX_API_TOKEN",
    );
    line(
        "mailbox.poll_interval_secs",
        &config.mailbox.poll_interval_secs.to_string(),
        "TRIAGO_MAILBOX_POLL_INTERVAL_SECS",
    );
    line(
        "mailbox.max_concurrent_runs",
        &config.mailbox.max_concurrent_runs.to_string(),
        "TRIAGO_MAILBOX_MAX_CONCURRENT_RUNS",
    );

    line("reasoning.base_url", &config.reasoning.base_url, "TRIAGO_REASONING_BASE_URL");
    line("reasoning.model", &config.reasoning.model, "TRIAGO_REASONING_MODEL");
    line(
        "reasoning.api_key",
        if config.reasoning.api_key.is_some() { "<redacted>" } else { "<unset>" },
        "TRIAGO_REASONING_API_KEY",
    );
    line(
        "reasoning.timeout_secs",
        &config.reasoning.timeout_secs.to_string(),
        "TRIAGO_REASONING_TIMEOUT_SECS",
    );

    line("entitlement.base_url", &config.entitlement.base_url, "TRIAGO_ENTITLEMENT_BASE_URL");
    line(
        "entitlement.api_key",
        if config.entitlement.api_key.is_some() { "<redacted>" } else { "<unset>" },
        "TRIAGO_ENTITLEMENT_API_KEY",
    );
    line(
        "entitlement.timeout_secs",
        &config.entitlement.timeout_secs.to_string(),
        "TRIAGO_ENTITLEMENT_TIMEOUT_SECS",
    );

    line("ticketing.base_url", &config.ticketing.base_url, "TRIAGO_TICKETING_BASE_URL");
    line(
        "ticketing.api_token",
        &redact_token(config.ticketing.api_token.expose_secret()),
        "TRIAGO_TICKETING_API_TOKEN",
    );
    line(
        "ticketing.timeout_secs",
        &config.ticketing.timeout_secs.to_string(),
        "TRIAGO_TICKETING_TIMEOUT_SECS",
    );

    line("engine.entry_step", &config.engine.entry_step, "TRIAGO_ENGINE_ENTRY_STEP");
    line(
        "engine.instructions_dir",
        &config.engine.instructions_dir.display().to_string(),
        "TRIAGO_ENGINE_INSTRUCTIONS_DIR",
    );
    line(
        "engine.max_iterations",
        &config.engine.max_iterations.to_string(),
        "TRIAGO_ENGINE_MAX_ITERATIONS",
    );
    line(
        "engine.run_deadline_secs",
        &config.engine.run_deadline_secs.to_string(),
        "TRIAGO_ENGINE_RUN_DEADLINE_SECS",
    );
    line(
        "engine.function_timeout_secs",
        &config.engine.function_timeout_secs.to_string(),
        "TRIAGO_ENGINE_FUNCTION_TIMEOUT_SECS",
    );

    line(
        "resilience.retry_max_attempts",
        &config.resilience.retry_max_attempts.to_string(),
        "TRIAGO_RESILIENCE_RETRY_MAX_ATTEMPTS",
    );
    line(
        "resilience.retry_initial_backoff_secs",
        &config.resilience.retry_initial_backoff_secs.to_string(),
        "TRIAGO_RESILIENCE_RETRY_INITIAL_BACKOFF_SECS",
    );
    line(
        "resilience.retry_max_backoff_secs",
        &config.resilience.retry_max_backoff_secs.to_string(),
        "TRIAGO_RESILIENCE_RETRY_MAX_BACKOFF_SECS",
    );
    line(
        "resilience.breaker_failure_threshold",
        &config.resilience.breaker_failure_threshold.to_string(),
        "TRIAGO_RESILIENCE_BREAKER_FAILURE_THRESHOLD",
    );
    line(
        "resilience.breaker_cooldown_secs",
        &config.resilience.breaker_cooldown_secs.to_string(),
        "TRIAGO_RESILIENCE_BREAKER_COOLDOWN_SECS",
    );

    line("server.bind_address", &config.server.bind_address, "TRIAGO_SERVER_BIND_ADDRESS");
    line(
        "server.health_check_port",
        &config.server.health_check_port.to_string(),
        "TRIAGO_SERVER_HEALTH_CHECK_PORT",
    );
    line(
        "server.graceful_shutdown_secs",
        &config.server.graceful_shutdown_secs.to_string(),
        "TRIAGO_SERVER_GRACEFUL_SHUTDOWN_SECS",
    );

    line("logging.level", &config.logging.level, "TRIAGO_LOGGING_LEVEL");
    line("logging.format", &format!("{:?}", config.logging.format), "TRIAGO_LOGGING_FORMAT");

    lines.join("\n")
}

/// Mirrors the lookup order the config loader itself uses, so the
/// attribution below matches what actually got read.
fn detect_config_path() -> Option<PathBuf> {
    if let Some(from_env) = env::var_os("TRIAGO_CONFIG_PATH") {
        let path = PathBuf::from(from_env);
        return path.exists().then_some(path);
    }

    [PathBuf::from("triago.toml"), PathBuf::from("config/triago.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: &str,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if env::var_os(env_key).is_some() {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    if let Some((prefix, _)) = trimmed.split_once('-') {
        return format!("{prefix}-***");
    }

    "<redacted>".to_string()
}
