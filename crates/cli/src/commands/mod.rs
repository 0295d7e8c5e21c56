pub mod config;
pub mod doctor;
pub mod replay;
pub mod steps;

/// What a subcommand hands back to `main`: rendered output plus the
/// process exit code.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

impl CommandResult {
    /// Machine-readable failure envelope shared by the subcommands.
    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let envelope = serde_json::json!({
            "command": command,
            "status": "error",
            "error_class": error_class,
            "message": message.into(),
        });
        Self { exit_code, output: envelope.to_string() }
    }
}
