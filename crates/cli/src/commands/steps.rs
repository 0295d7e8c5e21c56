use triago_core::config::{AppConfig, LoadOptions};
use triago_core::steps::FileInstructionStore;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => return format!("failed to initialize async runtime: {error}"),
    };

    let dir = &config.engine.instructions_dir;
    let store = match runtime.block_on(FileInstructionStore::load_dir(dir)) {
        Ok(store) => store,
        Err(error) => return format!("failed to load `{}`: {error}", dir.display()),
    };

    let mut definitions = store.definitions();
    definitions.sort_by(|a, b| a.name.as_str().cmp(b.name.as_str()));

    let mut lines =
        vec![format!("instruction set at `{}` ({} steps):", dir.display(), definitions.len())];

    for definition in &definitions {
        let marker =
            if config.engine.entry_step == definition.name.as_str() { " (entry)" } else { "" };
        lines.push(format!("- {} v{}{marker}", definition.name, definition.version));
        if !definition.description.is_empty() {
            lines.push(format!("    {}", definition.description));
        }

        let functions = if definition.functions.is_empty() {
            "none".to_string()
        } else {
            definition
                .functions
                .iter()
                .map(|function| function.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };
        lines.push(format!("    functions: {functions}"));

        let targets = definition
            .next_steps
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        lines.push(format!("    next: {targets}"));

        if !definition.context_fields.is_empty() {
            lines.push(format!("    context: {}", definition.context_fields.join(", ")));
        }
    }

    lines.join("\n")
}
