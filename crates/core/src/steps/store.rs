use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::steps::definition::{FunctionSpec, StepDefinition, StepName, TransitionTarget};

/// Delimiter line opening and closing the TOML front matter of a step
/// file. Everything after the closing delimiter is the instruction body.
const FRONT_MATTER_DELIMITER: &str = "+++";

#[derive(Debug, Error)]
pub enum StepStoreError {
    #[error("step `{step}` is not known to the instruction store")]
    UnknownStep { step: StepName },
    #[error("could not read step file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not read instructions directory `{path}`: {source}")]
    ReadDir { path: PathBuf, source: std::io::Error },
    #[error("step file `{path}` front matter is invalid: {source}")]
    FrontMatter { path: PathBuf, source: toml::de::Error },
    #[error("step file `{path}` is malformed: {detail}")]
    Malformed { path: PathBuf, detail: String },
    #[error("step `{step}` is defined by both `{first}` and `{second}`")]
    DuplicateStep { step: StepName, first: PathBuf, second: PathBuf },
}

/// Source of step definitions.
///
/// Implementations serve a stable snapshot: a name loads the same
/// definition for the whole run, and file-backed stores only change
/// content on an explicit reload.
#[async_trait]
pub trait InstructionStore: Send + Sync {
    async fn load(&self, name: &StepName) -> Result<Arc<StepDefinition>, StepStoreError>;
}

#[derive(Deserialize)]
struct StepFrontMatter {
    name: String,
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    description: String,
    #[serde(default)]
    context_fields: Vec<String>,
    next_steps: Vec<String>,
    #[serde(default)]
    functions: Vec<FunctionFrontMatter>,
}

#[derive(Deserialize)]
struct FunctionFrontMatter {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_parameters")]
    parameters: toml::Value,
    #[serde(default)]
    required: Vec<String>,
}

fn default_version() -> u32 {
    1
}

fn default_parameters() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

/// Parses one step file: `+++` TOML front matter, then the markdown
/// instruction body.
pub fn parse_step_file(path: &Path, raw: &str) -> Result<StepDefinition, StepStoreError> {
    let malformed = |detail: &str| StepStoreError::Malformed {
        path: path.to_path_buf(),
        detail: detail.to_owned(),
    };

    let mut lines = raw.lines();
    match lines.next().map(str::trim) {
        Some(FRONT_MATTER_DELIMITER) => {}
        _ => return Err(malformed("missing opening `+++` front matter delimiter")),
    }

    let mut front = String::new();
    let mut body = String::new();
    let mut in_front = true;
    for line in lines {
        if in_front && line.trim() == FRONT_MATTER_DELIMITER {
            in_front = false;
            continue;
        }
        let sink = if in_front { &mut front } else { &mut body };
        sink.push_str(line);
        sink.push('\n');
    }
    if in_front {
        return Err(malformed("missing closing `+++` front matter delimiter"));
    }

    let front: StepFrontMatter = toml::from_str(&front)
        .map_err(|source| StepStoreError::FrontMatter { path: path.to_path_buf(), source })?;

    let name = StepName::new(front.name.clone())
        .map_err(|error| malformed(&format!("bad step name: {error}")))?;

    if front.next_steps.is_empty() {
        return Err(malformed("step declares no transitions"));
    }
    let mut next_steps = Vec::with_capacity(front.next_steps.len());
    for token in &front.next_steps {
        let target = TransitionTarget::parse(token)
            .map_err(|error| malformed(&format!("bad transition target: {error}")))?;
        next_steps.push(target);
    }

    let mut functions = Vec::with_capacity(front.functions.len());
    for function in front.functions {
        let parameters = serde_json::to_value(&function.parameters).map_err(|error| {
            malformed(&format!("parameters of `{}` not representable: {error}", function.name))
        })?;
        functions.push(FunctionSpec {
            name: function.name,
            description: function.description,
            parameters,
            required: function.required,
        });
    }

    let instructions = body.trim().to_owned();
    if instructions.is_empty() {
        return Err(malformed("empty instruction body"));
    }

    Ok(StepDefinition {
        name,
        version: front.version,
        description: front.description,
        instructions,
        functions,
        next_steps,
        context_fields: front.context_fields,
    })
}

type Snapshot = HashMap<StepName, Arc<StepDefinition>>;

/// Directory-backed store. Step files (`*.md`) are parsed once at
/// construction and again on [`FileInstructionStore::reload`]; loads in
/// between serve the held snapshot.
#[derive(Debug)]
pub struct FileInstructionStore {
    dir: PathBuf,
    snapshot: RwLock<Snapshot>,
}

impl FileInstructionStore {
    pub async fn load_dir(dir: impl Into<PathBuf>) -> Result<Self, StepStoreError> {
        let dir = dir.into();
        let snapshot = scan_dir(&dir).await?;
        Ok(Self { dir, snapshot: RwLock::new(snapshot) })
    }

    /// Re-reads the directory and swaps the snapshot. Returns the number
    /// of steps now served.
    pub async fn reload(&self) -> Result<usize, StepStoreError> {
        let next = scan_dir(&self.dir).await?;
        let count = next.len();
        let mut guard = self.snapshot.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = next;
        Ok(count)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All currently served definitions, name-sorted. Used by the CLI
    /// step lint and listings.
    pub fn definitions(&self) -> Vec<Arc<StepDefinition>> {
        let guard = self.snapshot.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut definitions: Vec<_> = guard.values().cloned().collect();
        definitions.sort_by(|a, b| a.name.as_str().cmp(b.name.as_str()));
        definitions
    }
}

async fn scan_dir(dir: &Path) -> Result<Snapshot, StepStoreError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|source| StepStoreError::ReadDir { path: dir.to_path_buf(), source })?;

    let mut paths = Vec::new();
    loop {
        let entry = entries
            .next_entry()
            .await
            .map_err(|source| StepStoreError::ReadDir { path: dir.to_path_buf(), source })?;
        let Some(entry) = entry else { break };
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some("md") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut snapshot: Snapshot = HashMap::new();
    let mut sources: HashMap<StepName, PathBuf> = HashMap::new();
    for path in paths {
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| StepStoreError::ReadFile { path: path.clone(), source })?;
        let definition = parse_step_file(&path, &raw)?;
        let name = definition.name.clone();
        if let Some(first) = sources.get(&name) {
            return Err(StepStoreError::DuplicateStep {
                step: name,
                first: first.clone(),
                second: path,
            });
        }
        sources.insert(name.clone(), path);
        snapshot.insert(name, Arc::new(definition));
    }
    Ok(snapshot)
}

#[async_trait]
impl InstructionStore for FileInstructionStore {
    async fn load(&self, name: &StepName) -> Result<Arc<StepDefinition>, StepStoreError> {
        let guard = self.snapshot.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard
            .get(name)
            .cloned()
            .ok_or_else(|| StepStoreError::UnknownStep { step: name.clone() })
    }
}

/// Map-backed store for tests and the replay harness.
#[derive(Default)]
pub struct InMemoryInstructionStore {
    steps: RwLock<Snapshot>,
}

impl InMemoryInstructionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, definition: StepDefinition) {
        let mut guard = self.steps.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.insert(definition.name.clone(), Arc::new(definition));
    }

    pub fn with_steps(definitions: impl IntoIterator<Item = StepDefinition>) -> Self {
        let store = Self::new();
        for definition in definitions {
            store.insert(definition);
        }
        store
    }
}

#[async_trait]
impl InstructionStore for InMemoryInstructionStore {
    async fn load(&self, name: &StepName) -> Result<Arc<StepDefinition>, StepStoreError> {
        let guard = self.steps.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard
            .get(name)
            .cloned()
            .ok_or_else(|| StepStoreError::UnknownStep { step: name.clone() })
    }
}
