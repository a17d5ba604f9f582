use std::collections::{BTreeMap, HashMap};

/// Declared type of a command parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// The parameter names an artifact (concrete or deferred).
    Artifact,
    /// The parameter is a plain JSON value.
    Scalar,
}

/// What kind of work a command performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Regular processing: consumes input artifacts, produces outputs whose
    /// provenance records the job's parameters.
    Processing,
    /// Bootstraps an artifact from raw files; produces exactly one parentless
    /// output with no provenance.
    ArtifactDefinition,
}

/// Static description of a runnable command: its parameters and the named
/// output slots its jobs must fill on completion.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub name: String,
    pub kind: CommandKind,
    pub parameters: BTreeMap<String, ParamKind>,
    pub outputs: Vec<String>,
}

impl CommandSpec {
    pub fn new(
        name: impl Into<String>,
        kind: CommandKind,
        parameters: BTreeMap<String, ParamKind>,
        outputs: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            parameters,
            outputs,
        }
    }
}

/// Source of command definitions. The engine only needs lookup by name; how
/// the catalog is populated (static table, plugin discovery) is up to the
/// implementation.
pub trait CommandRegistry: Send + Sync {
    fn command(&self, name: &str) -> Option<CommandSpec>;
}

/// Fixed in-memory command catalog.
#[derive(Debug, Default)]
pub struct StaticRegistry {
    commands: HashMap<String, CommandSpec>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: CommandSpec) {
        self.commands.insert(spec.name.clone(), spec);
    }
}

impl CommandRegistry for StaticRegistry {
    fn command(&self, name: &str) -> Option<CommandSpec> {
        self.commands.get(name).cloned()
    }
}
