// Core types and functionality for the Cascade job orchestration engine

pub mod artifact;
pub mod config;
pub mod engine;
pub mod error;
pub mod job;
pub mod launcher;
pub mod registry;
pub mod storage;
pub mod types;
pub mod workflow;

pub use artifact::{ArtifactData, ArtifactStore};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{Error, Result};
pub use job::Job;
pub use launcher::{LaunchSpec, Launcher, ProcessLauncher};
pub use registry::{CommandKind, CommandRegistry, CommandSpec, ParamKind, StaticRegistry};
pub use types::*;
pub use workflow::{TemplateEdge, TemplateGraph, TemplateNode, Workflow};

#[cfg(test)]
pub(crate) mod testutil;
