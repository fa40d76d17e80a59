//! Execution backends. The scheduler only ever talks to [`RenderEngine`];
//! which tool sits behind an [`EngineKind`] is decided once, at startup, by
//! what gets put into the [`EngineRegistry`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use async_trait::async_trait;

use crate::models::{EngineCapabilities, EngineKind, RenderResult, RenderTask};

pub mod blender;
pub mod command;
pub mod process;

pub use blender::BlenderEngine;
pub use command::CommandEngine;

#[async_trait]
pub trait RenderEngine: Send + Sync {
  fn kind(&self) -> EngineKind;

  /// Inputs reachable and output directory creatable. Creating that
  /// directory is the only side effect allowed here.
  async fn validate(&self, task: &RenderTask) -> bool {
    process::validate_paths(task).await
  }

  fn capabilities(&self) -> EngineCapabilities;

  /// Run to completion or failure inside `work_dir`. Must honour the task's
  /// timeout and must not leave anything at the output path on failure.
  async fn execute(&self, task: &RenderTask, work_dir: &Path) -> RenderResult;
}

#[derive(Clone, Default)]
pub struct EngineRegistry {
  engines: HashMap<EngineKind, Arc<dyn RenderEngine>>,
}

impl EngineRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&mut self, engine: Arc<dyn RenderEngine>) -> &mut Self {
    self.engines.insert(engine.kind(), engine);
    self
  }

  pub fn with(mut self, engine: Arc<dyn RenderEngine>) -> Self {
    self.register(engine);
    self
  }

  pub fn get(&self, kind: EngineKind) -> Option<Arc<dyn RenderEngine>> {
    self.engines.get(&kind).cloned()
  }

  /// The engines among `kinds`; an empty set keeps everything.
  pub fn subset(&self, kinds: &BTreeSet<EngineKind>) -> Self {
    if kinds.is_empty() {
      return self.clone();
    }
    Self {
      engines: self
        .engines
        .iter()
        .filter(|(kind, _)| kinds.contains(kind))
        .map(|(kind, engine)| (*kind, engine.clone()))
        .collect(),
    }
  }

  pub fn kinds(&self) -> Vec<EngineKind> {
    let mut kinds: Vec<EngineKind> = self.engines.keys().copied().collect();
    kinds.sort();
    kinds
  }

  pub fn capabilities(&self) -> BTreeMap<EngineKind, EngineCapabilities> {
    self.engines
      .iter()
      .map(|(kind, engine)| (*kind, engine.capabilities()))
      .collect()
  }
}
