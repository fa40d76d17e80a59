use std::path::Path;
use serde::Serialize;
use tracing::info;

use crate::models::RenderTask;
use crate::storage::is_remote_ref;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;
const DEFAULT_HOURS: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderRate {
  pub name: String,
  pub compute_per_hour: f64,
  pub storage_per_gb: f64,
}

impl ProviderRate {
  pub fn new(name: impl Into<String>, compute_per_hour: f64, storage_per_gb: f64) -> Self {
    Self {
      name: name.into(),
      compute_per_hour,
      storage_per_gb,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderCost {
  pub provider: String,
  pub compute: f64,
  pub storage: f64,
  pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostEstimate {
  pub task_id: String,
  pub estimated_hours: f64,
  pub input_gb: f64,
  pub providers: Vec<ProviderCost>,
  pub cheapest: Option<String>,
  pub min_cost: f64,
}

/// Advisory pricing only; never consulted by the scheduler.
#[derive(Debug, Clone)]
pub struct CostEstimator {
  providers: Vec<ProviderRate>,
}

impl Default for CostEstimator {
  fn default() -> Self {
    Self::new(vec![
      ProviderRate::new("aws", 0.10, 0.0004),
      ProviderRate::new("gcp", 0.095, 0.0004),
    ])
  }
}

impl CostEstimator {
  pub fn new(providers: Vec<ProviderRate>) -> Self {
    Self { providers }
  }

  pub fn estimate(&self, task: &RenderTask) -> CostEstimate {
    let hours = task
      .estimated_duration
      .filter(|secs| *secs > 0.0)
      .map(|secs| secs / 3600.0)
      .unwrap_or(DEFAULT_HOURS);
    let input_gb = input_size_gb(task);
    self.price(&task.id, hours, input_gb)
  }

  pub fn price(&self, task_id: &str, hours: f64, input_gb: f64) -> CostEstimate {
    let providers: Vec<ProviderCost> = self
      .providers
      .iter()
      .map(|rate| {
        let compute = hours * rate.compute_per_hour;
        let storage = input_gb * rate.storage_per_gb;
        ProviderCost {
          provider: rate.name.clone(),
          compute,
          storage,
          total: compute + storage,
        }
      })
      .collect();

    let cheapest = providers.iter().min_by(|a, b| a.total.total_cmp(&b.total));
    let estimate = CostEstimate {
      task_id: task_id.to_string(),
      estimated_hours: hours,
      input_gb,
      cheapest: cheapest.map(|c| c.provider.clone()),
      min_cost: cheapest.map(|c| c.total).unwrap_or(0.0),
      providers,
    };
    info!(
      task_id,
      min_cost = estimate.min_cost,
      cheapest = estimate.cheapest.as_deref().unwrap_or("none"),
      "cost estimated"
    );
    estimate
  }
}

/// Sum of the local inputs' sizes; remote or unreadable inputs count as zero.
fn input_size_gb(task: &RenderTask) -> f64 {
  let bytes: u64 = task
    .input_files()
    .iter()
    .filter(|input| !is_remote_ref(input))
    .filter_map(|input| std::fs::metadata(Path::new(input)).ok())
    .map(|meta| meta.len())
    .sum();
  bytes as f64 / BYTES_PER_GB
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::EngineKind;
  use std::time::Duration;

  #[test]
  fn defaults_to_one_hour_and_picks_cheapest() {
    let task = RenderTask::new("shot", EngineKind::Blender, ["/missing.blend"], "/tmp/out");
    let estimate = CostEstimator::default().estimate(&task);

    assert_eq!(estimate.estimated_hours, 1.0);
    assert_eq!(estimate.providers.len(), 2);
    assert_eq!(estimate.cheapest.as_deref(), Some("gcp"));
    assert!((estimate.min_cost - 0.095).abs() < 1e-12);
    assert!((estimate.providers[0].total - 0.10).abs() < 1e-12);
  }

  #[test]
  fn scales_with_duration_and_input_size() {
    let dir = tempfile::tempdir().unwrap();
    let scene = dir.path().join("a.blend");
    std::fs::write(&scene, vec![0u8; 1024 * 1024]).unwrap();
    let task = RenderTask::new("shot", EngineKind::Blender, [scene.display().to_string()], "/tmp/out")
      .with_estimated_duration(Duration::from_secs(7200));

    let estimate = CostEstimator::default().estimate(&task);
    assert_eq!(estimate.estimated_hours, 2.0);
    assert!((estimate.input_gb - 1.0 / 1024.0).abs() < 1e-12);
    let aws = &estimate.providers[0];
    assert!((aws.total - (0.2 + 0.0004 / 1024.0)).abs() < 1e-12);
  }

  #[test]
  fn no_providers_means_no_recommendation() {
    let estimate = CostEstimator::new(Vec::new()).price("t1", 1.0, 0.0);
    assert!(estimate.cheapest.is_none());
    assert_eq!(estimate.min_cost, 0.0);
  }
}
