//! Loop configuration stored as `rlm.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::alignment::policy::AlignmentPolicy;
use crate::core::budget::Budgets;
use crate::core::chunking::ChunkStrategy;

/// Loop configuration (TOML).
///
/// Every table is optional; missing fields fall back to the defaults below.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RlmConfig {
    #[serde(rename = "loop")]
    pub run: LoopConfig,
    pub context: ContextConfig,
    pub budgets: Budgets,
    pub deliberation: DeliberationConfig,
    pub alignment: AlignmentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    /// Hard cap on planner iterations; 0 means no iteration cap.
    pub max_iterations: u32,

    /// Wall-clock budget in minutes, checked between iterations; 0 disables it.
    pub max_minutes: u64,

    /// Planner attempts per iteration, including the first.
    pub planner_attempts: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 88,
            max_minutes: 48 * 60,
            planner_attempts: 2,
        }
    }
}

impl LoopConfig {
    pub fn max_minutes(&self) -> Option<u64> {
        (self.max_minutes > 0).then_some(self.max_minutes)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContextConfig {
    pub chunk_target_bytes: usize,
    pub strategy: ChunkStrategy,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            chunk_target_bytes: 64 * 1024,
            strategy: ChunkStrategy::Byte,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DeliberationStrategy {
    #[default]
    SingleAgent,
    Collab,
}

impl DeliberationStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliberationStrategy::SingleAgent => "single-agent",
            DeliberationStrategy::Collab => "collab",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeliberationConfig {
    pub enabled: bool,
    pub strategy: DeliberationStrategy,
    pub min_interval_iterations: u32,
    pub max_runs: u32,
    /// Briefs longer than this are truncated on a UTF-8 boundary.
    pub max_summary_bytes: usize,
    pub include_in_planner_prompt: bool,
    /// Persist deliberation prompt/output/meta artifacts.
    pub log_artifacts: bool,
}

impl Default for DeliberationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: DeliberationStrategy::SingleAgent,
            min_interval_iterations: 2,
            max_runs: 12,
            max_summary_bytes: 2048,
            include_in_planner_prompt: true,
            log_artifacts: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AlignmentConfig {
    pub enabled: bool,
    /// Fail closed: block turns the policy cannot route safely.
    pub enforce: bool,
    pub task_id: String,
    pub thread_id: String,
    pub agent_id: String,
    pub policy: AlignmentPolicy,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            enforce: false,
            task_id: "task".to_string(),
            thread_id: "main".to_string(),
            agent_id: "rlm".to_string(),
            policy: AlignmentPolicy::default(),
        }
    }
}

impl RlmConfig {
    pub fn validate(&self) -> Result<()> {
        if self.run.planner_attempts == 0 {
            return Err(anyhow!("loop.planner_attempts must be > 0"));
        }
        if self.context.chunk_target_bytes == 0 {
            return Err(anyhow!("context.chunk_target_bytes must be > 0"));
        }
        if self.deliberation.enabled {
            if self.deliberation.min_interval_iterations == 0 {
                return Err(anyhow!("deliberation.min_interval_iterations must be > 0"));
            }
            if self.deliberation.max_summary_bytes == 0 {
                return Err(anyhow!("deliberation.max_summary_bytes must be > 0"));
            }
        }
        if self.alignment.enabled {
            for (field, value) in [
                ("task_id", &self.alignment.task_id),
                ("thread_id", &self.alignment.thread_id),
                ("agent_id", &self.alignment.agent_id),
            ] {
                if value.trim().is_empty() {
                    return Err(anyhow!("alignment.{field} must be non-empty"));
                }
            }
        }
        self.budgets.validate()?;
        self.alignment.policy.validate()?;
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RlmConfig::default()`.
pub fn load_config(path: &Path) -> Result<RlmConfig> {
    if !path.exists() {
        let cfg = RlmConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RlmConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RlmConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
