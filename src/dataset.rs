//! Offline dataset pipeline: collect run trajectories, score chunks, build
//! preference pairs. Records are JSONL; struct fields are declared in
//! alphabetical order so keys serialize sorted.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::reward::{ScoredChunk, assign_rewards, chunk_trajectory, final_reward};
use crate::trajectory::{TrajectoryEvent, load_trajectory};

const TRAJECTORY_SUFFIX: &str = "_trajectory.jsonl";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTrajectory {
    pub events: Vec<TrajectoryEvent>,
    pub path: PathBuf,
    pub task_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredTrajectory {
    pub chunks: Vec<ScoredChunk>,
    pub events: Vec<TrajectoryEvent>,
    pub path: PathBuf,
    pub task_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DpoRecord {
    pub chosen: String,
    pub prompt: String,
    pub rejected: String,
}

/// Every `*_trajectory.jsonl` under `runs_dir`, sorted by path.
pub fn collect_runs(runs_dir: &Path) -> Result<Vec<RawTrajectory>> {
    let pattern = runs_dir.join(format!("*{}", TRAJECTORY_SUFFIX));
    let pattern = pattern
        .to_str()
        .with_context(|| format!("Runs directory is not valid UTF-8: {}", runs_dir.display()))?;

    let mut paths = glob::glob(pattern)
        .context("Invalid runs glob pattern")?
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to enumerate trajectories")?;
    paths.sort();

    paths
        .into_iter()
        .map(|path| {
            let task_id = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(TRAJECTORY_SUFFIX))
                .unwrap_or_default()
                .to_string();
            let events = load_trajectory(&path)?;
            debug!(task_id = %task_id, events = events.len(), "dataset:collected");
            Ok(RawTrajectory {
                events,
                path,
                task_id,
            })
        })
        .collect()
}

/// Chunk and reward every trajectory using its recorded outcome score.
pub fn score_dataset(raw: Vec<RawTrajectory>) -> Vec<ScoredTrajectory> {
    raw.into_iter()
        .map(|record| {
            let reward = final_reward(&record.events);
            let chunks = assign_rewards(chunk_trajectory(&record.events), reward);
            debug!(task_id = %record.task_id, chunks = chunks.len(), reward, "dataset:scored");
            ScoredTrajectory {
                chunks,
                events: record.events,
                path: record.path,
                task_id: record.task_id,
            }
        })
        .collect()
}

/// Lowest-reward chunk as rejected, highest as chosen. On ties the earliest
/// chunk is rejected and the latest chosen. Trajectories without chunks are
/// skipped.
pub fn make_dpo_records(scored: &[ScoredTrajectory]) -> Vec<DpoRecord> {
    scored
        .iter()
        .filter_map(|record| {
            let rejected = record
                .chunks
                .iter()
                .min_by(|a, b| a.reward.total_cmp(&b.reward))?;
            let chosen = record
                .chunks
                .iter()
                .max_by(|a, b| a.reward.total_cmp(&b.reward))?;
            Some(DpoRecord {
                chosen: chosen.chunk.assistant_text.clone(),
                prompt: chosen.chunk.state_summary.clone(),
                rejected: rejected.chunk.assistant_text.clone(),
            })
        })
        .collect()
}

/// Arithmetic mean, 0.0 for no values.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Write one JSON record per line, creating parent directories.
pub fn write_jsonl<T: Serialize>(records: &[T], out_path: &Path) -> Result<usize> {
    if let Some(parent) = out_path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let file = File::create(out_path)
        .with_context(|| format!("Failed to create {}", out_path.display()))?;
    let mut writer = BufWriter::new(file);
    for record in records {
        serde_json::to_writer(&mut writer, record)?;
        writer.write_all(b"\n")?;
    }
    writer
        .flush()
        .with_context(|| format!("Failed to write {}", out_path.display()))?;
    info!(path = %out_path.display(), records = records.len(), "dataset:written");
    Ok(records.len())
}

/// Read JSONL records, skipping blank lines.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut records = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(
            serde_json::from_str(&line)
                .with_context(|| format!("{}:{}: invalid record", path.display(), index + 1))?,
        );
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    use crate::trajectory::{EventType, TrajectoryWriter, trajectory_file_name};

    fn write_run(dir: &Path, task_id: &str, texts: &[&str], score: f64) {
        let mut writer = TrajectoryWriter::create(&dir.join(trajectory_file_name(task_id))).unwrap();
        writer
            .log(EventType::Config, json!({"model": {"model": "m"}, "sandbox": {"type": "local"}}))
            .unwrap();
        for text in texts {
            writer
                .log(
                    EventType::Message,
                    json!({"role": "assistant", "content": text, "tool_calls": []}),
                )
                .unwrap();
        }
        writer
            .log(EventType::Outcome, json!({"success": score > 0.0, "score": score}))
            .unwrap();
    }

    #[test]
    fn collects_sorted_trajectories_only() {
        let dir = TempDir::new().unwrap();
        write_run(dir.path(), "b", &["x"], 1.0);
        write_run(dir.path(), "a", &["y"], 0.0);
        fs::write(dir.path().join("notes.jsonl"), "{}\n").unwrap();

        let runs = collect_runs(dir.path()).unwrap();
        let ids: Vec<&str> = runs.iter().map(|r| r.task_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(runs[1].events.len(), 3);
    }

    #[test]
    fn pipeline_produces_preference_pairs() {
        let dir = TempDir::new().unwrap();
        let runs_dir = dir.path().join("runs");
        write_run(&runs_dir, "solved", &["explore", "patch", "SUCCESS"], 1.0);
        write_run(&runs_dir, "silent", &[], 0.0);

        let raw = collect_runs(&runs_dir).unwrap();
        let raw_path = dir.path().join("data/raw.jsonl");
        assert_eq!(write_jsonl(&raw, &raw_path).unwrap(), 2);
        let raw: Vec<RawTrajectory> = read_jsonl(&raw_path).unwrap();

        let scored = score_dataset(raw);
        let solved = scored.iter().find(|s| s.task_id == "solved").unwrap();
        assert_eq!(solved.chunks.len(), 3);
        assert_eq!(solved.chunks[2].reward, 1.0);

        let dpo = make_dpo_records(&scored);
        assert_eq!(dpo.len(), 1);
        assert_eq!(dpo[0].chosen, "SUCCESS");
        assert_eq!(dpo[0].rejected, "explore");
        assert!(dpo[0].prompt.contains("\"sandbox\""));

        let dpo_path = dir.path().join("data/dpo.jsonl");
        write_jsonl(&dpo, &dpo_path).unwrap();
        let line = fs::read_to_string(&dpo_path).unwrap();
        assert!(line.starts_with("{\"chosen\":"));
    }

    #[test]
    fn ties_reject_earliest_and_choose_latest() {
        let chunk = |text: &str| crate::reward::Chunk {
            assistant_text: text.to_string(),
            observations: Vec::new(),
            outcome_features: Default::default(),
            state_summary: "s".to_string(),
            tool_calls: Vec::new(),
        };
        let scored = ScoredTrajectory {
            chunks: ["a", "b", "c"]
                .into_iter()
                .map(|t| ScoredChunk {
                    advantage: 0.0,
                    chunk: chunk(t),
                    reward: 0.0,
                })
                .collect(),
            events: Vec::new(),
            path: PathBuf::from("x"),
            task_id: "x".to_string(),
        };
        let dpo = make_dpo_records(&[scored]);
        assert_eq!(dpo[0].rejected, "a");
        assert_eq!(dpo[0].chosen, "c");
    }

    #[test]
    fn mean_of_nothing_is_zero() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(mean(&[1.0, 0.0]), 0.5);
    }
}
