use std::path::Path;

use anyhow::{Context, Result};
use tabled::{
    Table, Tabled,
    settings::{Padding, Style, object::Columns},
};

use crate::config::RunConfig;
use crate::dataset::mean;
use crate::runner::{self, RunResult};
use crate::task::{load_task, load_tasks_from_dir};

#[derive(Tabled)]
struct SuiteRow {
    #[tabled(rename = "TASK")]
    task_id: String,
    #[tabled(rename = "SUCCESS")]
    success: String,
    #[tabled(rename = "SCORE")]
    score: String,
    #[tabled(rename = "OUTCOME")]
    outcome: String,
    #[tabled(rename = "DURATION")]
    duration: String,
    #[tabled(rename = "REASON")]
    reason: String,
}

impl From<&RunResult> for SuiteRow {
    fn from(result: &RunResult) -> Self {
        Self {
            task_id: result.task_id.clone(),
            success: if result.success { "yes" } else { "no" }.to_string(),
            score: format!("{:.2}", result.score),
            outcome: result.outcome.clone(),
            duration: format!("{:.1}s", result.duration_s),
            reason: result.reason.clone(),
        }
    }
}

pub fn run(task_path: &Path, config_path: &Path, out_dir: &Path) -> Result<()> {
    let config = RunConfig::load(config_path)?;
    let task = load_task(task_path)?;
    let mut agent = runner::default_agent(&config)?;

    let result = runner::run_task(&task, &config, out_dir, &mut agent)
        .with_context(|| format!("Task '{}' failed to run", task.id))?;

    println!(
        "{}: score={} success={}",
        result.task_id, result.score, result.success
    );
    println!("trajectory: {}", result.trajectory_path.display());
    Ok(())
}

pub fn run_suite(tasks_dir: &Path, config_path: &Path, out_dir: &Path) -> Result<()> {
    let config = RunConfig::load(config_path)?;
    let tasks = load_tasks_from_dir(tasks_dir)?;
    if tasks.is_empty() {
        println!("No tasks found in {}", tasks_dir.display());
        return Ok(());
    }
    let mut agent = runner::default_agent(&config)?;

    let results = runner::run_suite(&tasks, &config, out_dir, &mut agent);
    println!("{}", render_summary(&results));
    Ok(())
}

fn render_summary(results: &[RunResult]) -> String {
    let rows: Vec<SuiteRow> = results.iter().map(SuiteRow::from).collect();
    let mut table = Table::new(rows);
    table
        .with(Style::blank())
        .modify(Columns::new(0..6), Padding::new(0, 1, 0, 0));

    let scores: Vec<f64> = results.iter().map(|r| r.score).collect();
    let passed = results.iter().filter(|r| r.success).count();
    format!(
        "{table}\n\n{passed}/{} succeeded, mean score {:.3}",
        results.len(),
        mean(&scores)
    )
}
