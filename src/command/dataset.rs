use std::path::Path;

use anyhow::Result;

use crate::dataset::{
    DpoRecord, RawTrajectory, ScoredTrajectory, collect_runs, make_dpo_records, read_jsonl,
    score_dataset, write_jsonl,
};

pub fn collect(runs_dir: &Path, out: &Path) -> Result<()> {
    let raw = collect_runs(runs_dir)?;
    let written = write_jsonl(&raw, out)?;
    println!("Collected {} trajectories into {}", written, out.display());
    Ok(())
}

pub fn ipa_score(input: &Path, out: &Path) -> Result<()> {
    let raw: Vec<RawTrajectory> = read_jsonl(input)?;
    let scored = score_dataset(raw);
    let chunks: usize = scored.iter().map(|s| s.chunks.len()).sum();
    let written = write_jsonl(&scored, out)?;
    println!(
        "Scored {} trajectories ({} chunks) into {}",
        written,
        chunks,
        out.display()
    );
    Ok(())
}

pub fn make_dpo(input: &Path, out: &Path) -> Result<()> {
    let scored: Vec<ScoredTrajectory> = read_jsonl(input)?;
    let records: Vec<DpoRecord> = make_dpo_records(&scored);
    let written = write_jsonl(&records, out)?;
    println!("Wrote {} preference pairs to {}", written, out.display());
    Ok(())
}
