// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Checkpoint lister
//!
//! Shows every checkpoint of a job with its accuracy token and marks the one
//! the evaluator would load.

use anyhow::Result;
use clap::Parser;
use classifier_eval::checkpoint::{find_checkpoints, select_best, CheckpointCandidate, CheckpointNameFormat};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "list-checkpoints")]
#[command(about = "List the checkpoints of a training job")]
#[command(version)]
struct Args {
    /// Job directory containing models/
    #[arg(short, long)]
    job_dir: PathBuf,

    /// Checkpoint file extension
    #[arg(short, long, default_value = "hdf5")]
    extension: String,

    /// Print as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let format = CheckpointNameFormat::V1;

    let models_dir = args.job_dir.join("models");
    let files = find_checkpoints(&models_dir, &args.extension);
    if files.is_empty() {
        anyhow::bail!("No *.{} checkpoints under {}", args.extension, models_dir.display());
    }

    let mut candidates = Vec::new();
    let mut rejected = Vec::new();
    for path in files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match format.parse_token(&name) {
            Ok(token) => candidates.push(CheckpointCandidate { path, token }),
            Err(e) => rejected.push((path, e.to_string())),
        }
    }
    let best = select_best(&candidates);

    if args.json {
        let listing = serde_json::json!({
            "format": format.to_string(),
            "candidates": candidates,
            "selected": best.filter(|_| rejected.is_empty()).map(|b| &candidates[b].path),
            "rejected": rejected
                .iter()
                .map(|(path, reason)| serde_json::json!({"path": path, "reason": reason}))
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    println!("Checkpoints under {} ({}):", models_dir.display(), format);
    println!("{:-<70}", "");
    for (idx, candidate) in candidates.iter().enumerate() {
        let mark = if Some(idx) == best && rejected.is_empty() { "*" } else { " " };
        println!("{} {:<8} {}", mark, candidate.token, candidate.file_name());
    }
    for (path, reason) in &rejected {
        println!("! {:<8} {} ({})", "-", path.display(), reason);
    }
    println!("{:-<70}", "");

    if !rejected.is_empty() {
        tracing::warn!(
            "{} checkpoint name(s) do not follow {}; the evaluator will refuse this job",
            rejected.len(),
            format
        );
    }

    Ok(())
}
