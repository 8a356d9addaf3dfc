use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use colored::Colorize;
use serde::Serialize;

use promptloop_core::{
    BotIteration, Call, IterationError, IterationManager, IterationStatus, Persona, PersonaSuite,
    PipelineOutcome, PipelineQueue, PipelineResult, PipelineRunner, RiskLevel, RollbackReason, TrendReport,
    DEFAULT_BASELINE_PROMPT,
};
use promptloop_db::Database;

pub fn print_result(result: &PipelineResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    eprintln!();
    match &result.outcome {
        PipelineOutcome::Promoted {
            candidate_id,
            superseded_id,
            candidate_score,
            previous_score,
            delta,
        } => {
            eprintln!("{}", "=== PROMOTED ===".bright_green().bold());
            eprintln!("Iteration {} replaces {}", candidate_id, superseded_id);
            eprintln!(
                "Score: {:.2} (was {:.2}, {:+.2})",
                candidate_score, previous_score, delta
            );
        }
        PipelineOutcome::RolledBack {
            candidate_id,
            reason,
        } => {
            eprintln!("{}", "=== ROLLED BACK ===".bright_yellow().bold());
            eprintln!("Iteration {} was not promoted", candidate_id);
            match reason {
                RollbackReason::Validation { violated } => {
                    eprintln!("Failed validation: {}", violated.join(", "));
                }
                RollbackReason::Regression {
                    candidate_score,
                    active_score,
                    delta,
                } => {
                    eprintln!(
                        "Regression: {:.2} vs Active {:.2} ({:+.2})",
                        candidate_score, active_score, delta
                    );
                }
            }
        }
        PipelineOutcome::Failed {
            kind,
            error,
            candidate_id,
        } => {
            eprintln!("{}", "=== FAILED ===".bright_red().bold());
            eprintln!("{}: {}", kind, error);
            if let Some(id) = candidate_id {
                eprintln!("Iteration {} left unpromoted", id);
            }
        }
        PipelineOutcome::Cancelled { candidate_id } => {
            eprintln!("{}", "=== CANCELLED ===".bright_yellow().bold());
            if let Some(id) = candidate_id {
                eprintln!("Iteration {} left unpromoted", id);
            }
        }
    }

    if !result.scores.is_empty() {
        eprintln!("{}", "Persona scores:".dimmed());
        for (persona, score) in &result.scores {
            eprintln!("  {:<24} {:.2}", persona, score);
        }
    }
    eprintln!("Call: {}", result.call_id);
    eprintln!("Duration: {}", format_duration(result.total_duration_secs));
    Ok(())
}

pub async fn process_pending(
    runner: Arc<PipelineRunner>,
    max_concurrent: usize,
    json: bool,
) -> Result<i32> {
    let pending = runner.pending_call_ids()?;
    if pending.is_empty() {
        if !json {
            println!("{}", "No unprocessed calls.".dimmed());
        }
        return Ok(0);
    }

    eprintln!("Processing {} call(s)...", pending.len());
    let queue = PipelineQueue::start(runner, max_concurrent, pending.len());
    for call_id in pending {
        queue.submit(call_id).await?;
    }
    let results = queue.shutdown().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        println!(
            "{:<24} {:<12} {:<10} {}",
            "CALL".dimmed(),
            "OUTCOME".dimmed(),
            "ITERATION".dimmed(),
            "SCORE".dimmed(),
        );
        for r in &results {
            println!(
                "{:<24} {:<12} {:<10} {}",
                r.call_id,
                colored_status(r.outcome.status()),
                r.new_iteration_id()
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                format_score(r.aggregate),
            );
        }
    }

    // Worst outcome wins: cancelled, then failed
    let codes: Vec<i32> = results.iter().map(|r| r.outcome.exit_code()).collect();
    Ok(if codes.contains(&130) {
        130
    } else if codes.contains(&2) {
        2
    } else {
        0
    })
}

pub fn status(runner: &PipelineRunner, json: bool) -> Result<()> {
    let status = runner.get_status()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("{}", "=== Status ===".bright_blue().bold());
    println!("{}  {}", "Active Iteration:".dimmed(), status.active_iteration_id);
    println!("{}  {}", "Score:".dimmed(), format_score(status.active_score));
    println!("{}  {}", "Prompt Hash:".dimmed(), &status.prompt_hash[..12.min(status.prompt_hash.len())]);
    println!(
        "{}  {}",
        "Active Since:".dimmed(),
        status.active_since.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("{}  {}", "Iterations:".dimmed(), status.total_iterations);
    println!("{}  {}", "Pending Calls:".dimmed(), status.pending_calls);
    Ok(())
}

pub fn calls(runner: &PipelineRunner, limit: Option<usize>, json: bool) -> Result<()> {
    let summaries = runner.list_evaluable_calls(limit)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }
    if summaries.is_empty() {
        println!("{}", "No calls found.".dimmed());
        return Ok(());
    }

    println!(
        "{:<20} {:<24} {:<6} {:<12} {}",
        "TIMESTAMP".dimmed(),
        "CALL".dimmed(),
        "SEGS".dimmed(),
        "OUTCOME".dimmed(),
        "RISK TAGS".dimmed(),
    );
    for s in &summaries {
        let outcome = s.last_outcome.as_deref().unwrap_or("pending");
        println!(
            "{:<20} {:<24} {:<6} {:<12} {}",
            s.timestamp.format("%Y-%m-%d %H:%M"),
            s.id,
            s.segments,
            colored_status(outcome),
            s.risk_tags.join(", "),
        );
    }
    Ok(())
}

pub async fn seed(manager: &IterationManager, prompt_file: Option<&Path>, json: bool) -> Result<()> {
    let prompt = match prompt_file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?
            .trim()
            .to_string(),
        None => DEFAULT_BASELINE_PROMPT.to_string(),
    };

    let iteration = match manager.seed(&prompt).await {
        Ok(iteration) => iteration,
        Err(IterationError::AlreadySeeded) => {
            anyhow::bail!("Iterations already exist; the seed can only be created once")
        }
        Err(e) => return Err(e).context("Failed to seed iteration"),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&iteration)?);
    } else {
        eprintln!(
            "{} Seeded iteration {} ({} chars)",
            "✓".bright_green(),
            iteration.id,
            iteration.prompt_text.chars().count()
        );
    }
    Ok(())
}

#[derive(Serialize)]
struct HistoryReport<'a> {
    iterations: &'a [BotIteration],
    trend: &'a TrendReport,
}

pub fn history(manager: &IterationManager, json: bool) -> Result<()> {
    let iterations = manager.history()?;
    let trend = TrendReport::from_history(&iterations);

    if json {
        let report = HistoryReport {
            iterations: &iterations,
            trend: &trend,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    if iterations.is_empty() {
        println!("{}", "No iterations yet. Run `promptloop seed` first.".dimmed());
        return Ok(());
    }

    println!(
        "{:<5} {:<12} {:<7} {:<7} {:<17} {}",
        "ID".dimmed(),
        "STATUS".dimmed(),
        "PARENT".dimmed(),
        "SCORE".dimmed(),
        "CREATED".dimmed(),
        "REASON".dimmed(),
    );
    for it in &iterations {
        let status = match it.status {
            IterationStatus::Active => it.status.to_string().bright_green().to_string(),
            IterationStatus::RolledBack => it.status.to_string().bright_red().to_string(),
            IterationStatus::Superseded => it.status.to_string().dimmed().to_string(),
            _ => it.status.to_string().bright_cyan().to_string(),
        };
        println!(
            "{:<5} {:<12} {:<7} {:<7} {:<17} {}",
            it.id,
            status,
            it.parent_id
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            format_score(it.aggregate_score),
            it.created_at.format("%Y-%m-%d %H:%M"),
            it.status_reason.as_deref().unwrap_or(""),
        );
    }

    println!();
    println!("{}  {}", "Trend:".dimmed(), trend.trend);
    println!(
        "{}  {} promoted, {} rolled back",
        "Decisions:".dimmed(),
        trend.promotions,
        trend.rollbacks
    );
    println!(
        "{}  current {}, best {}, worst {}",
        "Scores:".dimmed(),
        format_score(trend.current_score),
        format_score(trend.best_score),
        format_score(trend.worst_score)
    );
    if let Some(avg) = trend.average_improvement {
        println!("{}  {:+.2}", "Avg Improvement:".dimmed(), avg);
    }
    if let Some(volatility) = trend.volatility {
        println!("{}  {:.2}", "Volatility:".dimmed(), volatility);
    }
    Ok(())
}

pub fn import_call(db: &Database, file: &Path, json: bool) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let call: Call = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse call in {}", file.display()))?;

    if !call.is_evaluable() {
        eprintln!(
            "{} Call {} has an empty transcript and will not be processed",
            "⚠".bright_yellow(),
            call.id
        );
    }

    let stored = db
        .calls()
        .insert(&call.to_record()?)
        .context("Failed to store call")?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "call_id": call.id, "stored": stored })
        );
    } else if stored {
        eprintln!("{} Stored call {}", "✓".bright_green(), call.id);
    } else {
        eprintln!("Call {} already exists; left unchanged", call.id);
    }
    Ok(())
}

/// Catalogue filters for the `personas` command. Difficulty bounds are
/// inclusive.
#[derive(Debug, Clone, Copy)]
pub struct PersonaFilter {
    pub risk: Option<RiskLevel>,
    pub min_difficulty: f64,
    pub max_difficulty: f64,
}

impl Default for PersonaFilter {
    fn default() -> Self {
        Self {
            risk: None,
            min_difficulty: 0.0,
            max_difficulty: 1.0,
        }
    }
}

pub fn select_personas<'a>(suite: &'a PersonaSuite, filter: &PersonaFilter) -> Vec<&'a Persona> {
    let in_range = suite.by_difficulty(filter.min_difficulty, filter.max_difficulty);
    match filter.risk {
        Some(level) => suite
            .by_risk_level(level)
            .into_iter()
            .filter(|p| in_range.iter().any(|r| r.id == p.id))
            .collect(),
        None => in_range,
    }
}

pub fn personas(suite: &PersonaSuite, filter: &PersonaFilter, json: bool) -> Result<()> {
    if filter.min_difficulty > filter.max_difficulty {
        anyhow::bail!(
            "--min-difficulty {} is above --max-difficulty {}",
            filter.min_difficulty,
            filter.max_difficulty
        );
    }
    let selected = select_personas(suite, filter);
    if json {
        println!("{}", serde_json::to_string_pretty(&selected)?);
        return Ok(());
    }

    println!(
        "{:<24} {:<20} {:<7} {:<5} {}",
        "ID".dimmed(),
        "NAME".dimmed(),
        "RISK".dimmed(),
        "DIFF".dimmed(),
        "DESCRIPTION".dimmed(),
    );
    for p in selected {
        let description = if p.description.chars().count() > 60 {
            format!("{}...", p.description.chars().take(60).collect::<String>())
        } else {
            p.description.clone()
        };
        println!(
            "{:<24} {:<20} {:<7} {:<5.2} {}",
            p.id, p.name, p.risk_level, p.difficulty, description
        );
    }
    Ok(())
}

fn colored_status(status: &str) -> String {
    match status {
        "promoted" => status.bright_green().to_string(),
        "failed" => status.bright_red().to_string(),
        "pending" => status.bright_cyan().to_string(),
        _ => status.bright_yellow().to_string(),
    }
}

fn format_score(score: Option<f64>) -> String {
    score
        .map(|s| format!("{:.2}", s))
        .unwrap_or_else(|| "-".to_string())
}

fn format_duration(secs: f64) -> String {
    if secs < 60.0 {
        format!("{:.0}s", secs)
    } else {
        let mins = (secs / 60.0).floor() as u64;
        let remaining_secs = (secs % 60.0) as u64;
        format!("{}m {}s", mins, remaining_secs)
    }
}
