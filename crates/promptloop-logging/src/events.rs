use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Structured log events for the improvement pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LogEvent {
    PipelineStarted {
        run_id: String,
        call_id: String,
        active_iteration_id: i64,
        risk_tags: Vec<String>,
    },
    BaselineEvaluated {
        iteration_id: i64,
        aggregate_score: f64,
        personas_scored: usize,
    },
    /// The recorded call scored against every persona's expectations
    CallAnalyzed {
        call_id: String,
        average_score: f64,
        personas_scored: usize,
        personas_failed: usize,
    },
    CandidateProposed {
        iteration_id: i64,
        parent_id: i64,
        prompt_chars: usize,
        low_dimensions: Vec<String>,
    },
    ValidationCompleted {
        iteration_id: i64,
        passed: bool,
        violated: Vec<String>,
        warnings: usize,
    },
    PersonaSimulated {
        iteration_id: i64,
        persona_id: String,
        turns: usize,
        completion: String,
        aggregate_score: f64,
    },
    PersonaFailed {
        iteration_id: i64,
        persona_id: String,
        error: String,
    },
    EvaluationCompleted {
        iteration_id: i64,
        scored: usize,
        failed: usize,
        aggregate_score: f64,
    },
    PromotionDecided {
        iteration_id: i64,
        promoted: bool,
        candidate_score: f64,
        active_score: f64,
        delta: f64,
    },
    PipelineFailed {
        call_id: String,
        kind: String,
        error: String,
    },
    PipelineCancelled {
        call_id: String,
    },
    InvariantViolated {
        active_count: usize,
        detail: String,
    },
}

impl LogEvent {
    /// Add a timestamp to serialize with the event
    fn with_timestamp(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(obj) = value.as_object_mut() {
            obj.insert(
                "timestamp".to_string(),
                serde_json::Value::String(chrono::Utc::now().to_rfc3339()),
            );
        }
        value
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format with colors and visual structure
    #[default]
    Pretty,
    /// JSON lines format for machine consumption
    Json,
    /// Compact single-line format
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            _ => Err(format!("Unknown log format: {}", s)),
        }
    }
}

/// Logger for pipeline events - handles both console output and file logging
pub struct Logger {
    format: LogFormat,
    file_writer: Option<Mutex<File>>,
}

impl Logger {
    pub fn new(format: LogFormat) -> Self {
        Self {
            format,
            file_writer: None,
        }
    }

    /// Create a logger with file output in addition to console
    pub fn with_file(format: LogFormat, log_path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;

        Ok(Self {
            format,
            file_writer: Some(Mutex::new(file)),
        })
    }

    pub fn log(&self, event: &LogEvent) {
        // File sink is always JSON
        if let Some(ref writer) = self.file_writer {
            if let Ok(mut file) = writer.lock() {
                let _ = writeln!(file, "{}", event.with_timestamp());
            }
        }

        let line = match self.format {
            LogFormat::Json => serde_json::to_string(event).ok(),
            LogFormat::Pretty => Some(Self::render_pretty(event)),
            LogFormat::Compact => Some(Self::render_compact(
                event,
                &chrono::Utc::now().format("%H:%M:%S").to_string(),
            )),
        };

        if let Some(line) = line {
            let _ = writeln!(std::io::stderr(), "{}", line);
        }
    }

    fn render_pretty(event: &LogEvent) -> String {
        match event {
            LogEvent::PipelineStarted {
                call_id,
                active_iteration_id,
                risk_tags,
                ..
            } => {
                let tags = if risk_tags.is_empty() {
                    "none".to_string()
                } else {
                    risk_tags.join(", ")
                };
                format!(
                    "\n{}\n{}  {}{}\n{}  {} {}\n{}  {} {}\n{}\n",
                    "╭─────────────────────────────────────────────────────────────────────╮"
                        .bright_blue(),
                    "│".bright_blue(),
                    "promptloop".bold().bright_white(),
                    " ".repeat(57) + &"│".bright_blue().to_string(),
                    "│".bright_blue(),
                    "Call:".dimmed(),
                    Self::truncate_with_padding(
                        &format!("{} (active iteration {})", call_id, active_iteration_id),
                        60,
                        67
                    )
                    .dimmed(),
                    "│".bright_blue(),
                    "Risk:".dimmed(),
                    Self::truncate_with_padding(&tags, 60, 67).dimmed(),
                    "╰─────────────────────────────────────────────────────────────────────╯"
                        .bright_blue()
                )
            }
            LogEvent::BaselineEvaluated {
                iteration_id,
                aggregate_score,
                personas_scored,
            } => format!(
                "  {} {} iteration {} scored {:.2} over {} personas",
                "▶".bright_cyan(),
                "BASELINE".bright_cyan().bold(),
                iteration_id,
                aggregate_score,
                personas_scored
            ),
            LogEvent::CallAnalyzed {
                call_id,
                average_score,
                personas_scored,
                personas_failed,
            } => format!(
                "  {} {} {} scored {:.2} over {} personas{}",
                "▶".bright_cyan(),
                "CALL".bright_cyan().bold(),
                call_id,
                average_score,
                personas_scored,
                if *personas_failed > 0 {
                    format!(" ({} failed)", personas_failed).yellow().to_string()
                } else {
                    String::new()
                }
            ),
            LogEvent::CandidateProposed {
                iteration_id,
                parent_id,
                prompt_chars,
                low_dimensions,
            } => format!(
                "  {} {} iteration {} from {} ({} chars, targeting {})",
                "▶".bright_magenta(),
                "CANDIDATE".bright_magenta().bold(),
                iteration_id,
                parent_id,
                prompt_chars,
                if low_dimensions.is_empty() {
                    "general polish".to_string()
                } else {
                    low_dimensions.join(", ")
                }
            ),
            LogEvent::ValidationCompleted {
                passed,
                violated,
                warnings,
                ..
            } => {
                if *passed {
                    format!(
                        "    {} Validation passed ({} warnings)",
                        "✓".bright_green(),
                        warnings
                    )
                } else {
                    format!(
                        "    {} Validation failed: {}",
                        "✗".bright_red(),
                        violated.join(", ").bright_red()
                    )
                }
            }
            LogEvent::PersonaSimulated {
                persona_id,
                turns,
                completion,
                aggregate_score,
                ..
            } => format!(
                "    {} {:<22} {:>5.2}  {} turns, {}",
                "│".dimmed(),
                persona_id,
                aggregate_score,
                turns,
                completion.dimmed()
            ),
            LogEvent::PersonaFailed {
                persona_id, error, ..
            } => format!(
                "    {} {:<22} {}",
                "│".dimmed(),
                persona_id,
                format!("failed: {}", error).bright_red()
            ),
            LogEvent::EvaluationCompleted {
                iteration_id,
                scored,
                failed,
                aggregate_score,
            } => format!(
                "    {} Iteration {} aggregate {:.2} ({} scored, {} failed)",
                "→".bright_yellow(),
                iteration_id,
                aggregate_score,
                scored,
                failed
            ),
            LogEvent::PromotionDecided {
                iteration_id,
                promoted,
                candidate_score,
                active_score,
                delta,
            } => {
                let summary = format!(
                    "iteration {}: {:.2} vs {:.2} ({:+.2})",
                    iteration_id, candidate_score, active_score, delta
                );
                if *promoted {
                    format!("  {} Promoted {}", "✓".bright_green(), summary.bright_green())
                } else {
                    format!("  {} Rolled back {}", "↺".bright_yellow(), summary.bright_yellow())
                }
            }
            LogEvent::PipelineFailed {
                call_id,
                kind,
                error,
            } => format!(
                "\n{} Pipeline failed for {} ({}): {}",
                "✗".bright_red(),
                call_id,
                kind,
                error.bright_red()
            ),
            LogEvent::PipelineCancelled { call_id } => {
                format!("\n{} Pipeline cancelled for {}", "⚠".bright_yellow(), call_id)
            }
            LogEvent::InvariantViolated {
                active_count,
                detail,
            } => format!(
                "\n{} {} {} active iterations: {}",
                "✗".bright_red(),
                "INVARIANT VIOLATED:".bright_red().bold(),
                active_count,
                detail
            ),
        }
    }

    fn render_compact(event: &LogEvent, timestamp: &str) -> String {
        match event {
            LogEvent::PipelineStarted {
                call_id,
                active_iteration_id,
                ..
            } => format!(
                "[{}] pipeline:start {} active={}",
                timestamp, call_id, active_iteration_id
            ),
            LogEvent::BaselineEvaluated {
                iteration_id,
                aggregate_score,
                ..
            } => format!(
                "[{}] baseline:{} {:.2}",
                timestamp, iteration_id, aggregate_score
            ),
            LogEvent::CallAnalyzed {
                call_id,
                average_score,
                ..
            } => format!("[{}] call:{} {:.2}", timestamp, call_id, average_score),
            LogEvent::CandidateProposed {
                iteration_id,
                parent_id,
                ..
            } => format!(
                "[{}] candidate:{} parent={}",
                timestamp, iteration_id, parent_id
            ),
            LogEvent::ValidationCompleted {
                iteration_id,
                passed,
                violated,
                ..
            } => {
                if *passed {
                    format!("[{}] validate:{} ok", timestamp, iteration_id)
                } else {
                    format!(
                        "[{}] validate:{} fail={}",
                        timestamp,
                        iteration_id,
                        violated.join(",")
                    )
                }
            }
            LogEvent::PersonaSimulated {
                iteration_id,
                persona_id,
                aggregate_score,
                ..
            } => format!(
                "[{}] persona:{}:{} {:.2}",
                timestamp, iteration_id, persona_id, aggregate_score
            ),
            LogEvent::PersonaFailed {
                iteration_id,
                persona_id,
                error,
            } => format!(
                "[{}] persona:{}:{} error:{}",
                timestamp, iteration_id, persona_id, error
            ),
            LogEvent::EvaluationCompleted {
                iteration_id,
                scored,
                failed,
                aggregate_score,
            } => format!(
                "[{}] eval:{} {:.2} scored={} failed={}",
                timestamp, iteration_id, aggregate_score, scored, failed
            ),
            LogEvent::PromotionDecided {
                iteration_id,
                promoted,
                delta,
                ..
            } => format!(
                "[{}] {}:{} delta={:+.2}",
                timestamp,
                if *promoted { "promote" } else { "rollback" },
                iteration_id,
                delta
            ),
            LogEvent::PipelineFailed {
                call_id,
                kind,
                error,
            } => format!("[{}] pipeline:fail {} {}:{}", timestamp, call_id, kind, error),
            LogEvent::PipelineCancelled { call_id } => {
                format!("[{}] pipeline:cancel {}", timestamp, call_id)
            }
            LogEvent::InvariantViolated { active_count, .. } => {
                format!("[{}] invariant:active={}", timestamp, active_count)
            }
        }
    }

    /// Truncate a string and pad to exact width
    fn truncate_with_padding(s: &str, max_len: usize, total_width: usize) -> String {
        let truncated = if s.chars().count() > max_len {
            let cut: String = s.chars().take(max_len - 3).collect();
            format!("{}...", cut)
        } else {
            s.to_string()
        };

        let padding_needed = total_width.saturating_sub(truncated.chars().count() + 1);
        format!("{}{}│", truncated, " ".repeat(padding_needed))
    }
}
