//! CLI presentation: text formatters for plans, run outcomes and bundles.

use crate::pipeline::{GenerationJob, GenerationPlan, PipelineOutcome};
use crate::store::RunBundle;
use crate::types::RunId;
use comfy_table::Table;
use owo_colors::OwoColorize;

const PROMPT_PREVIEW_CHARS: usize = 60;

fn preview(text: &str) -> String {
    if text.chars().count() <= PROMPT_PREVIEW_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(PROMPT_PREVIEW_CHARS).collect();
    format!("{}...", cut)
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

/// Ordered job table: the anchor first, then the dependents.
pub fn format_plan_table(plan: &GenerationPlan, dependents: &[GenerationJob]) -> String {
    let mut table = Table::new();
    table.load_preset(comfy_table::presets::UTF8_FULL);
    table.set_header(vec!["#", "Role", "Seed", "Conditioned", "Formatter", "Prompt"]);
    for (index, job) in std::iter::once(&plan.anchor).chain(dependents).enumerate() {
        table.add_row(vec![
            (index + 1).to_string(),
            job.role.to_string(),
            job.seed.to_string(),
            yes_no(job.depends_on_fingerprint).to_string(),
            yes_no(job.bypass).to_string(),
            preview(&job.prompt),
        ]);
    }

    let mut out = format!(
        "Design: {}\nBase seed: {}{}\n",
        plan.design_id,
        plan.seeds.base_seed(),
        if plan.seeds.is_explicit() {
            " (explicit)"
        } else {
            ""
        }
    );
    for correction in &plan.corrections {
        out.push_str(&format!("Correction: {:?}\n", correction));
    }
    out.push_str(&table.to_string());
    out
}

pub fn format_outcome_text(outcome: &PipelineOutcome, color: bool) -> String {
    let mut out = String::new();
    match outcome {
        PipelineOutcome::Succeeded(success) => {
            let status = if color {
                "SUCCEEDED".green().bold().to_string()
            } else {
                "SUCCEEDED".to_string()
            };
            out.push_str(&format!("Run {}: {}\n", success.run_id, status));
            out.push_str(&format!(
                "Drift score: {:.3} ({})\n",
                success.consistency_report.overall_score,
                if success.consistency_report.passed {
                    "pass"
                } else {
                    "below expectations"
                }
            ));
            if success.reused_baseline {
                out.push_str(&format!(
                    "Inputs unchanged; reused baseline {}\n",
                    success.bundle.run_id
                ));
            }
            if let Some(composition) = &success.bundle.composition {
                out.push_str(&format!("Sheet: {}\n", composition.composed_artifact_ref));
            }
            if let Some(warning) = &success.persistence_warning {
                let line = format!("Warning: bundle not persisted: {}", warning);
                if color {
                    out.push_str(&line.yellow().to_string());
                } else {
                    out.push_str(&line);
                }
                out.push('\n');
            }
            out.push_str(&panel_table(
                success.panels.iter().map(|p| {
                    (
                        p.role.to_string(),
                        p.seed.to_string(),
                        p.artifact_ref
                            .as_ref()
                            .map(ToString::to_string)
                            .unwrap_or_default(),
                        p.retry_count.to_string(),
                    )
                }),
            ));
        }
        PipelineOutcome::Failed(failure) => {
            let status = if color {
                "FAILED".red().bold().to_string()
            } else {
                "FAILED".to_string()
            };
            out.push_str(&format!("Run {}: {}\n", failure.run_id, status));
            out.push_str(&format!("Error: {}\n", failure.error));
            if !failure.failed_roles.is_empty() {
                let roles: Vec<String> = failure.failed_roles.iter().map(ToString::to_string).collect();
                out.push_str(&format!("Failed roles: {}\n", roles.join(", ")));
            }
            for (role, score) in &failure.scores {
                out.push_str(&format!("  {:<20} {:.3}\n", role.to_string(), score));
            }
        }
    }
    out
}

fn panel_table(rows: impl Iterator<Item = (String, String, String, String)>) -> String {
    let mut table = Table::new();
    table.load_preset(comfy_table::presets::UTF8_FULL);
    table.set_header(vec!["Role", "Seed", "Artifact", "Retries"]);
    for (role, seed, artifact, retries) in rows {
        table.add_row(vec![role, seed, artifact, retries]);
    }
    table.to_string()
}

pub fn format_bundle_text(bundle: &RunBundle) -> String {
    let mut out = format!(
        "Design: {}\nRun: {}\nCreated: {}\nBase seed: {}\nGate: {} after {} round(s)\n",
        bundle.design_id,
        bundle.run_id,
        bundle.metadata.created_at.to_rfc3339(),
        bundle.metadata.base_seed,
        if bundle.consistency.gate_passed {
            "passed"
        } else {
            "skipped"
        },
        bundle.consistency.rounds,
    );
    if let Some(fingerprint) = &bundle.fingerprint {
        out.push_str(&format!(
            "Fingerprint: {} / {} / {}\n",
            fingerprint.massing_descriptor, fingerprint.roof_descriptor, fingerprint.style_descriptor
        ));
    }
    if let Some(drift) = &bundle.consistency.drift {
        out.push_str(&format!("Drift score: {:.3}\n", drift.overall_score));
    }
    out.push_str(&panel_table(bundle.panels.iter().map(|p| {
        (
            p.role.to_string(),
            p.seed.to_string(),
            p.artifact_ref
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
            p.retry_count.to_string(),
        )
    })));
    out
}

pub fn format_bundle_list(design_id: &str, runs: &[RunId]) -> String {
    if runs.is_empty() {
        return format!("No bundles for {}", design_id);
    }
    let mut table = Table::new();
    table.load_preset(comfy_table::presets::UTF8_FULL);
    table.set_header(vec!["#", "Run"]);
    for (index, run) in runs.iter().enumerate() {
        let label = if index + 1 == runs.len() {
            format!("{} (latest)", run)
        } else {
            run.to_string()
        };
        table.add_row(vec![(index + 1).to_string(), label]);
    }
    table.to_string()
}
