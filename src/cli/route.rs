//! CLI route: single route table and run context. Dispatches to library services and presentation.

use crate::cli::parse::{BundleCommands, Commands, ConfigCommands};
use crate::cli::presentation::{
    format_bundle_list, format_bundle_text, format_outcome_text, format_plan_table,
};
use crate::config::{ArchsheetConfig, ConfigLoader};
use crate::design::DesignSpecification;
use crate::error::{PipelineError, StorageError};
use crate::pipeline::{
    JobPlanner, PacingQueue, Pipeline, PipelineOutcome, PipelineServices, PipelineSettings,
    PlanOptions, QueueEventContext, RunOptions,
};
use crate::progress::ProgressRuntime;
use crate::provider::http::HttpServices;
use crate::provider::DefaultPromptComposer;
use crate::seed::SeedPlan;
use crate::store::{BaselineStore, SledBaselineStore};
use crate::types::{PanelRole, RunId, Seed};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Runtime context for CLI execution: workspace and effective configuration.
pub struct RunContext {
    workspace_root: PathBuf,
    config: ArchsheetConfig,
    progress: Arc<ProgressRuntime>,
}

impl RunContext {
    /// Create run context from workspace root and optional config path. Uses ConfigLoader only.
    pub fn new(workspace_root: PathBuf, config_path: Option<PathBuf>) -> Result<Self, PipelineError> {
        let config = ConfigLoader::load_with_file(&workspace_root, config_path.as_deref())?;
        Ok(Self::with_config(workspace_root, config))
    }

    pub fn with_config(workspace_root: PathBuf, config: ArchsheetConfig) -> Self {
        Self {
            workspace_root,
            config,
            progress: Arc::new(ProgressRuntime::tracing()),
        }
    }

    pub fn config(&self) -> &ArchsheetConfig {
        &self.config
    }

    /// Execute a command and return its rendered output.
    pub fn execute(&self, command: &Commands) -> Result<String, PipelineError> {
        match command {
            Commands::Plan { design, roles, seed } => self.handle_plan(design, roles.as_deref(), *seed),
            Commands::Seed { design, role, seed } => self.handle_seed(design, role, *seed),
            Commands::Run {
                design,
                roles,
                seed,
                no_fingerprint,
                reuse,
                format,
            } => self.handle_run(
                design,
                roles.as_deref(),
                *seed,
                !*no_fingerprint,
                *reuse,
                format,
            ),
            Commands::Bundle { command } => self.handle_bundle_command(command),
            Commands::Config { command } => self.handle_config_command(command),
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }

    fn load_design(&self, path: &Path) -> Result<DesignSpecification, PipelineError> {
        DesignSpecification::from_json_file(&self.resolve(path))
    }

    fn open_store(&self) -> Result<SledBaselineStore, PipelineError> {
        let path = self.config.store_path(&self.workspace_root);
        std::fs::create_dir_all(&path).map_err(StorageError::IoError)?;
        Ok(SledBaselineStore::new(&path)?)
    }

    fn parse_roles(roles: Option<&[String]>) -> Option<Vec<PanelRole>> {
        roles.map(|names| names.iter().map(|name| PanelRole::new(name.trim())).collect())
    }

    fn handle_plan(
        &self,
        design: &Path,
        roles: Option<&[String]>,
        seed: Option<Seed>,
    ) -> Result<String, PipelineError> {
        let design = self.load_design(design)?;
        let planner = JobPlanner::new(Arc::new(DefaultPromptComposer));
        let plan = planner.plan(
            &design,
            PlanOptions {
                roles: Self::parse_roles(roles),
                explicit_seed: seed,
                reference_strength: self.config.gate.base_reference_strength,
                ..PlanOptions::default()
            },
        )?;
        let dependents = planner.build_dependents(&plan, &design, None);
        Ok(format_plan_table(&plan, &dependents))
    }

    fn handle_seed(&self, design: &Path, role: &str, seed: Option<Seed>) -> Result<String, PipelineError> {
        let design = self.load_design(design)?;
        let role = PanelRole::new(role);
        if !role.is_valid() {
            return Err(PipelineError::Planning(format!("Unknown panel role: {}", role)));
        }
        let seeds = SeedPlan::new(&design, seed)?;
        Ok(format!("{} {}", role, seeds.seed_for(&role)))
    }

    fn handle_run(
        &self,
        design: &Path,
        roles: Option<&[String]>,
        seed: Option<Seed>,
        fingerprint_enabled: bool,
        reuse_baseline: bool,
        format: &str,
    ) -> Result<String, PipelineError> {
        let design = self.load_design(design)?;
        let store: Arc<dyn BaselineStore> = Arc::new(self.open_store()?);
        let http = HttpServices::from_endpoints(&self.config.services)?;
        let services = PipelineServices::new(
            Arc::new(http.generation),
            Arc::new(http.similarity),
            Arc::new(http.fingerprint),
            Arc::new(http.composition),
        )
        .with_formatter(Arc::new(http.formatter));

        let run_id = RunId::generate();
        let options = RunOptions {
            roles: Self::parse_roles(roles),
            explicit_seed: seed,
            fingerprint_enabled,
            reuse_baseline,
            run_id: Some(run_id.clone()),
            ..RunOptions::default()
        };

        let runtime = tokio::runtime::Runtime::new()
            .map_err(|e| PipelineError::ConfigError(format!("Failed to start runtime: {}", e)))?;
        let outcome = runtime.block_on(async {
            let queue = Arc::new(PacingQueue::with_event_context(
                self.config.pacing.clone(),
                Some(QueueEventContext {
                    session_id: run_id.to_string(),
                    progress: Arc::clone(&self.progress),
                }),
            ));
            queue.start()?;
            let pipeline = Pipeline::new(
                PipelineSettings::from(&self.config),
                services,
                Arc::clone(&queue),
            )
            .with_store(store)
            .with_progress(Arc::clone(&self.progress));

            info!(design_id = %design.design_id, run_id = %run_id, "Starting pipeline run");
            let outcome = pipeline.run(&design, options).await;
            queue.stop().await?;
            Ok::<_, PipelineError>(outcome)
        })?;

        let rendered = if format == "json" {
            outcome_json(&outcome)?
        } else {
            format_outcome_text(&outcome, self.config.logging.color)
        };
        match outcome {
            PipelineOutcome::Succeeded(_) => Ok(rendered),
            PipelineOutcome::Failed(failure) => {
                // The rendered report goes to stdout; the error decides the exit code
                println!("{}", rendered);
                Err(failure.error)
            }
        }
    }

    fn handle_bundle_command(&self, command: &BundleCommands) -> Result<String, PipelineError> {
        let store = self.open_store()?;
        match command {
            BundleCommands::Show {
                design_id,
                run,
                format,
            } => {
                let bundle = match run {
                    Some(run) => store.load(design_id, &RunId(run.clone()))?,
                    None => store.load_latest(design_id)?,
                }
                .ok_or_else(|| StorageError::BundleNotFound {
                    design_id: design_id.clone(),
                })?;
                if format == "json" {
                    serde_json::to_string_pretty(&bundle)
                        .map_err(|e| StorageError::Serialization(e.to_string()).into())
                } else {
                    Ok(format_bundle_text(&bundle))
                }
            }
            BundleCommands::List { design_id } => {
                let runs = store.list_runs(design_id)?;
                Ok(format_bundle_list(design_id, &runs))
            }
        }
    }

    fn handle_config_command(&self, command: &ConfigCommands) -> Result<String, PipelineError> {
        match command {
            ConfigCommands::Show => toml::to_string_pretty(&self.config)
                .map_err(|e| PipelineError::ConfigError(format!("Failed to render config: {}", e))),
            ConfigCommands::Validate => match self.config.validate() {
                Ok(()) => Ok("Configuration is valid".to_string()),
                Err(errors) => {
                    let msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
                    Err(PipelineError::ConfigError(msgs.join("\n")))
                }
            },
        }
    }
}

fn outcome_json(outcome: &PipelineOutcome) -> Result<String, PipelineError> {
    let value = match outcome {
        PipelineOutcome::Succeeded(success) => serde_json::json!({
            "status": "succeeded",
            "run_id": success.run_id,
            "bundle": success.bundle,
            "consistency_report": success.consistency_report,
            "persistence_warning": success.persistence_warning,
            "reused_baseline": success.reused_baseline,
        }),
        PipelineOutcome::Failed(failure) => serde_json::json!({
            "status": "failed",
            "run_id": failure.run_id,
            "error": failure.error.to_string(),
            "failed_roles": failure.failed_roles,
            "scores": failure.scores,
            "partial_bundle": failure.partial_bundle,
        }),
    };
    serde_json::to_string_pretty(&value)
        .map_err(|e| StorageError::Serialization(e.to_string()).into())
}
