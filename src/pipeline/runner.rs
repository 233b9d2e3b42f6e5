//! Evaluation run: groups → collector → result files.
//!
//! Pipeline flow:
//! Entry files → Task groups → Batch collector → Result writer (after every flush)

use super::{TaskGroup, plan_groups};
use crate::backend::{BackendRegistry, ModelBackend};
use crate::dataset::EntryStore;
use crate::interface::{GenerationLimits, ModelInterface, create_interface};
use crate::models::{Config, ConfigError, EvalError, GroupReport, Result, RunReport, Task};
use crate::output::{OutputLayout, ResultWriter};
use crate::pool::BatchCollector;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// One configured evaluation over a language pair.
pub struct EvaluationRun<'a> {
    config: &'a Config,
    registry: &'a BackendRegistry,
    show_progress: bool,
}

impl<'a> EvaluationRun<'a> {
    pub fn new(config: &'a Config, registry: &'a BackendRegistry) -> Self {
        Self {
            config,
            registry,
            show_progress: true,
        }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Run every group, persisting after each flush.
    ///
    /// Configuration, dataset and backend errors abort the run; task failures
    /// are only counted. Results written before an abort are kept.
    pub async fn execute(&self) -> Result<RunReport> {
        let start = Instant::now();
        let run = &self.config.run;
        let result_type = run.result_type;

        let family = self.config.model_family()?;
        let store = EntryStore::new(&run.data_dir);
        let plan = plan_groups(&store, result_type, &run.lang1, &run.lang2, run.sample_limit)?;

        let mut report = RunReport {
            model: self.config.model.id.clone(),
            result_type: Some(result_type),
            skipped_groups: plan.skipped,
            ..Default::default()
        };
        if plan.groups.is_empty() {
            warn!("No task groups to run");
            return Ok(report);
        }

        let key = self.config.backend_key();
        let registered = self.registry.get_or_create(&key).await?;
        if result_type.requires_forward() && !registered.backend.supports_forward() {
            return Err(EvalError::Config(ConfigError::Invalid(format!(
                "{result_type} needs forward scoring, which the {} backend does not support",
                key.kind
            ))));
        }

        let interface = create_interface(family, GenerationLimits::from(run));
        let collector = BatchCollector::new(result_type)
            .with_task_timeout(run.task_timeout_secs.map(Duration::from_secs))
            .with_capacity_retries(self.config.batching.capacity_retries as usize);
        let layout = OutputLayout::new(&run.result_dir);

        info!(
            model = %key.model_id,
            %family,
            %result_type,
            groups = plan.groups.len(),
            batch_size = registered.batch_size,
            "Starting evaluation"
        );

        for group in plan.groups {
            let writer = ResultWriter::new(layout.path(&key.model_id, result_type, &group.suffix));
            let group_report = self
                .run_group(
                    group,
                    &writer,
                    &collector,
                    Arc::clone(&registered.backend),
                    Arc::clone(&interface),
                    registered.batch_size,
                )
                .await?;
            report.groups.push(group_report);
        }

        report.runtime_secs = start.elapsed().as_secs_f64();
        report.finalize();
        info!(
            succeeded = report.total_succeeded(),
            failed = report.total_failed(),
            cost_usd = report.total_cost_usd(),
            "Evaluation complete"
        );
        Ok(report)
    }

    async fn run_group(
        &self,
        group: TaskGroup,
        writer: &ResultWriter,
        collector: &BatchCollector,
        backend: Arc<dyn ModelBackend>,
        interface: Arc<dyn ModelInterface>,
        batch_size: usize,
    ) -> Result<GroupReport> {
        let start = Instant::now();
        let total = group.tasks.len();
        let done = writer.existing_ids()?;
        let pending: Vec<Task> = group
            .tasks
            .into_iter()
            .filter(|task| !done.contains(&task.id()))
            .collect();

        let mut report = GroupReport::new(&group.suffix, total);
        report.already_done = total - pending.len();
        if pending.is_empty() {
            info!(suffix = %group.suffix, total, "Group already complete");
            return Ok(report);
        }
        info!(
            suffix = %group.suffix,
            pending = pending.len(),
            already_done = report.already_done,
            path = %writer.path().display(),
            "Running group"
        );

        let pb = self.progress_bar(total, report.already_done);
        let flush_size = batch_size.max(1) * self.config.batching.flush_every_batches.max(1);

        for chunk in pending.chunks(flush_size) {
            let collection = collector
                .collect(
                    chunk.to_vec(),
                    Arc::clone(&backend),
                    Arc::clone(&interface),
                    batch_size,
                )
                .await;
            writer.append_and_rewrite(&collection.results)?;
            report.record(&collection.results, &collection.failures);

            if let Some(e) = collection.fatal {
                pb.abandon_with_message(format!("{}: halted", group.suffix));
                warn!(
                    suffix = %group.suffix,
                    succeeded = report.succeeded,
                    error = %e,
                    "Aborting run; finished results are saved"
                );
                return Err(e);
            }

            pb.inc(chunk.len() as u64);
            pb.set_message(format!(
                "succeeded: {}, failed: {}",
                report.succeeded, report.failed
            ));
        }

        pb.finish_with_message(format!(
            "{}: {} succeeded, {} failed",
            group.suffix, report.succeeded, report.failed
        ));
        if report.failed > 0 {
            warn!(
                suffix = %group.suffix,
                failed = report.failed,
                sample = ?report.failure_sample,
                "Some tasks failed; rerun to retry them"
            );
        }
        report.runtime_secs = start.elapsed().as_secs_f64();
        Ok(report)
    }

    fn progress_bar(&self, total: usize, position: usize) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("##-"),
        );
        pb.set_position(position as u64);
        pb
    }
}
