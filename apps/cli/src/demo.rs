//! Simulated research pipeline for `phasewatch demo`.
//!
//! Stage names and pacing mirror a real multi-agent research run so the
//! dashboard can be exercised without any model calls.

use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::{Report, Result, eyre};
use phasewatch_telemetry::{PhaseSpec, PipelineStatus, TelemetryCollector};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{info, instrument};

const SUBQUERIES: usize = 3;

/// Demo knobs taken from the command line.
#[derive(Debug, Clone)]
pub(crate) struct DemoOptions {
    /// Base time unit; every stage sleeps a fixed number of steps.
    pub step: Duration,
    /// Fail the first report attempt so a recovery phase runs.
    pub fail_report: bool,
}

impl DemoOptions {
    fn steps(&self, n: u32) -> Duration {
        self.step * n
    }
}

/// Run every stage against `collector` and close the pipeline bracket.
///
/// The bracket must already be open. It ends `Completed` unless a stage error
/// escapes, in which case it ends `Failed` and the error is returned.
#[instrument(skip_all, fields(fail_report = options.fail_report))]
pub(crate) async fn run_pipeline(
    collector: &Arc<TelemetryCollector>,
    options: &DemoOptions,
) -> Result<()> {
    let outcome = run_stages(collector, options).await;
    let status = match outcome {
        Ok(()) => PipelineStatus::Completed,
        Err(_) => PipelineStatus::Failed,
    };
    collector.set_pipeline_end(status);
    info!(
        status = status.as_str(),
        events = collector.events().len(),
        "demo pipeline finished"
    );
    outcome
}

async fn run_stages(collector: &Arc<TelemetryCollector>, options: &DemoOptions) -> Result<()> {
    stage(
        collector,
        PhaseSpec::new("Clarify Agent").notes("Processing and clarifying user query"),
        options.steps(12),
    )
    .await?;
    stage(
        collector,
        PhaseSpec::new("Research Brief Agent").notes("Creating comprehensive research brief"),
        options.steps(8),
    )
    .await?;
    stage(
        collector,
        PhaseSpec::new("Supervisor Planner Agent").notes("Generating targeted search plan"),
        options.steps(6),
    )
    .await?;

    research(collector, options).await?;

    stage(
        collector,
        PhaseSpec::new("Compress Conflict Agent")
            .notes("Synthesizing findings and detecting conflicts"),
        options.steps(11),
    )
    .await?;

    report(collector, options).await?;

    stage(
        collector,
        PhaseSpec::new("Evaluator Agent").notes("Assessing report quality across 6 dimensions"),
        options.steps(6),
    )
    .await?;

    collector.record_skip("Model Router Agent", "Not needed in demo mode");
    collector.record_skip("Observability Agent", "Demo complete");
    Ok(())
}

/// A stage that only takes time.
async fn stage(collector: &TelemetryCollector, spec: PhaseSpec, duration: Duration) -> Result<()> {
    collector
        .record_phase_async(spec, async {
            sleep(duration).await;
            Ok(())
        })
        .await
}

/// Evidence collection: subqueries run as parallel tasks nested under the
/// researcher phase.
async fn research(collector: &Arc<TelemetryCollector>, options: &DemoOptions) -> Result<()> {
    let spec = PhaseSpec::new("Researcher Agent")
        .notes("Collecting evidence from multiple sources")
        .model("gpt-4")
        .meta("total_subqueries", SUBQUERIES);

    collector
        .record_phase_async(spec, async {
            sleep(options.steps(3)).await;

            let mut tasks = JoinSet::new();
            for i in 1..=SUBQUERIES {
                let collector = Arc::clone(collector);
                let duration = options.steps(8);
                tasks.spawn(async move {
                    let spec = PhaseSpec::new(format!("Research Subquery {i}"))
                        .notes(format!("Searching: 'Topic {i} recent evidence'"))
                        .parent("Researcher Agent")
                        .meta("subquery_index", i)
                        .meta("total_subqueries", SUBQUERIES);
                    collector
                        .record_phase_async(spec, async move {
                            sleep(duration).await;
                            Ok::<_, Report>(())
                        })
                        .await
                });
            }

            while let Some(joined) = tasks.join_next().await {
                joined.map_err(|e| eyre!("subquery task failed: {e}"))??;
            }
            Ok::<_, Report>(())
        })
        .await
}

/// Report generation, with an optional failed first attempt and recovery.
async fn report(collector: &TelemetryCollector, options: &DemoOptions) -> Result<()> {
    let attempt = collector
        .record_phase_async(
            PhaseSpec::new("Report Agent")
                .notes("Generating initial report")
                .model("gpt-4"),
            async {
                sleep(options.steps(7)).await;
                if options.fail_report {
                    Err(eyre!("Report quality below threshold"))
                } else {
                    Ok(())
                }
            },
        )
        .await;

    if let Err(e) = attempt {
        info!(error = %e, "report rejected, running recovery");
        collector
            .record_phase_async(
                PhaseSpec::recovery("Report Agent", "Quality threshold not met").model("gpt-4"),
                async {
                    sleep(options.steps(12)).await;
                    Ok::<_, Report>(())
                },
            )
            .await?;
    }
    Ok(())
}
