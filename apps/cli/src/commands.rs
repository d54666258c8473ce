//! CLI command definitions, routing, and tracing setup.

use std::panic::{self, PanicHookInfo};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::Result;
use indicatif::{ProgressBar, ProgressStyle};
use phasewatch_dashboard::{
    DashboardConfig, RENDER_THREAD_NAME, Visualizer, format_duration, status_glyph,
};
use phasewatch_shared::{AppConfig, init_config, load_config};
use phasewatch_telemetry::{
    ListenerId, PhaseEvent, PhaseStatus, TelemetryCollector, export_jsonl, telemetry_collector,
};
use ratatui::backend::Backend;
use tracing::{debug, info, warn};

use crate::demo::{self, DemoOptions};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Phasewatch: watch a multi-stage pipeline run, phase by phase.
#[derive(Parser)]
#[command(
    name = "phasewatch",
    version,
    about = "Record pipeline phases and watch them on a live terminal dashboard.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Whether this invocation draws the live dashboard on stdout.
    fn dashboard_active(&self) -> bool {
        matches!(&self.command, Command::Demo(args) if !args.no_viz)
    }
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run a simulated research pipeline under the live dashboard.
    Demo(DemoArgs),

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args, Debug)]
pub(crate) struct DemoArgs {
    /// Show a plain progress spinner instead of the dashboard.
    #[arg(long)]
    pub no_viz: bool,

    /// Fail the first report attempt to demonstrate recovery.
    #[arg(long)]
    pub fail_report: bool,

    /// Write recorded events as JSON lines (overrides `[export] path`).
    #[arg(long)]
    pub export: Option<PathBuf>,

    /// Base stage duration in milliseconds.
    #[arg(long, default_value = "100")]
    pub step_ms: u64,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
///
/// While the dashboard owns the terminal only warnings get through unless
/// `-v` or `RUST_LOG` asks for more.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match (cli.verbose, cli.dashboard_active()) {
        (0, true) => "phasewatch=warn",
        (0, false) => "phasewatch=info",
        (1, _) => "phasewatch=debug",
        _ => "phasewatch=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Demo(args) => cmd_demo(args).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

async fn cmd_demo(args: DemoArgs) -> Result<()> {
    let config = load_config()?;
    let options = DemoOptions {
        step: Duration::from_millis(args.step_ms),
        fail_report: args.fail_report,
    };

    let collector = telemetry_collector();
    collector.clear();
    collector.set_pipeline_start();
    info!(
        step_ms = args.step_ms,
        fail_report = args.fail_report,
        dashboard = !args.no_viz,
        "starting demo pipeline"
    );

    let display = choose_display(args.no_viz, || {
        Visualizer::stdout(Arc::clone(&collector), DashboardConfig::from(&config))
    });
    let outcome = match display {
        DemoDisplay::Dashboard(visualizer) => {
            let _quiet = QuietRenderPanics::install();
            let _dashboard = visualizer.start_scoped();
            demo::run_pipeline(&collector, &options).await
        }
        DemoDisplay::Spinner(progress) => {
            let listener = progress.attach(&collector);
            let outcome = demo::run_pipeline(&collector, &options).await;
            collector.remove_listener(listener);
            progress.spinner.finish_and_clear();
            outcome
        }
    };

    print_summary(&collector);

    let export_path = args
        .export
        .or_else(|| config.export.path.as_ref().map(PathBuf::from));
    if let Some(path) = export_path {
        export_jsonl(&collector.events(), &path)?;
        println!("  Events written to {}", path.display());
        println!();
    }

    outcome
}

/// How a demo run is shown.
enum DemoDisplay<B: Backend + Send + 'static> {
    Dashboard(Visualizer<B>),
    Spinner(CliProgress),
}

/// Open the dashboard unless `--no-viz` was given. A dashboard that cannot
/// attach to the terminal degrades to the spinner; the pipeline still runs.
fn choose_display<B, F>(no_viz: bool, open: F) -> DemoDisplay<B>
where
    B: Backend + Send + 'static,
    F: FnOnce() -> phasewatch_shared::Result<Visualizer<B>>,
{
    if no_viz {
        return DemoDisplay::Spinner(CliProgress::new());
    }
    match open() {
        Ok(visualizer) => DemoDisplay::Dashboard(visualizer),
        Err(e) => {
            warn!(error = %e, "dashboard unavailable; falling back to progress spinner");
            DemoDisplay::Spinner(CliProgress::new())
        }
    }
}

fn print_summary(collector: &TelemetryCollector) {
    let events = collector.events();
    let status = collector
        .pipeline_status()
        .map_or("running", |s| s.as_str());

    println!();
    println!("  Pipeline {status}");
    println!(
        "  Runtime: {}",
        format_duration(collector.pipeline_duration())
    );
    println!("  Events:  {}", events.len());
    for phase_status in PhaseStatus::ALL {
        let count = events.iter().filter(|e| e.status == phase_status).count();
        if count > 0 {
            println!(
                "    {} {:<10} {count}",
                status_glyph(phase_status),
                phase_status.as_str()
            );
        }
    }
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Spinner fed by collector events, for runs without the dashboard.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }

    /// Follow `collector`: the spinner names the phase that just started and
    /// finished phases are printed above it.
    fn attach(&self, collector: &TelemetryCollector) -> ListenerId {
        let spinner = self.spinner.clone();
        collector.add_listener(move |event: &PhaseEvent| {
            if event.status == PhaseStatus::Running {
                spinner.set_message(event.name.clone());
            } else {
                spinner.println(progress_line(event));
            }
        })
    }
}

fn progress_line(event: &PhaseEvent) -> String {
    let mut line = format!(
        "{} {} ({})",
        status_glyph(event.status),
        event.name,
        format_duration(event.duration)
    );
    if !event.notes.is_empty() {
        line.push_str(&format!(" – {}", event.notes));
    }
    line
}

// ---------------------------------------------------------------------------
// Panic hook while the dashboard is drawn
// ---------------------------------------------------------------------------

type PanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Send + Sync + 'static>;

/// Routes panics from the dashboard render thread to `debug!` instead of
/// stderr while installed. Other threads keep the previous hook.
struct QuietRenderPanics {
    previous: Arc<PanicHook>,
}

impl QuietRenderPanics {
    fn install() -> Self {
        let previous: Arc<PanicHook> = Arc::new(panic::take_hook());
        let chained = Arc::clone(&previous);
        panic::set_hook(Box::new(move |info| {
            if is_render_thread(thread::current().name()) {
                debug!(panic = %info, "dashboard render panicked");
            } else {
                chained(info);
            }
        }));
        Self { previous }
    }
}

impl Drop for QuietRenderPanics {
    fn drop(&mut self) {
        // `set_hook` itself panics on a panicking thread.
        if thread::panicking() {
            return;
        }
        let previous = Arc::clone(&self.previous);
        panic::set_hook(Box::new(move |info| previous(info)));
    }
}

fn is_render_thread(name: Option<&str>) -> bool {
    name == Some(RENDER_THREAD_NAME)
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io;

    use clap::CommandFactory;
    use phasewatch_shared::PhasewatchError;
    use phasewatch_telemetry::PhaseSpec;
    use ratatui::Terminal;
    use ratatui::backend::TestBackend;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn demo_flags_parse() {
        let cli = Cli::try_parse_from([
            "phasewatch",
            "-v",
            "demo",
            "--fail-report",
            "--export",
            "out/events.jsonl",
            "--step-ms",
            "5",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 1);
        assert!(cli.dashboard_active());
        match cli.command {
            Command::Demo(args) => {
                assert!(args.fail_report);
                assert_eq!(args.step_ms, 5);
                assert_eq!(args.export, Some(PathBuf::from("out/events.jsonl")));
            }
            Command::Config { .. } => panic!("expected demo"),
        }
    }

    #[test]
    fn no_viz_and_config_leave_terminal_alone() {
        let cli = Cli::try_parse_from(["phasewatch", "demo", "--no-viz"]).unwrap();
        assert!(!cli.dashboard_active());
        let cli = Cli::try_parse_from(["phasewatch", "config", "show"]).unwrap();
        assert!(!cli.dashboard_active());
    }

    #[test]
    fn progress_line_includes_notes() {
        let collector = TelemetryCollector::new();
        let skipped = collector.record_skip("Model Router Agent", "Not needed");
        let line = progress_line(&skipped);
        assert!(line.starts_with("» Model Router Agent"));
        assert!(line.ends_with("Skipped: Not needed"));

        let running = collector.start_phase(PhaseSpec::new("Clarify Agent"));
        assert_eq!(progress_line(&running), "⟳ Clarify Agent (-)");
    }

    #[test]
    fn dashboard_failure_falls_back_to_spinner() {
        let display = choose_display::<TestBackend, _>(false, || {
            Err(PhasewatchError::Terminal(io::Error::other("no tty")))
        });
        assert!(matches!(display, DemoDisplay::Spinner(_)));
    }

    #[test]
    fn dashboard_chosen_when_terminal_opens() {
        let display = choose_display(false, || {
            Ok(Visualizer::with_terminal(
                Arc::new(TelemetryCollector::new()),
                Terminal::new(TestBackend::new(80, 20)).unwrap(),
                DashboardConfig::default(),
            ))
        });
        assert!(matches!(display, DemoDisplay::Dashboard(_)));
    }

    #[test]
    fn no_viz_never_opens_dashboard() {
        let display = choose_display::<TestBackend, _>(true, || {
            panic!("dashboard must not be opened with --no-viz")
        });
        assert!(matches!(display, DemoDisplay::Spinner(_)));
    }

    #[test]
    fn render_thread_panics_are_routed_by_name() {
        assert!(is_render_thread(Some(RENDER_THREAD_NAME)));
        assert!(!is_render_thread(Some("main")));
        assert!(!is_render_thread(None));

        let quiet = QuietRenderPanics::install();
        let joined = thread::Builder::new()
            .name(RENDER_THREAD_NAME.into())
            .spawn(|| panic!("widget overflow"))
            .unwrap()
            .join();
        drop(quiet);
        assert!(joined.is_err());
    }
}
