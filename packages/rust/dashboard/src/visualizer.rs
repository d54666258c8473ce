//! Background render loop for the live dashboard.

use std::io::{self, IsTerminal, Stdout};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use phasewatch_shared::{AppConfig, DashboardSettings, Result};
use phasewatch_telemetry::TelemetryCollector;
use ratatui::prelude::*;
use ratatui::{TerminalOptions, Viewport};
use tracing::{debug, info, warn};

use crate::view::DashboardView;
use crate::widgets;

/// Name of the background render thread.
pub const RENDER_THREAD_NAME: &str = "phasewatch-dashboard";

/// How often `stop()` checks whether the render thread has exited.
const JOIN_POLL: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Runtime settings for a [`Visualizer`].
#[derive(Debug, Clone)]
pub struct DashboardConfig {
    /// Interval between background frames.
    pub refresh: Duration,
    /// Upper bound on how long `stop()` waits for the render thread.
    pub join_timeout: Duration,
    /// Rows requested for the inline viewport (clamped to the terminal).
    pub viewport_height: u16,
    /// Pause after the final frame before the display is torn down.
    pub final_linger: Duration,
    /// Header title.
    pub title: String,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self::from(&DashboardSettings::default())
    }
}

impl From<&DashboardSettings> for DashboardConfig {
    fn from(settings: &DashboardSettings) -> Self {
        Self {
            refresh: Duration::from_millis(settings.refresh_ms),
            join_timeout: Duration::from_millis(settings.join_timeout_ms),
            viewport_height: settings.viewport_height,
            final_linger: Duration::from_millis(settings.final_linger_ms),
            title: "Deep Research Agent Pipeline".to_string(),
        }
    }
}

impl From<&AppConfig> for DashboardConfig {
    fn from(config: &AppConfig) -> Self {
        Self::from(&config.dashboard)
    }
}

/// Render-loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Stopped,
    Running,
}

// ---------------------------------------------------------------------------
// Visualizer
// ---------------------------------------------------------------------------

/// Terminal and per-terminal bookkeeping, shared with the render thread.
struct Screen<B: Backend> {
    terminal: Terminal<B>,
    /// Inline viewports need the cursor moved below them on teardown.
    inline: bool,
    frames: u64,
    last_area: Option<Rect>,
}

struct Control {
    state: LoopState,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

/// How a frame may acquire the terminal.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Acquire {
    Wait,
    /// Skip the frame if another thread holds the terminal.
    IfFree,
}

/// Live dashboard over a shared [`TelemetryCollector`].
///
/// The visualizer only reads the collector. Rendering problems are logged at
/// `debug` and never reach the pipeline; the previous frame stays on screen.
///
/// A panic while drawing is caught, but the process panic hook has already
/// run by then and prints to stderr over the dashboard. Callers that want a
/// clean screen can install a hook that ignores threads named
/// [`RENDER_THREAD_NAME`].
pub struct Visualizer<B: Backend + Send + 'static> {
    collector: Arc<TelemetryCollector>,
    config: DashboardConfig,
    screen: Arc<Mutex<Screen<B>>>,
    control: Mutex<Control>,
}

impl Visualizer<CrosstermBackend<Stdout>> {
    /// Dashboard on stdout in an inline viewport below the current cursor.
    ///
    /// Fails when stdout is not a terminal or the viewport cannot be set up.
    pub fn stdout(collector: Arc<TelemetryCollector>, config: DashboardConfig) -> Result<Self> {
        if !io::stdout().is_terminal() {
            return Err(io::Error::other("stdout is not a terminal").into());
        }
        let rows = crossterm::terminal::size()
            .map(|(_, rows)| rows)
            .unwrap_or(config.viewport_height);
        let height = config.viewport_height.min(rows).max(1);

        let terminal = Terminal::with_options(
            CrosstermBackend::new(io::stdout()),
            TerminalOptions {
                viewport: Viewport::Inline(height),
            },
        )?;

        Ok(Self::build(collector, terminal, config, true))
    }
}

impl<B: Backend + Send + 'static> Visualizer<B> {
    /// Dashboard on an arbitrary ratatui terminal.
    pub fn with_terminal(
        collector: Arc<TelemetryCollector>,
        terminal: Terminal<B>,
        config: DashboardConfig,
    ) -> Self {
        Self::build(collector, terminal, config, false)
    }

    fn build(
        collector: Arc<TelemetryCollector>,
        terminal: Terminal<B>,
        config: DashboardConfig,
        inline: bool,
    ) -> Self {
        Self {
            collector,
            config,
            screen: Arc::new(Mutex::new(Screen {
                terminal,
                inline,
                frames: 0,
                last_area: None,
            })),
            control: Mutex::new(Control {
                state: LoopState::Stopped,
                stop_tx: None,
                handle: None,
            }),
        }
    }

    pub fn state(&self) -> LoopState {
        lock(&self.control).state
    }

    /// Frames successfully drawn so far.
    pub fn frames_rendered(&self) -> u64 {
        lock(&self.screen).frames
    }

    /// Run `f` against the terminal, e.g. to read a `TestBackend` buffer.
    pub fn inspect<R>(&self, f: impl FnOnce(&Terminal<B>) -> R) -> R {
        f(&lock(&self.screen).terminal)
    }

    /// Draw one frame now, independent of the render loop.
    pub fn refresh(&self) {
        render_frame(&self.screen, &self.collector, &self.config.title, Acquire::Wait);
    }

    /// Show the dashboard and start refreshing it in the background.
    ///
    /// Calling `start` on a running visualizer does nothing.
    pub fn start(&self) {
        let mut control = lock(&self.control);
        if control.state == LoopState::Running {
            debug!("dashboard already running");
            return;
        }

        if let Err(e) = lock(&self.screen).terminal.hide_cursor() {
            debug!(error = %e, "could not hide cursor");
        }
        render_frame(&self.screen, &self.collector, &self.config.title, Acquire::Wait);

        let (stop_tx, stop_rx) = mpsc::channel();
        let screen = Arc::clone(&self.screen);
        let collector = Arc::clone(&self.collector);
        let refresh = self.config.refresh;
        let title = self.config.title.clone();

        let spawned = thread::Builder::new()
            .name(RENDER_THREAD_NAME.into())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(refresh) {
                        Err(RecvTimeoutError::Timeout) => {
                            render_frame(&screen, &collector, &title, Acquire::Wait);
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            });

        match spawned {
            Ok(handle) => {
                control.handle = Some(handle);
                control.stop_tx = Some(stop_tx);
            }
            Err(e) => warn!(error = %e, "could not spawn dashboard thread; showing static frames"),
        }
        control.state = LoopState::Running;
        info!(refresh_ms = refresh.as_millis() as u64, "dashboard started");
    }

    /// Stop the render loop, draw a final frame and release the terminal.
    ///
    /// Waits at most `join_timeout` for the render thread. Calling `stop` on a
    /// stopped visualizer does nothing.
    pub fn stop(&self) {
        let mut control = lock(&self.control);
        if control.state == LoopState::Stopped {
            return;
        }
        control.state = LoopState::Stopped;

        if let Some(stop_tx) = control.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        let joined = match control.handle.take() {
            Some(handle) => join_with_timeout(handle, self.config.join_timeout),
            None => true,
        };

        let acquire = if joined {
            Acquire::Wait
        } else {
            warn!(
                timeout_ms = self.config.join_timeout.as_millis() as u64,
                "dashboard thread did not stop in time; detaching it"
            );
            Acquire::IfFree
        };

        render_frame(&self.screen, &self.collector, &self.config.title, acquire);
        if !self.config.final_linger.is_zero() {
            thread::sleep(self.config.final_linger);
        }
        teardown(&self.screen, acquire);
        debug!("dashboard stopped");
    }

    /// Start the dashboard and stop it when the returned guard drops.
    pub fn start_scoped(&self) -> VisualizerGuard<'_, B> {
        self.start();
        VisualizerGuard { visualizer: self }
    }
}

impl<B: Backend + Send + 'static> Drop for Visualizer<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Stops its [`Visualizer`] when dropped, including during unwinding.
#[must_use = "dropping the guard immediately stops the dashboard"]
pub struct VisualizerGuard<'a, B: Backend + Send + 'static> {
    visualizer: &'a Visualizer<B>,
}

impl<B: Backend + Send + 'static> VisualizerGuard<'_, B> {
    pub fn visualizer(&self) -> &Visualizer<B> {
        self.visualizer
    }
}

impl<B: Backend + Send + 'static> Drop for VisualizerGuard<'_, B> {
    fn drop(&mut self) {
        self.visualizer.stop();
    }
}

/// Create a stdout dashboard over `collector` and start it.
pub fn visualize_pipeline(
    collector: Arc<TelemetryCollector>,
    config: DashboardConfig,
) -> Result<Visualizer<CrosstermBackend<Stdout>>> {
    let visualizer = Visualizer::stdout(collector, config)?;
    visualizer.start();
    Ok(visualizer)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn acquire<T>(mutex: &Mutex<T>, how: Acquire) -> Option<MutexGuard<'_, T>> {
    match how {
        Acquire::Wait => Some(lock(mutex)),
        Acquire::IfFree => match mutex.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        },
    }
}

fn render_frame<B: Backend>(
    screen: &Mutex<Screen<B>>,
    collector: &TelemetryCollector,
    title: &str,
    how: Acquire,
) {
    let Some(mut screen) = acquire(screen, how) else {
        debug!("terminal busy; skipping dashboard frame");
        return;
    };

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let view = DashboardView::from_snapshot(&collector.snapshot());
        screen
            .terminal
            .draw(|f| widgets::draw(f, &view, title))
            .map(|frame| frame.area)
    }));

    match outcome {
        Ok(Ok(area)) => {
            screen.frames += 1;
            screen.last_area = Some(area);
        }
        Ok(Err(e)) => debug!(error = %e, "dashboard draw failed; keeping previous frame"),
        Err(_) => debug!("dashboard render panicked; keeping previous frame"),
    }
}

fn teardown<B: Backend>(screen: &Mutex<Screen<B>>, how: Acquire) {
    let Some(mut screen) = acquire(screen, how) else {
        debug!("terminal busy; skipping dashboard teardown");
        return;
    };

    if screen.inline {
        if let Some(area) = screen.last_area {
            let below = Position::new(0, area.bottom().saturating_sub(1));
            let moved = screen
                .terminal
                .set_cursor_position(below)
                .and_then(|()| screen.terminal.backend_mut().append_lines(1));
            if let Err(e) = moved {
                debug!(error = %e, "could not move cursor below dashboard");
            }
        }
    }
    if let Err(e) = screen.terminal.show_cursor() {
        debug!(error = %e, "could not restore cursor");
    }
    if let Err(e) = screen.terminal.backend_mut().flush() {
        debug!(error = %e, "could not flush terminal");
    }
}

fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(JOIN_POLL);
    }
    if handle.join().is_err() {
        debug!("dashboard thread panicked");
    }
    true
}
