//! Progress indicators with CI fallback

use super::context::UiContext;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// A task spinner with CI fallback
pub struct TaskSpinner {
    spinner: Option<cliclack::ProgressBar>,
    interactive: bool,
}

impl TaskSpinner {
    /// Create a new spinner (shows once started in interactive mode)
    pub fn new(ctx: &UiContext) -> Self {
        Self {
            spinner: None,
            interactive: ctx.use_fancy_output(),
        }
    }

    /// Start the spinner with a message
    pub fn start(&mut self, message: &str) {
        if self.interactive {
            let spinner = cliclack::spinner();
            spinner.start(message);
            self.spinner = Some(spinner);
        } else {
            eprintln!("{} {}", style("...").dim(), message);
        }
    }

    /// Stop with success message
    pub fn stop(&mut self, message: &str) {
        if let Some(spinner) = self.spinner.take() {
            spinner.stop(message);
        } else if self.interactive {
            eprintln!("{} {}", style("✓").green(), message);
        } else {
            eprintln!("{} {}", style("[OK]").green(), message);
        }
    }

    /// Stop with error message
    pub fn stop_error(&mut self, message: &str) {
        if let Some(spinner) = self.spinner.take() {
            spinner.error(message);
        } else if self.interactive {
            eprintln!("{} {}", style("✗").red(), message);
        } else {
            eprintln!("{} {}", style("[FAIL]").red(), message);
        }
    }
}

/// Elapsed-time bar for a lock stress run
///
/// Shows an indicatif bar over the run duration in interactive mode, and a
/// single start line otherwise.
pub struct StressProgress {
    bar: Option<ProgressBar>,
}

impl StressProgress {
    pub fn new(ctx: &UiContext, processes: usize, duration: Duration) -> Self {
        let bar = if ctx.use_fancy_output() {
            let bar = ProgressBar::new(duration.as_millis() as u64);
            let style = ProgressStyle::default_bar()
                .template("  {spinner:.cyan} {prefix}  {bar:20.cyan/dim} {msg:.dim}  {elapsed:.dim}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ")
                .progress_chars("━╸─");
            bar.set_style(style);
            bar.set_prefix(format!("{} workers", processes));
            bar.enable_steady_tick(Duration::from_millis(120));
            Some(bar)
        } else {
            eprintln!(
                "Running {} workers for {}s...",
                processes,
                duration.as_secs_f64()
            );
            None
        };
        Self { bar }
    }

    /// Update elapsed time; past the run duration the bar waits on stragglers
    pub fn update(&self, elapsed: Duration) {
        if let Some(ref bar) = self.bar {
            bar.set_position(elapsed.as_millis() as u64);
            if bar.length().is_some_and(|len| bar.position() >= len) {
                bar.set_message("waiting for workers");
            }
        }
    }

    /// Finish and clear the bar
    pub fn finish(&self) {
        if let Some(ref bar) = self.bar {
            bar.disable_steady_tick();
            bar.finish_and_clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spinner_non_interactive() {
        let ctx = UiContext::non_interactive();
        let mut spinner = TaskSpinner::new(&ctx);
        spinner.start("Testing...");
        spinner.stop("Done");
    }

    #[test]
    fn stress_progress_non_interactive() {
        let ctx = UiContext::non_interactive();
        let progress = StressProgress::new(&ctx, 3, Duration::from_secs(2));
        progress.update(Duration::from_millis(500));
        progress.finish();
    }
}
