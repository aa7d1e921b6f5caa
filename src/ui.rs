//! Startup stage progress on stderr.
//!
//! Spinners on an interactive terminal, `==>` lines otherwise. Logs go through
//! `log`; this is only for the operator watching the bridge come up.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum UiMode {
    #[default]
    Auto,
    Plain,
    Pretty,
}

#[derive(Clone, Debug)]
pub struct Ui {
    pretty: bool,
}

impl Ui {
    /// `quiet_terminal` suppresses spinners in `Auto` mode, e.g. when stdout is piped.
    pub fn new(mode: UiMode, stderr_is_tty: bool, quiet_terminal: bool) -> Self {
        let pretty = stderr_is_tty
            && match mode {
                UiMode::Pretty => true,
                UiMode::Auto => !quiet_terminal,
                UiMode::Plain => false,
            };
        Self { pretty }
    }

    pub fn stage(&self, name: &str) -> Stage {
        let spinner = self.pretty.then(|| {
            let spinner = ProgressBar::new_spinner();
            spinner.set_draw_target(ProgressDrawTarget::stderr());
            spinner.enable_steady_tick(Duration::from_millis(120));
            spinner.set_style(
                ProgressStyle::with_template("{spinner} {msg} {elapsed}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            spinner.set_message(name.to_string());
            spinner
        });
        if spinner.is_none() {
            eprintln!("==> {}", name);
        }
        Stage {
            name: name.to_string(),
            start: Instant::now(),
            spinner,
            failed: true,
        }
    }
}

/// A running stage. Call `done()` on success; dropping it otherwise marks it failed.
pub struct Stage {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
    failed: bool,
}

impl Stage {
    pub fn done(mut self) {
        self.failed = false;
    }
}

impl Drop for Stage {
    fn drop(&mut self) {
        let mark = if self.failed { "✘" } else { "✔" };
        let message = format!(
            "{} {} ({})",
            mark,
            self.name,
            format_elapsed(self.start.elapsed())
        );
        match &self.spinner {
            Some(spinner) if self.failed => spinner.abandon_with_message(message),
            Some(spinner) => spinner.finish_with_message(message),
            None => eprintln!("{message}"),
        }
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    if elapsed.as_secs() >= 1 {
        format!("{:.2}s", elapsed.as_secs_f64())
    } else {
        format!("{}ms", elapsed.as_millis())
    }
}
