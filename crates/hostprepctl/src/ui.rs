//! Interactive console presentation
//!
//! One spinner line per step, a byte bar while an artifact downloads.

use hostprep_common::fetcher::ProgressSink;
use hostprep_common::{Reporter, StepId, StepPhase};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const TICK_MS: u64 = 120;

/// Shared draw target for step spinners and download bars
#[derive(Clone)]
pub struct ConsoleUi {
    multi: Arc<MultiProgress>,
    prompts: PromptGate,
    total_steps: usize,
}

impl ConsoleUi {
    pub fn new(total_steps: usize) -> Self {
        Self {
            multi: Arc::new(MultiProgress::new()),
            prompts: PromptGate::default(),
            total_steps,
        }
    }

    pub fn reporter(&self) -> ConsoleReporter {
        ConsoleReporter {
            ui: self.clone(),
            current: Mutex::new(None),
        }
    }

    pub fn download_bar(&self) -> DownloadBar {
        DownloadBar {
            ui: self.clone(),
            bar: Mutex::new(None),
        }
    }

    /// Print a line above any active bars
    pub fn println(&self, line: impl AsRef<str>) {
        if self.multi.println(line.as_ref()).is_err() {
            println!("{}", line.as_ref());
        }
    }

    /// Hide bars while something else owns the terminal (a prompt)
    pub fn suspend<R>(&self, f: impl FnOnce() -> R) -> R {
        self.multi.suspend(f)
    }

    /// Claim the terminal for a question; `None` while another is waiting
    /// for an answer
    pub fn try_prompt(&self) -> Option<PromptGuard> {
        self.prompts.try_open()
    }

    fn prefix(&self, step: StepId) -> String {
        format!("[{}/{}]", step.ordinal(), self.total_steps)
    }
}

/// One question on the terminal at a time. A blocking read on stdin
/// cannot be cancelled, so the guard lives until the read returns.
#[derive(Clone, Default)]
pub struct PromptGate {
    open: Arc<AtomicBool>,
}

impl PromptGate {
    pub fn try_open(&self) -> Option<PromptGuard> {
        self.open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PromptGuard {
                open: self.open.clone(),
            })
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

pub struct PromptGuard {
    open: Arc<AtomicBool>,
}

impl Drop for PromptGuard {
    fn drop(&mut self) {
        self.open.store(false, Ordering::Release);
    }
}

pub struct ConsoleReporter {
    ui: ConsoleUi,
    current: Mutex<Option<(StepId, ProgressBar)>>,
}

impl ConsoleReporter {
    fn spinner(&self, step: StepId) -> ProgressBar {
        let bar = self.ui.multi.add(ProgressBar::new_spinner());
        bar.set_style(
            ProgressStyle::default_spinner()
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", " "])
                .template("{prefix:.cyan} {spinner:.yellow} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_prefix(self.ui.prefix(step));
        bar.enable_steady_tick(Duration::from_millis(TICK_MS));
        bar
    }

    fn finish(&self, step: StepId, phase: StepPhase, message: &str) {
        if let Ok(mut current) = self.current.lock() {
            if let Some((_, bar)) = current.take() {
                bar.finish_and_clear();
            }
        }

        let name = step.display_name();
        let prefix = self.ui.prefix(step);
        let line = match phase {
            StepPhase::Satisfied => format!(
                "{} {} {} {}",
                prefix.cyan(),
                "✓".green(),
                name.bold(),
                message.dimmed()
            ),
            StepPhase::Succeeded => {
                format!("{} {} {} {}", prefix.cyan(), "✓".green(), name.bold(), message)
            }
            StepPhase::Warning => format!(
                "{} {} {} {}",
                prefix.cyan(),
                "!".yellow(),
                name.bold(),
                message.yellow()
            ),
            StepPhase::RestartRequired => format!(
                "{} {} {} {}",
                prefix.cyan(),
                "↻".bright_yellow(),
                name.bold(),
                message.bright_yellow()
            ),
            _ => format!(
                "{} {} {} {}",
                prefix.cyan(),
                "✗".red(),
                name.bold(),
                message.red()
            ),
        };
        self.ui.println(line);
    }
}

impl Reporter for ConsoleReporter {
    fn on_step_update(&self, step: StepId, phase: StepPhase, message: &str) {
        if phase.is_final() {
            self.finish(step, phase, message);
            return;
        }

        let Ok(mut current) = self.current.lock() else {
            return;
        };
        match current.as_ref() {
            Some((id, bar)) if *id == step => {
                let text = match phase {
                    StepPhase::Remediating => format!("{} {}", "Fixing:".bright_cyan(), message),
                    _ => message.to_string(),
                };
                bar.set_message(text);
            }
            _ => {
                if let Some((_, old)) = current.take() {
                    old.finish_and_clear();
                }
                let bar = self.spinner(step);
                bar.set_message(message.to_string());
                *current = Some((step, bar));
            }
        }
    }
}

/// Byte progress for artifact downloads
pub struct DownloadBar {
    ui: ConsoleUi,
    bar: Mutex<Option<ProgressBar>>,
}

impl DownloadBar {
    fn create(&self, total: Option<u64>) -> ProgressBar {
        let bar = match total {
            Some(len) => {
                let bar = ProgressBar::new(len);
                bar.set_style(
                    ProgressStyle::default_bar()
                        .template(
                            "      {bar:32.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
                        )
                        .unwrap_or_else(|_| ProgressStyle::default_bar())
                        .progress_chars("=> "),
                );
                bar
            }
            None => {
                let bar = ProgressBar::new_spinner();
                bar.set_style(
                    ProgressStyle::default_spinner()
                        .template("      {spinner} {bytes} ({bytes_per_sec})")
                        .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                );
                bar
            }
        };
        self.ui.multi.add(bar)
    }
}

impl ProgressSink for DownloadBar {
    fn on_progress(&self, downloaded: u64, total: Option<u64>) {
        let Ok(mut slot) = self.bar.lock() else {
            return;
        };
        let bar = slot.get_or_insert_with(|| self.create(total));
        bar.set_position(downloaded);
        if total.is_some_and(|t| downloaded >= t) {
            bar.finish_and_clear();
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_prompt_waits_for_the_first() {
        let gate = PromptGate::default();
        let first = gate.try_open().unwrap();
        assert!(gate.is_open());
        assert!(gate.try_open().is_none());

        drop(first);
        assert!(!gate.is_open());
        assert!(gate.try_open().is_some());
    }

    #[tokio::test]
    async fn test_guard_held_by_a_blocking_read_outlives_its_watcher() {
        let ui = ConsoleUi::new(1);
        let guard = ui.try_prompt().unwrap();
        let (answer_tx, answer_rx) = std::sync::mpsc::channel::<bool>();

        let reader = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            answer_rx.recv().unwrap_or(false)
        });
        let watcher = tokio::spawn(async move { reader.await.unwrap_or(false) });
        watcher.abort();
        let _ = watcher.await;

        // the read is still pending, so the terminal is not free
        assert!(ui.try_prompt().is_none());

        answer_tx.send(false).unwrap();
        for _ in 0..100 {
            if !ui.prompts.is_open() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(ui.try_prompt().is_some());
    }
}
