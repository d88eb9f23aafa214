//! Advisory rendering and pre-filled issue reports

use anyhow::{Context, Result};
use hostprep_common::{advisory, Advisory, ErrorCategory, Outcome, StepId, Terminal};
use owo_colors::OwoColorize;
use reqwest::Url;
use std::path::Path;
use uuid::Uuid;

const ISSUE_URL: &str = "https://github.com/hostprep/hostprep/issues/new";

/// Everything the issue report carries about a failed run
pub struct FailureContext<'a> {
    pub run_id: Uuid,
    pub step: StepId,
    pub category: ErrorCategory,
    pub outcome: Option<&'a Outcome>,
    pub log_path: Option<&'a Path>,
}

pub fn render_advisory(advisory: &Advisory) -> String {
    render(advisory, true)
}

/// Same text without colour, for log files and unattended runs
pub fn render_advisory_plain(advisory: &Advisory) -> String {
    render(advisory, false)
}

fn render(advisory: &Advisory, colour: bool) -> String {
    let heading = |text: &str| {
        if colour {
            text.bold().to_string()
        } else {
            text.to_string()
        }
    };

    let mut out = String::new();
    if colour {
        out.push_str(&format!("{}\n", advisory.title.bold().red()));
    } else {
        out.push_str(&format!("{}\n", advisory.title));
    }
    out.push_str(&format!("{}\n", advisory.description));

    if !advisory.steps.is_empty() {
        out.push('\n');
        out.push_str(&format!("{}\n", heading("What to try:")));
        for (i, step) in advisory.steps.iter().enumerate() {
            out.push_str(&format!("  {}. {}\n", i + 1, step));
        }
    }

    if !advisory.links.is_empty() {
        out.push('\n');
        out.push_str(&format!("{}\n", heading("More information:")));
        for link in advisory.links {
            if colour {
                out.push_str(&format!("  {}\n", link.cyan()));
            } else {
                out.push_str(&format!("  {}\n", link));
            }
        }
    }
    out
}

/// Guidance logged at the end of a quiet run, if the run did not succeed
/// or restart
pub fn unattended_summary(terminal: &Terminal, log_path: &Path) -> Option<String> {
    let (headline, category) = match terminal {
        Terminal::HaltedAt { step, category } => {
            (format!("{} failed", step.display_name()), *category)
        }
        Terminal::Aborted { step } => (
            format!("Stopped before {}", step.display_name()),
            ErrorCategory::UserDeclined,
        ),
        Terminal::Completed { .. } | Terminal::RestartRequired { .. } => return None,
    };
    Some(format!(
        "{}\n{}\nLog file: {}",
        headline,
        render_advisory_plain(&advisory(category)),
        log_path.display()
    ))
}

pub fn issue_url(failure: &FailureContext<'_>) -> Result<Url> {
    let title = format!(
        "{} failed: {}",
        failure.step.display_name(),
        failure.category.as_str()
    );

    let mut body = String::new();
    body.push_str(&format!("hostprep version: {}\n", env!("CARGO_PKG_VERSION")));
    body.push_str(&format!("run id: {}\n", failure.run_id));
    body.push_str(&format!("step: {}\n", failure.step.as_str()));
    body.push_str(&format!("category: {}\n", failure.category.as_str()));
    if let Some(path) = failure.log_path {
        body.push_str(&format!("log file: {}\n", path.display()));
    }
    if let Some(outcome) = failure.outcome {
        body.push_str(&format!("\nmessage: {}\n", outcome.message));
        if let Some(detail) = &outcome.error_detail {
            body.push_str(&format!("\n```\n{}\n```\n", detail));
        }
    }

    Url::parse_with_params(ISSUE_URL, &[("title", title), ("body", body)])
        .context("Failed to build the issue report URL")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_issue_url_carries_run_details() {
        let run_id = Uuid::new_v4();
        let log = PathBuf::from("C:/Users/me/AppData/Local/hostprep/logs/run.log");
        let outcome = Outcome::ok("ignored").with_detail("exit 1603");
        let url = issue_url(&FailureContext {
            run_id,
            step: StepId::Subsystem,
            category: ErrorCategory::SubsystemInstallFailed,
            outcome: Some(&outcome),
            log_path: Some(&log),
        })
        .unwrap();

        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, "title");
        assert!(pairs[0].1.contains(ErrorCategory::SubsystemInstallFailed.as_str()));
        let body = &pairs[1].1;
        assert!(body.contains(&run_id.to_string()));
        assert!(body.contains("step: subsystem"));
        assert!(body.contains("run.log"));
        assert!(body.contains("exit 1603"));
    }

    #[test]
    fn test_advisory_lists_numbered_steps() {
        let text = render_advisory(&advisory(ErrorCategory::OsFeatures));
        assert!(text.contains("  1. "));
    }

    #[test]
    fn test_unattended_summary_carries_full_guidance() {
        let log = PathBuf::from("C:/logs/run.log");
        let halted = Terminal::HaltedAt {
            step: StepId::OsFeatures,
            category: ErrorCategory::OsFeatures,
        };
        let text = unattended_summary(&halted, &log).unwrap();
        let advice = advisory(ErrorCategory::OsFeatures);
        assert!(text.starts_with("Windows features failed\n"));
        assert!(text.contains(advice.title));
        assert!(text.contains("  1. "));
        for link in advice.links {
            assert!(text.contains(link));
        }
        assert!(text.contains("run.log"));
        assert!(!text.contains("\u{1b}["));
    }

    #[test]
    fn test_unattended_summary_explains_an_abort() {
        let log = PathBuf::from("run.log");
        let aborted = Terminal::Aborted {
            step: StepId::RuntimeImage,
        };
        let text = unattended_summary(&aborted, &log).unwrap();
        assert!(text.starts_with("Stopped before"));
        assert!(text.contains(advisory(ErrorCategory::UserDeclined).title));
        assert!(!text.contains("\u{1b}["));

        let done = Terminal::Completed { warnings: vec![] };
        assert!(unattended_summary(&done, &log).is_none());
    }
}
