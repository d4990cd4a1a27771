//! Terminal progress for apply and rollback.

use colored::Colorize;
use declarative::{Phase, PlannedStep, ProgressCallback};
use indicatif::{ProgressBar, ProgressStyle};
use remotekit::InstanceRef;
use std::time::Duration;

use crate::ui;

/// Spinner that follows the state machine and the remote steps.
pub struct TerminalProgress {
    pb: Option<ProgressBar>,
    quiet: bool,
}

impl TerminalProgress {
    pub fn new(quiet: bool) -> Self {
        Self { pb: None, quiet }
    }

    fn spinner(&mut self) -> Option<&ProgressBar> {
        if self.quiet {
            return None;
        }
        Some(self.pb.get_or_insert_with(|| {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.green} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            pb.enable_steady_tick(Duration::from_millis(100));
            pb
        }))
    }

    fn finish(&mut self) {
        if let Some(pb) = self.pb.take() {
            pb.finish_and_clear();
        }
    }
}

fn phase_message(instance: &InstanceRef, phase: Phase) -> Option<String> {
    let msg = match phase {
        Phase::Inspecting => format!("Inspecting {instance}..."),
        Phase::Diffing => "Computing diff...".to_string(),
        Phase::CheckpointCapturing => "Capturing checkpoint...".to_string(),
        Phase::Applying => "Applying...".to_string(),
        Phase::RollingBack => "Rolling back...".to_string(),
        _ => return None,
    };
    Some(msg)
}

impl ProgressCallback for TerminalProgress {
    fn on_phase(&mut self, instance: &InstanceRef, phase: Phase) {
        log::debug!("{instance}: {phase}");
        if phase.is_terminal() || phase == Phase::ConflictBlocked || phase == Phase::ReadyToApply {
            self.finish();
            return;
        }
        if let Some(msg) = phase_message(instance, phase)
            && let Some(pb) = self.spinner()
        {
            pb.set_message(msg);
        }
    }

    fn on_step_start(&mut self, step: &PlannedStep, index: usize, total: usize) {
        if let Some(pb) = self.spinner() {
            pb.set_message(format!(
                "{} {}",
                format!("[{}/{total}]", index + 1).blue().bold(),
                ui::truncate(&step.description, 60)
            ));
        }
    }

    fn on_step_complete(&mut self, step: &PlannedStep, success: bool) {
        if self.quiet {
            return;
        }
        let line = if success {
            format!("  {} {}", "✓".green(), step.id)
        } else {
            format!("  {} {}", "✗".red(), step.id)
        };
        match &self.pb {
            Some(pb) => pb.suspend(|| println!("{line}")),
            None => println!("{line}"),
        }
    }
}

impl Drop for TerminalProgress {
    fn drop(&mut self) {
        self.finish();
    }
}
