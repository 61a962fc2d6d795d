//! Terminal progress reporting for runs.

use std::time::Duration;

use docpipe_core::{DocumentReport, RunObserver, StageOutcome};
use docpipe_shared::{Document, StageName};
use indicatif::{ProgressBar, ProgressStyle};

/// Run observer drawing an indicatif bar with one tick per finished document.
pub(crate) struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    pub(crate) fn new() -> Self {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {wide_msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar }
    }

    pub(crate) fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl RunObserver for CliProgress {
    fn run_started(&self, documents: usize, stages: &[StageName]) {
        self.bar.set_length(documents as u64);
        let names: Vec<_> = stages.iter().map(|s| s.as_str()).collect();
        self.bar.set_message(format!("stages: {}", names.join(" → ")));
    }

    fn lane_started(&self, doc: &Document) {
        self.bar.set_message(doc.rel_path.clone());
    }

    fn stage_started(&self, doc: &Document, stage: StageName) {
        self.bar.set_message(format!("{stage}: {doc}"));
    }

    fn stage_finished(&self, doc: &Document, stage: StageName, outcome: &StageOutcome) {
        if let StageOutcome::Failed { error } = outcome {
            self.bar.println(format!("  ✗ {doc} [{stage}] {error}"));
        }
    }

    fn lane_finished(&self, _report: &DocumentReport) {
        self.bar.inc(1);
    }
}
