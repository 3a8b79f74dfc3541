use indicatif::{ProgressBar, ProgressStyle};
use overlay_engine::OverlapProgress;

/// Percent-based progress bar for overlap calculations
pub struct OverlapBar {
    bar: ProgressBar,
}

impl OverlapBar {
    pub fn new(hidden: bool) -> Self {
        let bar = if hidden { ProgressBar::hidden() } else { ProgressBar::new(100) };
        let style = ProgressStyle::default_bar()
            .template("{msg}\n[{bar:40.cyan/blue}] {pos}% ETA: {eta}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓▒░ ");
        bar.set_style(style);
        Self { bar }
    }

    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(format!("✓ {}", message));
    }

    pub fn abandon(&self, message: &str) {
        self.bar.abandon_with_message(format!("✗ {}", message));
    }
}

impl OverlapProgress for OverlapBar {
    fn progress(&self, percent: f64, message: &str) {
        self.bar.set_position(percent.clamp(0.0, 100.0).round() as u64);
        self.bar.set_message(message.to_string());
    }

    fn log(&self, message: &str) {
        self.bar.println(message);
    }
}
