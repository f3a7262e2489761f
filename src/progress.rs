use std::io::IsTerminal;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::sync::watch;

/// Controls how long-running operations report progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Animated bars on a terminal.
    Normal,
    /// No ANSI, one `progress: N%.` line per whole percent (for pipes).
    Plain,
}

impl OutputMode {
    pub fn detect() -> Self {
        if std::io::stdout().is_terminal() {
            OutputMode::Normal
        } else {
            OutputMode::Plain
        }
    }
}

fn install_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.cyan} installing [{bar:40.cyan/blue}] {percent}%")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

pub(crate) fn download_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

/// Renders an install progress fraction until the sender goes away.
pub struct InstallProgressView {
    mode: OutputMode,
    bar: ProgressBar,
    last_percent: Option<u64>,
}

impl InstallProgressView {
    pub fn new(mode: OutputMode) -> Self {
        let bar = ProgressBar::new(100);
        if mode == OutputMode::Plain {
            bar.set_draw_target(ProgressDrawTarget::hidden());
        } else {
            bar.set_style(install_style());
        }
        Self {
            mode,
            bar,
            last_percent: None,
        }
    }

    /// Render one fraction. Plain mode prints only when the whole percent
    /// changes.
    pub fn update(&mut self, fraction: f64) -> Option<String> {
        let percent = percent(fraction);
        if self.last_percent == Some(percent) {
            return None;
        }
        self.last_percent = Some(percent);
        self.bar.set_position(percent);
        if self.mode == OutputMode::Plain {
            let line = format!("progress: {percent}%.");
            println!("{line}");
            return Some(line);
        }
        None
    }

    /// Follow `progress` until its sender is dropped.
    pub async fn follow(mut self, mut progress: watch::Receiver<f64>) {
        loop {
            let fraction = *progress.borrow_and_update();
            self.update(fraction);
            if progress.changed().await.is_err() {
                break;
            }
        }
        self.finish();
    }

    fn finish(self) {
        self.bar.finish_and_clear();
    }
}

fn percent(fraction: f64) -> u64 {
    (fraction.clamp(0.0, 1.0) * 100.0).floor() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_floors_and_clamps() {
        assert_eq!(percent(0.0), 0);
        assert_eq!(percent(0.129), 12);
        assert_eq!(percent(1.0), 100);
        assert_eq!(percent(2.0), 100);
        assert_eq!(percent(-0.5), 0);
    }

    #[test]
    fn plain_mode_prints_each_percent_once() {
        let mut view = InstallProgressView::new(OutputMode::Plain);
        assert_eq!(view.update(0.10).as_deref(), Some("progress: 10%."));
        assert_eq!(view.update(0.105), None);
        assert_eq!(view.update(0.11).as_deref(), Some("progress: 11%."));
    }

    #[tokio::test]
    async fn follow_ends_when_sender_drops() {
        let (tx, rx) = watch::channel(0.0);
        let view = InstallProgressView::new(OutputMode::Plain);
        let task = tokio::spawn(view.follow(rx));
        tx.send(0.5).unwrap();
        drop(tx);
        task.await.unwrap();
    }
}
