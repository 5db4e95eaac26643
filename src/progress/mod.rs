use gpt2_complete::infra::ProgressFn;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;

pub struct Bar {
    progress: ProgressBar,
}

impl Bar {
    pub fn new(message: &str) -> Self {
        let progress = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} {msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
        {
            progress.set_style(style.progress_chars("#>-"));
        }
        progress.set_message(message.to_string());
        progress.enable_steady_tick(Duration::from_millis(100));
        Self { progress }
    }

    /// Observer for `(received, total)` updates; a received count of -1 restarts the bar.
    pub fn observer(&self) -> ProgressFn {
        let progress = self.progress.clone();
        Arc::new(move |received, total| {
            if total >= 0 {
                progress.set_length(total as u64);
            }
            if received < 0 {
                progress.reset();
            } else {
                progress.set_position(received as u64);
            }
        })
    }

    pub fn set_message(&self, message: &str) {
        self.progress.set_message(message.to_string());
    }

    pub fn finish(&self) {
        self.progress.finish_and_clear();
    }
}

pub fn human_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1}G", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1}M", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1}K", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_bytes() {
        assert_eq!(human_bytes(512), "512B");
        assert_eq!(human_bytes(2048), "2.0K");
        assert_eq!(human_bytes(240 * 1024 * 1024), "240.0M");
    }
}
