use indicatif::{ProgressBar, ProgressStyle};

/// pull中のスピナー表示
pub struct PullProgress {
    progress_bar: ProgressBar,
}

impl PullProgress {
    pub fn new(image: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) =
            ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")
        {
            pb.set_style(style);
        }
        pb.set_message(format!("Pulling {}...", image));
        Self { progress_bar: pb }
    }

    pub fn set_message(&self, msg: &str) {
        self.progress_bar.set_message(msg.to_string());
    }

    pub fn finish(&self) {
        self.progress_bar.finish_with_message("Pull completed ✓");
    }

    pub fn finish_error(&self, error: &str) {
        self.progress_bar
            .finish_with_message(format!("Pull failed: {}", error));
    }
}
