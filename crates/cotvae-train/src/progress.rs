use indicatif::{ProgressBar, ProgressStyle};

/// Progress bar for training steps and evaluation examples.
pub(crate) fn progress_bar(total: u64, label: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.cyan} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}",
    ) {
        pb.set_style(style.progress_chars("█▓░"));
    }
    pb.set_message(label.to_string());
    pb
}

/// A hidden bar, for callers that asked for quiet runs (tests, nested evals).
pub(crate) fn hidden_bar() -> ProgressBar {
    ProgressBar::hidden()
}

pub(crate) fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{}h {:02}m {:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_pick_the_largest_unit() {
        assert_eq!(format_duration(42), "42s");
        assert_eq!(format_duration(125), "2m 05s");
        assert_eq!(format_duration(3 * 3600 + 61), "3h 01m 01s");
    }
}
