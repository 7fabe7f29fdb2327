use chrono::Duration;

/// Format a non-negative duration as `MM:SS`, or `H:MM:SS` once it reaches
/// an hour. Negative input is treated as zero.
pub fn format_clock(d: Duration) -> String {
    let total = d.num_seconds().max(0);
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}
