/// Display formatting helpers for sizes and build dates.
///
/// All internal sizes are `u64` bytes. Floating point is only used
/// at the display-formatting boundary.
use chrono::NaiveDate;

/// Format a byte count with binary units, e.g. `1.5 KB`.
pub fn format_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    let b = bytes as f64;
    if b < KB {
        format!("{bytes} B")
    } else if b < MB {
        format!("{:.1} KB", b / KB)
    } else if b < GB {
        format!("{:.1} MB", b / MB)
    } else {
        format!("{:.2} GB", b / GB)
    }
}

/// Render a build date key for display.
///
/// `YYYYMMDD` becomes `YYYY-MM-DD`, an empty key (flat build) becomes
/// `current`, anything unparseable is returned unchanged.
pub fn format_build_date(date: &str) -> String {
    if date.is_empty() {
        return "current".to_string();
    }
    match NaiveDate::parse_from_str(date, "%Y%m%d") {
        Ok(d) if date.len() == 8 => d.format("%Y-%m-%d").to_string(),
        _ => date.to_string(),
    }
}
