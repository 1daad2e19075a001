/// Progress extraction from build tool output.
///
/// Ninja-style `[current/total]` markers drive the percent. Totals can grow
/// mid-build as CMake reconfigures, so the largest total seen so far is the
/// denominator and the percent never moves backwards within a run.
use super::BuildProgress;
use once_cell::sync::Lazy;
use regex::Regex;

/// Marker at the very start of a line (native build output).
static LINE_START_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[(\d+)/(\d+)\]").unwrap_or_else(|e| panic!("invalid marker regex: {e}"))
});

/// Marker anywhere in a line (container output is often prefixed).
static ANYWHERE_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[(\d+)/(\d+)\]").unwrap_or_else(|e| panic!("invalid marker regex: {e}"))
});

#[derive(Debug)]
pub struct ProgressTracker {
    marker: &'static Regex,
    max_total: u32,
    last_percent: i32,
}

impl ProgressTracker {
    /// Only match markers that open the line.
    pub fn line_start() -> Self {
        Self::with_marker(&LINE_START_MARKER)
    }

    /// Match a marker anywhere in the line.
    pub fn anywhere() -> Self {
        Self::with_marker(&ANYWHERE_MARKER)
    }

    fn with_marker(marker: &'static Regex) -> Self {
        Self {
            marker,
            max_total: 0,
            last_percent: 0,
        }
    }

    /// Parse `line`, returning a progress update if it carries a marker.
    pub fn observe(&mut self, line: &str) -> Option<BuildProgress> {
        let caps = self.marker.captures(line)?;
        let current: u32 = caps[1].parse().ok()?;
        let total: u32 = caps[2].parse().ok()?;

        self.max_total = self.max_total.max(total);
        if self.max_total == 0 {
            return None;
        }

        let raw = (u64::from(current) * 100 / u64::from(self.max_total)).min(100) as i32;
        self.last_percent = self.last_percent.max(raw);

        Some(BuildProgress {
            current,
            total: self.max_total,
            percent: self.last_percent,
            message: line.to_string(),
        })
    }

    pub fn percent(&self) -> i32 {
        self.last_percent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_line_start_marker() {
        let mut t = ProgressTracker::line_start();
        let p = t.observe("[3/10] Building C object foo.o").unwrap();
        assert_eq!((p.current, p.total, p.percent), (3, 10, 30));
        assert_eq!(p.message, "[3/10] Building C object foo.o");
    }

    #[test]
    fn line_start_ignores_embedded_marker() {
        let mut t = ProgressTracker::line_start();
        assert!(t.observe("west: [3/10] Building").is_none());
        let mut t = ProgressTracker::anywhere();
        assert_eq!(t.observe("west: [3/10] Building").unwrap().percent, 30);
    }

    #[test]
    fn growing_total_uses_running_maximum() {
        let mut t = ProgressTracker::line_start();
        assert_eq!(t.observe("[5/10] a").unwrap().percent, 50);
        // Reconfigure: the total jumps, the percent must not fall back.
        let p = t.observe("[6/200] b").unwrap();
        assert_eq!(p.total, 200);
        assert_eq!(p.percent, 50);
        // A stale smaller total still divides by the maximum.
        let p = t.observe("[100/10] c").unwrap();
        assert_eq!(p.total, 200);
        assert_eq!(p.percent, 50);
        assert_eq!(t.observe("[150/200] d").unwrap().percent, 75);
    }

    #[test]
    fn zero_total_is_ignored() {
        let mut t = ProgressTracker::line_start();
        assert!(t.observe("[0/0] nothing").is_none());
    }

    #[test]
    fn percent_is_capped_at_hundred() {
        let mut t = ProgressTracker::line_start();
        assert_eq!(t.observe("[12/10] over").unwrap().percent, 100);
    }

    #[test]
    fn plain_lines_are_not_progress() {
        let mut t = ProgressTracker::anywhere();
        assert!(t.observe("-- Zephyr version: 3.5.0").is_none());
        assert_eq!(t.percent(), 0);
    }
}
