use std::fmt;
use std::time::Instant;

use tracing::Level;
use tracing_subscriber::fmt::time::FormatTime;

/// Time since the starter came up, as `[mm:ss:mmm]`.
struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

/// Install the stderr subscriber at `level` (`"debug"`, `"info"`, ...).
/// Unknown levels fall back to info. Returns false when a subscriber was
/// already installed.
pub fn init(level: &str) -> bool {
    let level = level.parse::<Level>().unwrap_or(Level::INFO);
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_a_no_op() {
        init("debug");
        assert!(!init("bogus"));
    }
}
