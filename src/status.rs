//! Single-line operator status: elapsed time, frames received, frames lost

use std::io::{self, Write};
use std::time::Duration;

pub fn format_status(elapsed: Duration, received: u64, lost: i64) -> String {
    format!(
        "      {:8.2} RxFrames: {} LostFrames: {}",
        elapsed.as_secs_f64(),
        received,
        lost
    )
}

/// Rewrites one terminal line in place. When the loss count changes the
/// previous line is kept, leaving a trail of where losses happened.
#[derive(Debug, Default)]
pub struct StatusLine {
    last_lost: Option<i64>,
}

impl StatusLine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update<W: Write>(
        &mut self,
        out: &mut W,
        elapsed: Duration,
        received: u64,
        lost: i64,
    ) -> io::Result<()> {
        if self.last_lost.is_some_and(|last| last != lost) {
            writeln!(out)?;
        }
        self.last_lost = Some(lost);
        write!(out, "{}\r", format_status(elapsed, received, lost))?;
        out.flush()
    }

    /// Move past the status line before other output
    pub fn finish<W: Write>(&mut self, out: &mut W) -> io::Result<()> {
        if self.last_lost.take().is_some() {
            writeln!(out)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_like_a_fixed_width_counter() {
        assert_eq!(
            format_status(Duration::from_millis(1500), 90, 2),
            "          1.50 RxFrames: 90 LostFrames: 2"
        );
    }

    #[test]
    fn new_line_only_when_loss_changes() {
        let mut line = StatusLine::new();
        let mut out = Vec::new();
        line.update(&mut out, Duration::ZERO, 1, 0).unwrap();
        line.update(&mut out, Duration::ZERO, 2, 0).unwrap();
        line.update(&mut out, Duration::ZERO, 4, 1).unwrap();
        line.finish(&mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.matches('\n').count(), 2);
        assert_eq!(text.matches('\r').count(), 3);
        assert!(text.ends_with("LostFrames: 1\r\n"));
    }
}
