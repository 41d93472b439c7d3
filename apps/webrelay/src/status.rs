//! Single-line console status display.

use std::io::Write;
use std::time::Duration;

const LINE_WIDTH: usize = 79;

/// Formats `bytes` with a binary unit suffix, e.g. `1.5MB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[u8] = b"BKMGTPE";
    let mut value = bytes as f64;
    let mut place = 0;
    while value >= 1024.0 && place < UNITS.len() - 1 {
        value /= 1024.0;
        place += 1;
    }
    if place == 0 {
        format!("{bytes}B")
    } else {
        format!("{:.1}{}B", value, UNITS[place] as char)
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
}

/// Rewrites the current console line with transfer status.
#[derive(Debug, Default)]
pub struct StatusLine {
    last_downloaded: u64,
    rates: [u64; 2],
}

impl StatusLine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn show(&self, status: &str) {
        let mut line = format!("Status: {status}");
        line.truncate(LINE_WIDTH);
        let mut out = std::io::stdout().lock();
        let _ = write!(out, "\r{line:<LINE_WIDTH$}");
        let _ = out.flush();
    }

    /// Ends the status line so later output starts on a fresh one.
    pub fn finish(&self, status: &str) {
        self.show(status);
        println!();
    }

    /// Progress events arrive about once a second; the rate is the
    /// average of the last three deltas.
    pub fn progress(&mut self, downloaded: u64, total: Option<u64>) {
        let rate = self.sample(downloaded);
        let text = match total {
            Some(total) if total > 0 => {
                let eta = if rate > 0 {
                    format_duration(Duration::from_secs(total.saturating_sub(downloaded) / rate))
                } else {
                    "--:--:--".into()
                };
                format!(
                    "{} ({}%) downloaded, time remaining {} (at {}/sec)",
                    format_bytes(downloaded),
                    downloaded.saturating_mul(100) / total,
                    eta,
                    format_bytes(rate)
                )
            }
            _ => format!(
                "{} downloaded (at {}/sec)",
                format_bytes(downloaded),
                format_bytes(rate)
            ),
        };
        self.show(&text);
    }

    fn sample(&mut self, downloaded: u64) -> u64 {
        let current = downloaded.saturating_sub(self.last_downloaded);
        self.last_downloaded = downloaded;
        let or_current = |r: u64| if r > 0 { r } else { current };
        let rate = (current + or_current(self.rates[0]) + or_current(self.rates[1])) / 3;
        self.rates = [rate, self.rates[0]];
        rate
    }
}
