use std::io::{self, Write};
use std::time::Instant;

/// Progress line rendering for transfer operations.
///
/// Displays updates like:
/// - `Enumerating refs: 42` (no total)
/// - `Receiving objects:  50% (42/84)` (with total)
/// - `Receiving objects:  50% (42/84), 1.23 MiB | 456.00 KiB/s`
///
/// Output goes to stderr by default; tests substitute a buffer. Remote
/// progress (sideband channel 2) is already formatted by the peer and is
/// forwarded verbatim, not through this type.
pub struct Progress {
    title: String,
    total: Option<u64>,
    current: u64,
    start_time: Instant,
    last_update: Instant,
    /// Minimum delay between display updates in milliseconds.
    delay_ms: u64,
    started: bool,
    /// Delay before the first line is shown, like delayed progress in
    /// interactive transfers.
    initial_delay_ms: u64,
    throughput: Option<ThroughputState>,
    last_percent: Option<u32>,
    out: Box<dyn Write + Send>,
}

struct ThroughputState {
    last_bytes: u64,
    last_time: Instant,
    avg_bytes: f64,
    avg_seconds: f64,
}

impl Progress {
    /// Create a progress display with a title and optional total count.
    pub fn new(title: &str, total: Option<u64>) -> Self {
        Self::with_output(title, total, Box::new(io::stderr()))
    }

    /// Create a progress display writing to the given sink.
    pub fn with_output(title: &str, total: Option<u64>, out: Box<dyn Write + Send>) -> Self {
        let now = Instant::now();
        Self {
            title: title.to_string(),
            total,
            current: 0,
            start_time: now,
            last_update: now,
            delay_ms: 100,
            started: false,
            initial_delay_ms: 0,
            throughput: None,
            last_percent: None,
            out,
        }
    }

    /// Delay the first display by `initial_delay_ms`.
    pub fn delayed(title: &str, total: Option<u64>, initial_delay_ms: u64) -> Self {
        let mut p = Self::new(title, total);
        p.initial_delay_ms = initial_delay_ms;
        p
    }

    /// Enable throughput display.
    pub fn enable_throughput(&mut self) {
        let now = Instant::now();
        self.throughput = Some(ThroughputState {
            last_bytes: 0,
            last_time: now,
            avg_bytes: 0.0,
            avg_seconds: 0.0,
        });
    }

    /// Feed the throughput counter with total bytes transferred so far.
    pub fn display_throughput(&mut self, total_bytes: u64) {
        if let Some(ref mut tp) = self.throughput {
            let now = Instant::now();
            let elapsed = now.duration_since(tp.last_time).as_secs_f64();
            if elapsed > 0.0 {
                let bytes_delta = total_bytes.saturating_sub(tp.last_bytes) as f64;
                // Exponential moving average
                tp.avg_bytes = tp.avg_bytes * 0.875 + bytes_delta * 0.125;
                tp.avg_seconds = tp.avg_seconds * 0.875 + elapsed * 0.125;
                tp.last_bytes = total_bytes;
                tp.last_time = now;
            }
        }
    }

    /// Update the progress count.
    pub fn update(&mut self, count: u64) {
        self.current = count;

        let now = Instant::now();
        let since_last = now.duration_since(self.last_update).as_millis() as u64;

        if !self.started {
            let since_start = now.duration_since(self.start_time).as_millis() as u64;
            if since_start < self.initial_delay_ms {
                return;
            }
        }

        // Rate-limit, but always show 100%
        if self.started && since_last < self.delay_ms {
            match self.total {
                Some(total) if count >= total => {}
                _ => return,
            }
        }

        if let Some(total) = self.total {
            if total > 0 {
                let percent = ((count as f64 / total as f64) * 100.0) as u32;
                if self.started && self.last_percent == Some(percent) && count < total {
                    return;
                }
                self.last_percent = Some(percent);
            }
        }

        self.started = true;
        self.last_update = now;
        self.display();
    }

    /// Increment the count by one.
    pub fn tick(&mut self) {
        self.update(self.current + 1);
    }

    fn display(&mut self) {
        let counters = match self.total {
            Some(total) if total > 0 => {
                let percent = (self.current as f64 / total as f64) * 100.0;
                format!(
                    "\r{}: {:3.0}% ({}/{})",
                    self.title, percent, self.current, total
                )
            }
            _ => format!("\r{}: {}", self.title, self.current),
        };

        let line = match self.format_throughput() {
            s if s.is_empty() => counters,
            s => format!("{}, {}", counters, s),
        };

        let _ = write!(self.out, "{}", line);
        let _ = self.out.flush();
    }

    fn format_throughput(&self) -> String {
        match self.throughput {
            Some(ref tp) if tp.avg_seconds > 0.0 => {
                let bytes_per_sec = tp.avg_bytes / tp.avg_seconds;
                let (value, unit) = human_readable_bytes(bytes_per_sec);
                let (total_value, total_unit) = human_readable_bytes(tp.last_bytes as f64);
                format!("{:.2} {} | {:.2} {}/s", total_value, total_unit, value, unit)
            }
            _ => String::new(),
        }
    }

    /// Finish and terminate the progress line with ", done.".
    pub fn finish(mut self) {
        if self.started {
            self.current = self.total.unwrap_or(self.current);
            self.display();
            let _ = writeln!(self.out, ", done.");
            let _ = self.out.flush();
        }
    }
}

fn human_readable_bytes(bytes: f64) -> (f64, &'static str) {
    if bytes >= 1024.0 * 1024.0 * 1024.0 {
        (bytes / (1024.0 * 1024.0 * 1024.0), "GiB")
    } else if bytes >= 1024.0 * 1024.0 {
        (bytes / (1024.0 * 1024.0), "MiB")
    } else if bytes >= 1024.0 {
        (bytes / 1024.0, "KiB")
    } else {
        (bytes, "B")
    }
}
