//! Round trip statistics for the demo.
//!
//! Collects the time from handing a packet to the controller until its
//! echo comes back, and prints a short summary with a histogram.

const BUCKETS: usize = 20;
const BUCKET_NS: u64 = 50_000;

/// Accumulates round trip times.
///
/// Keeps min, max and sum for the summary and a fixed histogram of
/// 50 microsecond buckets, the last one open ended.
pub struct RoundTripStats {
    pub min: u64,
    pub max: u64,
    pub sum: u64,
    pub count: u64,
    pub failures: u64,
    pub buckets: [u64; BUCKETS],
}

impl RoundTripStats {
    pub fn new() -> Self {
        Self {
            min: u64::MAX,
            max: 0,
            sum: 0,
            count: 0,
            failures: 0,
            buckets: [0; BUCKETS],
        }
    }

    /// Records one round trip of `nanos` nanoseconds.
    pub fn update(&mut self, nanos: u64) {
        self.min = self.min.min(nanos);
        self.max = self.max.max(nanos);
        self.sum += nanos;
        self.count += 1;

        let idx = ((nanos / BUCKET_NS) as usize).min(BUCKETS - 1);
        self.buckets[idx] += 1;
    }

    pub fn fail(&mut self) {
        self.failures += 1;
    }

    /// Average in nanoseconds, 0.0 when nothing was recorded.
    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }

    pub fn print_report(&self) {
        println!("\nRound Trip Latency");
        println!("Count:    {}", self.count);
        println!("Failures: {}", self.failures);
        if self.count == 0 {
            return;
        }
        println!("Min:      {:.2} us", self.min as f64 / 1000.0);
        println!("Avg:      {:.2} us", self.avg() / 1000.0);
        println!("Max:      {:.2} us", self.max as f64 / 1000.0);

        println!("Distribution (50us buckets):");
        for (i, &count) in self.buckets.iter().enumerate() {
            if count > 0 {
                let open = if i == BUCKETS - 1 { ">" } else { "" };
                let lower = i as u64 * BUCKET_NS / 1000;
                let upper = (i as u64 + 1) * BUCKET_NS / 1000;
                println!("[{lower:4}-{upper:4}{open} us]: {count}");
            }
        }
    }
}
