//! Round-trip statistics for a single traceroute hop line.

use std::fmt;
use std::net::IpAddr;

/// Hop ordinal at which unix traceroute gives up (its default `-m`).
pub const MAX_HOPS: &str = "30";

/// Statistics folded from one hop line. Built once, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct PingStats {
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    pub received: u32,
    pub lost: u32,
    pub lost_percent: f64,
    /// Set when the target address appeared on the line (or was forced, see
    /// [`PingStats::from_hop`]).
    pub resolved_ip: Option<String>,
    /// Timing tokens exactly as traceroute printed them, in order.
    pub samples: Vec<String>,
}

impl PingStats {
    /// Fold the whitespace-separated `fields` of a hop line.
    ///
    /// The first field is the hop ordinal and is skipped. Numbers are
    /// samples, `*` and `!`-codes are losses, `<1` counts as 0.5ms and a
    /// token equal to `target` marks the hop as the target. When every probe
    /// on hop 30 was lost the target is adopted anyway: that is how unix
    /// traceroute reports an unreachable host.
    pub fn from_hop(fields: &[&str], target: &str) -> Self {
        let mut acc = Accumulator::new();
        let mut resolved_ip = None;

        for raw in fields.iter().skip(1) {
            let token = raw.trim();
            if token.is_empty() {
                continue;
            }
            if let Some(value) = parse_sample(token) {
                acc.sample(value, token);
            } else if token == "*" || token.contains('!') {
                acc.lost += 1;
            } else if token == "<1" {
                acc.sample(0.5, "0.5");
            } else if token == target {
                resolved_ip = adopt(token);
            }
        }

        let min_ms = if acc.count == 0 { 0.0 } else { acc.min };
        let avg_ms = if acc.count == 0 {
            0.0
        } else {
            round_to(acc.total / f64::from(acc.count), 3)
        };
        let attempts = acc.count + acc.lost;
        let lost_percent = if attempts == 0 {
            0.0
        } else {
            round_to(f64::from(acc.lost) / f64::from(attempts) * 100.0, 1)
        };

        let hop = fields.first().map(|f| f.trim()).unwrap_or_default();
        if lost_percent == 100.0 && hop == MAX_HOPS {
            resolved_ip = adopt(target);
        }

        Self {
            min_ms,
            max_ms: acc.max,
            avg_ms,
            received: acc.count,
            lost: acc.lost,
            lost_percent,
            resolved_ip,
            samples: acc.samples,
        }
    }

    pub fn sent(&self) -> u32 {
        self.received + self.lost
    }
}

/// Windows-style summary block.
impl fmt::Display for PingStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Ping statistics for {}:",
            self.resolved_ip.as_deref().unwrap_or("unknown")
        )?;
        writeln!(
            f,
            "    Packets: Sent = {}, Received = {}, Lost = {} ({:?}% loss),",
            self.sent(),
            self.received,
            self.lost,
            self.lost_percent
        )?;
        writeln!(f, "Approximate round trip times in milli-seconds:")?;
        writeln!(
            f,
            "    Minimum = {:?}ms, Maximum = {:?}ms, Average = {:?}ms",
            self.min_ms, self.max_ms, self.avg_ms
        )
    }
}

struct Accumulator {
    min: f64,
    max: f64,
    total: f64,
    count: u32,
    lost: u32,
    samples: Vec<String>,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            min: f64::MAX,
            max: 0.0,
            total: 0.0,
            count: 0,
            lost: 0,
            samples: Vec::new(),
        }
    }

    fn sample(&mut self, value: f64, token: &str) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.total += value;
        self.count += 1;
        self.samples.push(token.to_string());
    }
}

fn parse_sample(token: &str) -> Option<f64> {
    token.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn adopt(candidate: &str) -> Option<String> {
    candidate
        .parse::<IpAddr>()
        .ok()
        .map(|_| candidate.to_string())
}

/// Round half away from zero to `places` decimal places.
pub fn round_to(value: f64, places: i32) -> f64 {
    let shift = 10f64.powi(places);
    (value * shift).round() / shift
}
