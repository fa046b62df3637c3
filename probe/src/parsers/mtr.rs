//! Aggregator for the `mtr --raw` line protocol.
//!
//! The raw stream is one record per line:
//!   `h <hop> <ip>`       hop address discovered
//!   `d <hop> <host>`     reverse-DNS name for a hop
//!   `x <hop> <seq>`      probe transmitted
//!   `p <hop> <seq> <us>` reply received, RTT in microseconds
//!
//! State accumulates per hop; a snapshot of the whole table is produced
//! whenever a line changes anything, and the handler streams those
//! snapshots in overwrite mode.

use common::{MtrHop, MtrHopStats, RttTiming};

use super::{round1, round2};

#[derive(Debug, Default, Clone)]
struct HopState {
    ip: Option<String>,
    host: Option<String>,
    sent: u64,
    recv: u64,
    min: f64,
    max: f64,
    // Welford running statistics over received RTTs (ms)
    mean: f64,
    m2: f64,
    last_rtt: Option<f64>,
    jitter_sum: f64,
    jitter_count: u64,
    j_min: f64,
    j_max: f64,
    timings: Vec<f64>,
}

impl HopState {
    fn record_rtt(&mut self, rtt_ms: f64) {
        self.recv += 1;
        self.timings.push(rtt_ms);
        if self.recv == 1 {
            self.min = rtt_ms;
            self.max = rtt_ms;
        } else {
            self.min = self.min.min(rtt_ms);
            self.max = self.max.max(rtt_ms);
        }
        let delta = rtt_ms - self.mean;
        self.mean += delta / self.recv as f64;
        self.m2 += delta * (rtt_ms - self.mean);

        if let Some(prev) = self.last_rtt {
            let jitter = (rtt_ms - prev).abs();
            if self.jitter_count == 0 {
                self.j_min = jitter;
                self.j_max = jitter;
            } else {
                self.j_min = self.j_min.min(jitter);
                self.j_max = self.j_max.max(jitter);
            }
            self.jitter_sum += jitter;
            self.jitter_count += 1;
        }
        self.last_rtt = Some(rtt_ms);
    }

    fn to_hop(&self) -> MtrHop {
        let drop = self.sent.saturating_sub(self.recv);
        let loss = if self.sent > 0 {
            round2(drop as f64 / self.sent as f64 * 100.0)
        } else {
            0.0
        };
        let st_dev = if self.recv > 1 {
            Some(round2((self.m2 / (self.recv - 1) as f64).sqrt()))
        } else if self.recv == 1 {
            Some(0.0)
        } else {
            None
        };
        let (j_min, j_avg, j_max) = if self.jitter_count > 0 {
            (
                Some(round2(self.j_min)),
                Some(round2(self.jitter_sum / self.jitter_count as f64)),
                Some(round2(self.j_max)),
            )
        } else {
            (None, None, None)
        };
        MtrHop {
            resolved_address: self.ip.clone(),
            resolved_hostname: self.host.clone(),
            // populated by the (out-of-scope) IP-to-ASN output layer
            asn: Vec::new(),
            stats: MtrHopStats {
                total: self.sent,
                rcv: self.recv,
                drop,
                loss,
                min: (self.recv > 0).then(|| round2(self.min)),
                avg: (self.recv > 0).then(|| round2(self.mean)),
                max: (self.recv > 0).then(|| round2(self.max)),
                st_dev,
                j_min,
                j_avg,
                j_max,
            },
            timings: self
                .timings
                .iter()
                .map(|&rtt| RttTiming { rtt: round1(rtt) })
                .collect(),
        }
    }
}

#[derive(Debug, Default)]
pub struct MtrAggregator {
    hops: Vec<HopState>,
}

impl MtrAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw line. Returns true when the hop table changed and a new
    /// snapshot should be emitted. Unknown or truncated lines are ignored.
    pub fn feed(&mut self, line: &str) -> bool {
        let mut parts = line.split_whitespace();
        let (Some(kind), Some(hop)) = (parts.next(), parts.next()) else {
            return false;
        };
        let Ok(index) = hop.parse::<usize>() else {
            return false;
        };
        // raw hop numbers are 0-based and arrive in any order
        if index >= 64 {
            return false;
        }
        match kind {
            "h" => {
                let Some(ip) = parts.next() else {
                    return false;
                };
                self.hop_mut(index).ip = Some(ip.to_string());
                true
            }
            "d" => {
                let Some(host) = parts.next() else {
                    return false;
                };
                self.hop_mut(index).host = Some(host.to_string());
                true
            }
            "x" => {
                self.hop_mut(index).sent += 1;
                true
            }
            "p" => {
                let Some(rtt_us) = parts.nth(1).and_then(|v| v.parse::<f64>().ok()) else {
                    return false;
                };
                self.hop_mut(index).record_rtt(rtt_us / 1000.0);
                true
            }
            _ => false,
        }
    }

    /// Current table as result hops, in hop order.
    pub fn hops(&self) -> Vec<MtrHop> {
        self.hops.iter().map(HopState::to_hop).collect()
    }

    /// Address of the final hop that has one, i.e. the best guess for the
    /// destination while the trace is still running.
    pub fn last_hop_address(&self) -> Option<&str> {
        self.hops.iter().rev().find_map(|h| h.ip.as_deref())
    }

    fn hop_mut(&mut self, index: usize) -> &mut HopState {
        if self.hops.len() <= index {
            self.hops.resize_with(index + 1, HopState::default);
        }
        &mut self.hops[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MTR_RAW: &str = "\
h 0 192.168.1.1
x 0 1
p 0 1 1024
d 0 _gateway
h 1 98.128.128.1
x 1 1
p 1 1 2480
x 0 2
p 0 2 1311
x 1 2
x 1 3
p 1 3 2366
";

    fn run(raw: &str) -> MtrAggregator {
        let mut agg = MtrAggregator::new();
        for line in raw.lines() {
            agg.feed(line);
        }
        agg
    }

    #[test]
    fn aggregates_per_hop_counters() {
        let agg = run(MTR_RAW);
        let hops = agg.hops();
        assert_eq!(hops.len(), 2);

        let first = &hops[0];
        assert_eq!(first.resolved_address.as_deref(), Some("192.168.1.1"));
        assert_eq!(first.resolved_hostname.as_deref(), Some("_gateway"));
        assert_eq!(first.stats.total, 2);
        assert_eq!(first.stats.rcv, 2);
        assert_eq!(first.stats.drop, 0);
        assert_eq!(first.stats.loss, 0.0);
        assert_eq!(first.stats.min, Some(1.02));
        assert_eq!(first.stats.max, Some(1.31));

        let second = &hops[1];
        assert_eq!(second.stats.total, 3);
        assert_eq!(second.stats.rcv, 2);
        assert_eq!(second.stats.drop, 1);
        assert_eq!(second.stats.loss, 33.33);
    }

    #[test]
    fn jitter_tracks_consecutive_differences() {
        let mut agg = MtrAggregator::new();
        for line in ["x 0 1", "p 0 1 10000", "x 0 2", "p 0 2 14000", "x 0 3", "p 0 3 11000"] {
            agg.feed(line);
        }
        let stats = &agg.hops()[0].stats;
        // diffs: |14-10| = 4, |11-14| = 3
        assert_eq!(stats.j_min, Some(3.0));
        assert_eq!(stats.j_max, Some(4.0));
        assert_eq!(stats.j_avg, Some(3.5));
    }

    #[test]
    fn welford_stddev_matches_direct_formula() {
        let mut agg = MtrAggregator::new();
        let rtts_ms = [10.0, 12.0, 14.0, 16.0];
        for (i, rtt) in rtts_ms.iter().enumerate() {
            agg.feed(&format!("x 0 {}", i + 1));
            agg.feed(&format!("p 0 {} {}", i + 1, rtt * 1000.0));
        }
        let stats = &agg.hops()[0].stats;
        let mean = 13.0;
        let variance: f64 =
            rtts_ms.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / (rtts_ms.len() - 1) as f64;
        assert_eq!(stats.avg, Some(13.0));
        assert_eq!(stats.st_dev, Some(round2(variance.sqrt())));
    }

    #[test]
    fn min_is_monotonically_non_increasing_across_snapshots() {
        let mut agg = MtrAggregator::new();
        let mut last_min: Option<f64> = None;
        for (i, us) in [5000, 4000, 4500, 3000, 6000].iter().enumerate() {
            agg.feed(&format!("x 0 {}", i + 1));
            agg.feed(&format!("p 0 {} {}", i + 1, us));
            let min = agg.hops()[0].stats.min.unwrap();
            if let Some(prev) = last_min {
                assert!(min <= prev);
            }
            last_min = Some(min);
        }
    }

    #[test]
    fn malformed_lines_are_ignored() {
        let mut agg = MtrAggregator::new();
        assert!(!agg.feed(""));
        assert!(!agg.feed("p"));
        assert!(!agg.feed("p 0"));
        assert!(!agg.feed("p 0 1"));
        assert!(!agg.feed("q 0 1 2"));
        assert!(!agg.feed("h notanumber 1.2.3.4"));
        assert!(agg.hops().is_empty());
    }

    #[test]
    fn every_prefix_is_safe() {
        for end in 0..=MTR_RAW.len() {
            let mut agg = MtrAggregator::new();
            for line in MTR_RAW[..end].lines() {
                agg.feed(line);
            }
            let _ = agg.hops();
        }
    }

    #[test]
    fn last_hop_address_prefers_the_deepest_hop() {
        let agg = run(MTR_RAW);
        assert_eq!(agg.last_hop_address(), Some("98.128.128.1"));
    }
}
