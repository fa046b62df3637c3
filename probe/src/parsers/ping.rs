//! Parser for GNU iputils `ping -O` output.
//!
//! `-O` makes ping print a `no answer yet` line for every missed reply, so
//! the stream stays line-per-packet even under loss. The grammar here is
//! the output of iputils as shipped in the canonical container image.

use once_cell::sync::Lazy;
use regex::Regex;

use common::{PingResult, PingStats, PingTiming, ResultStatus};

use super::{round1, round2};

// PING google.com (142.250.74.110) 56(84) bytes of data.
// PING b.root-servers.net(b.root-servers.net (2001:500:200::b)) 56 data bytes
static HEADER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^PING\s+(?P<host>\S+?)\s*\((?:(?P<althost>[^()\s]+)\s+\()?(?P<addr>[^()\s]+)\)").unwrap()
});

// 64 bytes from hostname (142.250.74.110): icmp_seq=1 ttl=118 time=12.3 ms
// 64 bytes from 2001:500:200::b: icmp_seq=1 ttl=55 time=170 ms
static REPLY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"ttl=(?P<ttl>\d+) time=(?P<time>\d+(?:\.\d+)?) ms").unwrap());

// 3 packets transmitted, 2 received, 33.3333% packet loss, time 2003ms
static SUMMARY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?P<total>\d+) packets transmitted, (?P<rcv>\d+) received,(?:.*?)(?P<loss>\d+(?:\.\d+)?)% packet loss",
    )
    .unwrap()
});

// rtt min/avg/max/mdev = 12.345/12.456/12.567/0.111 ms
static RTT_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"min/avg/max/mdev = (?P<min>\d+(?:\.\d+)?)/(?P<avg>\d+(?:\.\d+)?)/(?P<max>\d+(?:\.\d+)?)/",
    )
    .unwrap()
});

/// Parse (possibly partial) ping output into the result record. Without a
/// recognizable header the whole output is considered unparseable and the
/// record is marked failed.
pub fn parse(raw: &str) -> PingResult {
    let header = raw.lines().next().and_then(|line| HEADER_RE.captures(line));
    let Some(header) = header else {
        return PingResult::failed(raw);
    };

    let resolved_hostname = header
        .name("althost")
        .or_else(|| header.name("host"))
        .map(|m| m.as_str().to_string());
    let resolved_address = header.name("addr").map(|m| m.as_str().to_string());

    let timings: Vec<PingTiming> = REPLY_RE
        .captures_iter(raw)
        .filter_map(|caps| {
            let ttl = caps.name("ttl")?.as_str().parse().ok()?;
            let rtt: f64 = caps.name("time")?.as_str().parse().ok()?;
            Some(PingTiming {
                ttl,
                rtt: round1(rtt),
            })
        })
        .collect();

    let mut stats = PingStats::default();
    if let Some(caps) = SUMMARY_RE.captures(raw) {
        let total: Option<u64> = caps.name("total").and_then(|m| m.as_str().parse().ok());
        let rcv: Option<u64> = caps.name("rcv").and_then(|m| m.as_str().parse().ok());
        stats.total = total;
        stats.rcv = rcv;
        stats.drop = match (total, rcv) {
            (Some(t), Some(r)) => Some(t.saturating_sub(r)),
            _ => None,
        };
        stats.loss = caps
            .name("loss")
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .map(round2);
    }
    if let Some(caps) = RTT_LINE_RE.captures(raw) {
        stats.min = caps
            .name("min")
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .map(round2);
        stats.avg = caps
            .name("avg")
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .map(round2);
        stats.max = caps
            .name("max")
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .map(round2);
    }

    PingResult {
        status: ResultStatus::Finished,
        raw_output: raw.to_string(),
        resolved_address,
        resolved_hostname,
        timings,
        stats,
    }
}
