//! Parser for `traceroute -N 20 -w 2 -q 2` output.

use once_cell::sync::Lazy;
use regex::Regex;

use common::{ResultStatus, RttTiming, TracerouteHop, TracerouteResult};

use super::round1;

// traceroute to google.com (142.250.74.110), 20 hops max, 60 byte packets
static HEADER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^traceroute to (?P<host>\S+) \((?P<addr>[^()\s]+)\)").unwrap()
});

//  4  ae-1.bar1.example.net (203.0.113.5)  10.123 ms  10.241 ms
static HOP_HOST_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?P<hop>\d+)\s+(?:(?P<host>\S+)\s+\((?P<ip>[^()\s]+)\))?").unwrap()
});

static RTT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?) ms").unwrap());

/// Parse (possibly partial) traceroute output. The header line gives the
/// resolved destination; each subsequent line is one hop.
pub fn parse(raw: &str) -> TracerouteResult {
    let mut lines = raw.lines();
    let header = lines.next().and_then(|line| HEADER_RE.captures(line));
    let Some(header) = header else {
        return TracerouteResult::failed(raw);
    };

    let mut hops = Vec::new();
    for line in lines {
        let Some(caps) = HOP_HOST_RE.captures(line) else {
            continue;
        };
        if caps.name("hop").is_none() {
            continue;
        }
        let resolved_hostname = caps.name("host").map(|m| m.as_str().to_string());
        let resolved_address = caps.name("ip").map(|m| m.as_str().to_string());
        let timings = RTT_RE
            .captures_iter(line)
            .filter_map(|c| c.get(1)?.as_str().parse::<f64>().ok())
            .map(|rtt| RttTiming { rtt: round1(rtt) })
            .collect();
        hops.push(TracerouteHop {
            resolved_address,
            resolved_hostname,
            // populated by the (out-of-scope) IP-to-ASN output layer
            asn: Vec::new(),
            timings,
        });
    }

    TracerouteResult {
        status: ResultStatus::Finished,
        raw_output: raw.to_string(),
        resolved_address: Some(header["addr"].to_string()),
        resolved_hostname: Some(header["host"].to_string()),
        hops,
    }
}
