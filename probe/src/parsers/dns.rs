//! Parser for `dig` textual output, single-shot and `+trace`.

use once_cell::sync::Lazy;
use regex::Regex;

use common::{DnsAnswer, DnsResult, DnsTimings, DnsTraceHop, DnsTraceResult, ResultStatus};

// ;; ->>HEADER<<- opcode: QUERY, status: NOERROR, id: 64265
static STATUS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"->>HEADER<<-.*\bstatus: (?P<status>[A-Z]+)").unwrap());

// google.com.  300  IN  A  142.250.74.110
static RECORD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<name>\S+)\s+(?P<ttl>\d+)\s+(?P<class>IN|CH|HS)\s+(?P<type>[A-Z0-9]+)\s+(?P<value>.+)$")
        .unwrap()
});

// ;; Query time: 12 msec
static QUERY_TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r";; Query time: (?P<ms>\d+) msec").unwrap());

// ;; SERVER: 8.8.8.8#53(8.8.8.8) (UDP)
static SERVER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r";; SERVER: (?P<addr>[^#\s]+)#\d+").unwrap());

// ;; Received 525 bytes from 198.41.0.4#53(a.root-servers.net) in 24 ms
static RECEIVED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r";; Received \d+ bytes from (?P<addr>[^#\s]+)#\d+\S* in (?P<ms>\d+) ms").unwrap()
});

/// Numeric RCODE for the names dig prints.
pub fn status_code(name: &str) -> Option<i32> {
    match name {
        "NOERROR" => Some(0),
        "FORMERR" => Some(1),
        "SERVFAIL" => Some(2),
        "NXDOMAIN" => Some(3),
        "NOTIMP" => Some(4),
        "REFUSED" => Some(5),
        "YXDOMAIN" => Some(6),
        "YXRRSET" => Some(7),
        "NXRRSET" => Some(8),
        "NOTAUTH" => Some(9),
        "NOTZONE" => Some(10),
        _ => None,
    }
}

/// Parse single-shot dig output (possibly partial).
pub fn parse(raw: &str) -> DnsResult {
    if !raw.contains(";; ") {
        return DnsResult::failed(raw);
    }

    let status_code_name = STATUS_RE
        .captures(raw)
        .map(|caps| caps["status"].to_string());

    let mut answers = Vec::new();
    let mut in_answer_section = false;
    for line in raw.lines() {
        if line.starts_with(";; ANSWER SECTION:") {
            in_answer_section = true;
            continue;
        }
        if in_answer_section {
            if line.trim().is_empty() || line.starts_with(";;") {
                in_answer_section = false;
                continue;
            }
            if let Some(answer) = parse_record(line) {
                answers.push(answer);
            }
        }
    }

    let total = QUERY_TIME_RE
        .captures(raw)
        .and_then(|caps| caps["ms"].parse::<f64>().ok());
    let resolver = SERVER_RE.captures(raw).map(|caps| caps["addr"].to_string());

    DnsResult {
        status: ResultStatus::Finished,
        raw_output: raw.to_string(),
        status_code: status_code_name.as_deref().and_then(status_code),
        status_code_name,
        resolver,
        answers,
        timings: DnsTimings { total },
    }
}

/// Parse `dig +trace` output (possibly partial). Each delegation block ends
/// with a `;; Received … from …` trailer; blocks without a trailer yet are
/// not reported.
pub fn parse_trace(raw: &str) -> DnsTraceResult {
    let mut hops = Vec::new();
    let mut pending: Vec<DnsAnswer> = Vec::new();

    for line in raw.lines() {
        if let Some(caps) = RECEIVED_RE.captures(line) {
            hops.push(DnsTraceHop {
                resolver: Some(caps["addr"].to_string()),
                answers: std::mem::take(&mut pending),
                timings: DnsTimings {
                    total: caps["ms"].parse::<f64>().ok(),
                },
            });
            continue;
        }
        if line.starts_with(';') || line.trim().is_empty() {
            continue;
        }
        if let Some(answer) = parse_record(line) {
            pending.push(answer);
        }
    }

    let status = if hops.is_empty() {
        ResultStatus::Failed
    } else {
        ResultStatus::Finished
    };
    DnsTraceResult {
        status,
        raw_output: raw.to_string(),
        hops,
    }
}

fn parse_record(line: &str) -> Option<DnsAnswer> {
    let caps = RECORD_RE.captures(line)?;
    Some(DnsAnswer {
        name: caps["name"].to_string(),
        ttl: caps["ttl"].parse().ok()?,
        class: caps["class"].to_string(),
        record_type: caps["type"].to_string(),
        value: caps["value"].trim().to_string(),
    })
}
