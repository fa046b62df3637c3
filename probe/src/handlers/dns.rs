//! DNS handler, wrapping `dig`.
//!
//! Single-shot queries stream line-by-line; `+trace` treats each completed
//! delegation block as one progress unit. Answers that point at private
//! address space abort the measurement.

use serde_json::{json, Value};

use common::{DnsOptions, DnsProtocol, DnsResult, ResultStatus};

use crate::parsers;
use crate::progress::{BufferMode, ProgressBuffer};
use crate::runner::{self, LineAction, RunOutcome};
use crate::safety::{is_private_ip_str, PRIVATE_IP_ERROR};

use super::{family_flag, validate_target, HandlerContext, MeasurementError, TIMEOUT_SUFFIX};

const ALLOWED_TYPES: &[&str] = &[
    "A", "AAAA", "ANY", "CNAME", "DNSKEY", "DS", "HTTPS", "MX", "NS", "NSEC", "PTR", "RRSIG",
    "SOA", "TXT", "SRV", "SVCB", "CAA",
];

pub async fn run(ctx: &HandlerContext, measurement_id: &str, test_id: &str, opts: DnsOptions) {
    let buffer = ProgressBuffer::new(BufferMode::Append, measurement_id, test_id, ctx.tx.clone());
    match run_inner(ctx, &buffer, &opts).await {
        Ok(value) => buffer.push_result(value),
        Err(err) => buffer.push_result(to_value(DnsResult::failed(err.to_string()))),
    }
}

fn validate(opts: &DnsOptions) -> Result<String, MeasurementError> {
    validate_target(&opts.target)?;
    let query_type = opts.query.query_type.to_uppercase();
    if !ALLOWED_TYPES.contains(&query_type.as_str()) {
        return Err(MeasurementError::InvalidOptions(format!(
            "query type \"{}\" is not supported",
            opts.query.query_type
        )));
    }
    if let Some(resolver) = &opts.resolver {
        validate_target(resolver)?;
    }
    Ok(query_type)
}

fn build_argv(opts: &DnsOptions, query_type: &str) -> Vec<String> {
    let mut argv = vec!["dig".to_string()];

    // PTR lookups go through dig's reverse mode, replacing the plain target
    if query_type != "PTR" {
        argv.push(opts.target.clone());
    }
    if let Some(resolver) = &opts.resolver {
        argv.push(format!("@{}", resolver));
    }
    if query_type == "PTR" {
        argv.push("-x".to_string());
        argv.push(opts.target.clone());
    } else {
        argv.push("-t".to_string());
        argv.push(query_type.to_string());
    }
    if let Some(version) = opts.ip_version {
        argv.push(family_flag(version).to_string());
    }
    argv.push("-p".to_string());
    argv.push(opts.port.to_string());
    argv.push("+timeout=3".to_string());
    argv.push("+tries=2".to_string());
    argv.push("+nocookie".to_string());
    argv.push("+nsid".to_string());
    if opts.trace {
        argv.push("+trace".to_string());
    }
    if opts.protocol == DnsProtocol::Tcp {
        argv.push("+tcp".to_string());
    }
    argv
}

async fn run_inner(
    ctx: &HandlerContext,
    buffer: &ProgressBuffer,
    opts: &DnsOptions,
) -> Result<Value, MeasurementError> {
    let query_type = validate(opts)?;
    let argv = build_argv(opts, &query_type);

    let mut accumulated = String::new();
    let mut block = String::new();
    let outcome = runner::run_tool(&argv, ctx.command_timeout, |line| {
        accumulated.push_str(line);
        accumulated.push('\n');

        if has_private_answer(&accumulated, opts.trace) {
            return LineAction::Kill;
        }

        if opts.in_progress_updates {
            if opts.trace {
                // a delegation block ends with its Received trailer
                block.push_str(line);
                block.push('\n');
                if line.starts_with(";; Received") {
                    buffer.push_progress(json!({ "rawOutput": std::mem::take(&mut block) }));
                }
            } else {
                buffer.push_progress(json!({ "rawOutput": format!("{}\n", line) }));
            }
        }
        LineAction::Continue
    })
    .await
    .map_err(|e| MeasurementError::ToolFailure(format!("Failed to run dig: {}", e)))?;

    Ok(match outcome {
        RunOutcome::Killed => to_value(DnsResult::failed(PRIVATE_IP_ERROR)),
        RunOutcome::TimedOut => {
            to_value(DnsResult::failed(format!("{}{}", accumulated, TIMEOUT_SUFFIX)))
        }
        RunOutcome::Completed | RunOutcome::ExitedNonZero => {
            if has_private_answer(&accumulated, opts.trace) {
                return Ok(to_value(DnsResult::failed(PRIVATE_IP_ERROR)));
            }
            let failed = outcome == RunOutcome::ExitedNonZero;
            if opts.trace {
                let mut parsed = parsers::dns::parse_trace(&accumulated);
                if failed {
                    parsed.status = ResultStatus::Failed;
                }
                serde_json::to_value(parsed).unwrap_or(Value::Null)
            } else {
                let mut parsed = parsers::dns::parse(&accumulated);
                if failed {
                    parsed.status = ResultStatus::Failed;
                }
                to_value(parsed)
            }
        }
    })
}

/// True when any A/AAAA answer seen so far resolves into private space.
fn has_private_answer(raw: &str, trace: bool) -> bool {
    let answers: Vec<common::DnsAnswer> = if trace {
        parsers::dns::parse_trace(raw)
            .hops
            .into_iter()
            .flat_map(|hop| hop.answers)
            .collect()
    } else {
        parsers::dns::parse(raw).answers
    };
    answers
        .iter()
        .filter(|answer| answer.record_type == "A" || answer.record_type == "AAAA")
        .any(|answer| is_private_ip_str(&answer.value) == Some(true))
}

fn to_value(result: DnsResult) -> Value {
    serde_json::to_value(result).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::DnsQueryOptions;

    fn base_opts() -> DnsOptions {
        DnsOptions {
            target: "example.com".to_string(),
            resolver: None,
            query: DnsQueryOptions::default(),
            port: 53,
            protocol: DnsProtocol::Udp,
            trace: false,
            ip_version: None,
            in_progress_updates: false,
        }
    }

    #[test]
    fn argv_matches_the_tool_contract() {
        let opts = base_opts();
        let argv = build_argv(&opts, "A");
        assert_eq!(
            argv,
            vec![
                "dig",
                "example.com",
                "-t",
                "A",
                "-p",
                "53",
                "+timeout=3",
                "+tries=2",
                "+nocookie",
                "+nsid"
            ]
        );
    }

    #[test]
    fn resolver_trace_and_tcp_flags() {
        let mut opts = base_opts();
        opts.resolver = Some("8.8.8.8".to_string());
        opts.trace = true;
        opts.protocol = DnsProtocol::Tcp;
        let argv = build_argv(&opts, "A");
        assert_eq!(argv[1], "example.com");
        assert_eq!(argv[2], "@8.8.8.8");
        assert!(argv.contains(&"+trace".to_string()));
        assert!(argv.contains(&"+tcp".to_string()));
    }

    #[test]
    fn ptr_uses_reverse_mode() {
        let mut opts = base_opts();
        opts.target = "8.8.8.8".to_string();
        opts.query.query_type = "PTR".to_string();
        let argv = build_argv(&opts, "PTR");
        assert_eq!(argv[1], "-x");
        assert_eq!(argv[2], "8.8.8.8");
        assert!(!argv.contains(&"-t".to_string()));
    }

    #[test]
    fn unsupported_query_type_is_invalid() {
        let mut opts = base_opts();
        opts.query.query_type = "AXFR".to_string();
        let err = validate(&opts).unwrap_err();
        assert!(err.to_string().starts_with("Invalid options:"));
    }

    #[test]
    fn private_answers_are_detected() {
        let raw = "\
;; ->>HEADER<<- opcode: QUERY, status: NOERROR, id: 1
;; ANSWER SECTION:
gitlab.test.com.\t300\tIN\tA\t192.168.0.1

;; Query time: 5 msec
;; SERVER: 127.0.0.53#53(127.0.0.53)
";
        assert!(has_private_answer(raw, false));
        let public = raw.replace("192.168.0.1", "1.2.3.4");
        assert!(!has_private_answer(&public, false));
    }

    #[test]
    fn cname_answers_do_not_trip_the_filter() {
        let raw = "\
;; ->>HEADER<<- opcode: QUERY, status: NOERROR, id: 1
;; ANSWER SECTION:
www.example.com.\t300\tIN\tCNAME\texample.com.
";
        assert!(!has_private_answer(raw, false));
    }
}
