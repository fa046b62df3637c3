//! Ping handler: ICMP via the system `ping` binary, TCP via the native
//! connect-timing loop. Both share the one-result shell.

use serde_json::{json, Value};

use common::{PingOptions, PingProtocol, PingResult, ResultStatus};

use crate::net::tcp_ping::{self, TcpPingConfig, TcpPingRecord};
use crate::parsers;
use crate::progress::{BufferMode, ProgressBuffer};
use crate::runner::{self, LineAction, RunOutcome};
use crate::safety::{is_private_ip_str, PRIVATE_IP_ERROR};

use super::{
    effective_ip_version, family_flag, validate_target, HandlerContext, MeasurementError,
    TIMEOUT_SUFFIX,
};

pub async fn run(ctx: &HandlerContext, measurement_id: &str, test_id: &str, opts: PingOptions) {
    let mode = match opts.protocol {
        PingProtocol::Icmp => BufferMode::Append,
        PingProtocol::Tcp => BufferMode::Diff,
    };
    let buffer = ProgressBuffer::new(mode, measurement_id, test_id, ctx.tx.clone());
    let result = match opts.protocol {
        PingProtocol::Icmp => run_icmp(ctx, &buffer, &opts).await,
        PingProtocol::Tcp => run_tcp(&buffer, &opts).await,
    };
    match result {
        Ok(value) => buffer.push_result(value),
        Err(err) => buffer.push_result(to_value(PingResult::failed(err.to_string()))),
    }
}

fn validate(opts: &PingOptions) -> Result<(), MeasurementError> {
    validate_target(&opts.target)?;
    if !(1..=16).contains(&opts.packets) {
        return Err(MeasurementError::InvalidOptions(format!(
            "packets must be between 1 and 16, got {}",
            opts.packets
        )));
    }
    Ok(())
}

async fn run_icmp(
    ctx: &HandlerContext,
    buffer: &ProgressBuffer,
    opts: &PingOptions,
) -> Result<Value, MeasurementError> {
    validate(opts)?;
    let version = effective_ip_version(&opts.target, opts.ip_version);

    let argv = runner::with_unbuffer(vec![
        "ping".to_string(),
        family_flag(version).to_string(),
        "-O".to_string(),
        "-c".to_string(),
        opts.packets.to_string(),
        "-i".to_string(),
        "0.5".to_string(),
        "-w".to_string(),
        "10".to_string(),
        opts.target.clone(),
    ]);

    let mut accumulated = String::new();
    let mut address_checked = false;
    let outcome = runner::run_tool(&argv, ctx.command_timeout, |line| {
        accumulated.push_str(line);
        accumulated.push('\n');
        if !address_checked {
            let partial = parsers::ping::parse(&accumulated);
            if let Some(address) = partial.resolved_address.as_deref() {
                address_checked = true;
                if is_private_ip_str(address) == Some(true) {
                    return LineAction::Kill;
                }
            }
        }
        if opts.in_progress_updates {
            buffer.push_progress(json!({ "rawOutput": format!("{}\n", line) }));
        }
        LineAction::Continue
    })
    .await
    .map_err(|e| MeasurementError::ToolFailure(format!("Failed to run ping: {}", e)))?;

    Ok(match outcome {
        RunOutcome::Killed => to_value(PingResult::failed(PRIVATE_IP_ERROR)),
        RunOutcome::TimedOut => {
            to_value(PingResult::failed(format!("{}{}", accumulated, TIMEOUT_SUFFIX)))
        }
        RunOutcome::Completed | RunOutcome::ExitedNonZero => {
            let mut parsed = parsers::ping::parse(&accumulated);
            if parsed
                .resolved_address
                .as_deref()
                .and_then(is_private_ip_str)
                == Some(true)
            {
                return Ok(to_value(PingResult::failed(PRIVATE_IP_ERROR)));
            }
            if outcome == RunOutcome::ExitedNonZero {
                parsed.status = ResultStatus::Failed;
            }
            to_value(parsed)
        }
    })
}

async fn run_tcp(buffer: &ProgressBuffer, opts: &PingOptions) -> Result<Value, MeasurementError> {
    validate(opts)?;
    let config = TcpPingConfig {
        target: opts.target.clone(),
        port: opts.port.unwrap_or(80),
        packets: opts.packets,
        interval: tcp_ping::DEFAULT_INTERVAL,
        timeout: tcp_ping::DEFAULT_TIMEOUT,
        ip_version: effective_ip_version(&opts.target, opts.ip_version),
    };

    let mut seen: Vec<TcpPingRecord> = Vec::new();
    let in_progress = opts.in_progress_updates;
    let records = tcp_ping::run(&config, |record| {
        seen.push(record.clone());
        if in_progress {
            // diff mode: push the growing raw snapshot, the buffer emits
            // only the suffix
            buffer.push_progress(json!({
                "rawOutput": tcp_ping::to_raw_tcp_output(&seen)
            }));
        }
    })
    .await;

    Ok(assemble_tcp_result(&opts.target, &records))
}

fn assemble_tcp_result(target: &str, records: &[TcpPingRecord]) -> Value {
    let raw_output = tcp_ping::to_raw_tcp_output(records);

    if let Some(TcpPingRecord::Error { message }) = records.first() {
        return to_value(PingResult::failed(message.clone()));
    }
    // defensive recheck of what the stream reports
    if let Some(address) = tcp_ping::stream_address(records) {
        if crate::safety::is_private_ip(address) {
            return to_value(PingResult::failed(PRIVATE_IP_ERROR));
        }
    }

    let resolved_address = records.iter().find_map(|r| match r {
        TcpPingRecord::Start { address, .. } => Some(address.clone()),
        _ => None,
    });
    let timings: Vec<Value> = records
        .iter()
        .filter_map(|r| match r {
            TcpPingRecord::Probe {
                rtt, success: true, ..
            } => Some(json!({ "rtt": rtt })),
            _ => None,
        })
        .collect();
    let stats = records.iter().find_map(|r| match r {
        TcpPingRecord::Statistics {
            total,
            rcv,
            drop,
            loss,
            min,
            avg,
            max,
            mdev,
            ..
        } => Some(json!({
            "total": total, "rcv": rcv, "drop": drop, "loss": loss,
            "min": min, "avg": avg, "max": max, "mdev": mdev,
        })),
        _ => None,
    });

    json!({
        "status": if stats.is_some() { "finished" } else { "failed" },
        "rawOutput": raw_output,
        "resolvedAddress": resolved_address,
        "resolvedHostname": target,
        "timings": timings,
        "stats": stats.unwrap_or_else(|| json!({
            "total": null, "rcv": null, "drop": null, "loss": null,
            "min": null, "avg": null, "max": null, "mdev": null,
        })),
    })
}

fn to_value(result: PingResult) -> Value {
    serde_json::to_value(result).unwrap_or(Value::Null)
}
