//! Traceroute handler, wrapping the system `traceroute` binary.

use serde_json::{json, Value};

use common::{ResultStatus, TraceProtocol, TracerouteOptions, TracerouteResult};

use crate::parsers;
use crate::progress::{BufferMode, ProgressBuffer};
use crate::runner::{self, LineAction, RunOutcome};
use crate::safety::{is_private_ip_str, PRIVATE_IP_ERROR};

use super::{
    effective_ip_version, family_flag, validate_target, HandlerContext, MeasurementError,
    TIMEOUT_SUFFIX,
};

pub async fn run(
    ctx: &HandlerContext,
    measurement_id: &str,
    test_id: &str,
    opts: TracerouteOptions,
) {
    let buffer = ProgressBuffer::new(BufferMode::Append, measurement_id, test_id, ctx.tx.clone());
    match run_inner(ctx, &buffer, &opts).await {
        Ok(value) => buffer.push_result(value),
        Err(err) => buffer.push_result(to_value(TracerouteResult::failed(err.to_string()))),
    }
}

fn build_argv(opts: &TracerouteOptions) -> Vec<String> {
    let version = effective_ip_version(&opts.target, opts.ip_version);
    let mut argv = vec![
        "traceroute".to_string(),
        family_flag(version).to_string(),
        "-m".to_string(),
        "20".to_string(),
        "-N".to_string(),
        "20".to_string(),
        "-w".to_string(),
        "2".to_string(),
        "-q".to_string(),
        "2".to_string(),
    ];
    match opts.protocol {
        TraceProtocol::Tcp => {
            argv.push("--tcp".to_string());
            argv.push("-p".to_string());
            argv.push(opts.port.to_string());
        }
        TraceProtocol::Udp => {
            argv.push("--udp".to_string());
            argv.push("-p".to_string());
            argv.push(opts.port.to_string());
        }
        TraceProtocol::Icmp => argv.push("--icmp".to_string()),
    }
    argv.push(opts.target.clone());
    argv
}

async fn run_inner(
    ctx: &HandlerContext,
    buffer: &ProgressBuffer,
    opts: &TracerouteOptions,
) -> Result<Value, MeasurementError> {
    validate_target(&opts.target)?;
    let argv = build_argv(opts);

    let mut accumulated = String::new();
    let mut address_checked = false;
    let outcome = runner::run_tool(&argv, ctx.command_timeout, |line| {
        accumulated.push_str(line);
        accumulated.push('\n');
        if !address_checked {
            let partial = parsers::traceroute::parse(&accumulated);
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
    .map_err(|e| MeasurementError::ToolFailure(format!("Failed to run traceroute: {}", e)))?;

    Ok(match outcome {
        RunOutcome::Killed => to_value(TracerouteResult::failed(PRIVATE_IP_ERROR)),
        RunOutcome::TimedOut => to_value(TracerouteResult::failed(format!(
            "{}{}",
            accumulated, TIMEOUT_SUFFIX
        ))),
        RunOutcome::Completed | RunOutcome::ExitedNonZero => {
            let mut parsed = parsers::traceroute::parse(&accumulated);
            if parsed
                .resolved_address
                .as_deref()
                .and_then(is_private_ip_str)
                == Some(true)
            {
                return Ok(to_value(TracerouteResult::failed(PRIVATE_IP_ERROR)));
            }
            if outcome == RunOutcome::ExitedNonZero {
                parsed.status = ResultStatus::Failed;
            }
            to_value(parsed)
        }
    })
}

fn to_value(result: TracerouteResult) -> Value {
    serde_json::to_value(result).unwrap_or(Value::Null)
}
