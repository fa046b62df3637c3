//! MTR handler, wrapping `mtr --raw` with the per-hop aggregator.
//!
//! The destination is resolved in-process before mtr starts so the safety
//! filter can veto the target without sending a single probe; snapshots of
//! the hop table stream in overwrite mode while the trace runs.

use serde_json::{json, Value};

use common::{MtrOptions, MtrResult, ResultStatus, TraceProtocol};

use crate::net::resolver::{resolve_target, ResolveError};
use crate::parsers::mtr::MtrAggregator;
use crate::progress::{BufferMode, ProgressBuffer};
use crate::runner::{self, LineAction, RunOutcome};

use super::{
    effective_ip_version, family_flag, validate_target, HandlerContext, MeasurementError,
    TIMEOUT_SUFFIX,
};

pub async fn run(ctx: &HandlerContext, measurement_id: &str, test_id: &str, opts: MtrOptions) {
    let buffer = ProgressBuffer::new(
        BufferMode::Overwrite,
        measurement_id,
        test_id,
        ctx.tx.clone(),
    );
    match run_inner(ctx, &buffer, &opts).await {
        Ok(value) => buffer.push_result(value),
        Err(err) => buffer.push_result(to_value(MtrResult::failed(err.to_string()))),
    }
}

fn validate(opts: &MtrOptions) -> Result<(), MeasurementError> {
    validate_target(&opts.target)?;
    if !(1..=16).contains(&opts.packets) {
        return Err(MeasurementError::InvalidOptions(format!(
            "packets must be between 1 and 16, got {}",
            opts.packets
        )));
    }
    Ok(())
}

fn build_argv(opts: &MtrOptions, target_address: &str) -> Vec<String> {
    let version = effective_ip_version(&opts.target, opts.ip_version);
    let mut argv = vec![
        "mtr".to_string(),
        family_flag(version).to_string(),
        "--raw".to_string(),
        "--interval".to_string(),
        "0.5".to_string(),
        "--gracetime".to_string(),
        "3".to_string(),
        "--max-ttl".to_string(),
        "30".to_string(),
        "-c".to_string(),
        opts.packets.to_string(),
    ];
    match opts.protocol {
        TraceProtocol::Tcp => {
            argv.push("--tcp".to_string());
            argv.push("-P".to_string());
            argv.push(opts.port.to_string());
        }
        TraceProtocol::Udp => {
            argv.push("--udp".to_string());
            argv.push("-P".to_string());
            argv.push(opts.port.to_string());
        }
        TraceProtocol::Icmp => {}
    }
    argv.push(target_address.to_string());
    argv
}

async fn run_inner(
    ctx: &HandlerContext,
    buffer: &ProgressBuffer,
    opts: &MtrOptions,
) -> Result<Value, MeasurementError> {
    validate(opts)?;
    let version = effective_ip_version(&opts.target, opts.ip_version);

    let resolved = resolve_target(&opts.target, version, None)
        .await
        .map_err(|err| match err {
            ResolveError::PrivateOnly => MeasurementError::PrivateIp,
            other => MeasurementError::ToolFailure(other.to_string()),
        })?;
    let resolved_address = resolved.address.to_string();

    let argv = build_argv(opts, &resolved_address);
    let mut aggregator = MtrAggregator::new();
    let mut accumulated = String::new();
    let outcome = runner::run_tool(&argv, ctx.command_timeout, |line| {
        accumulated.push_str(line);
        accumulated.push('\n');
        if aggregator.feed(line) && opts.in_progress_updates {
            buffer.push_progress(json!({
                "rawOutput": accumulated.clone(),
                "hops": aggregator.hops(),
            }));
        }
        LineAction::Continue
    })
    .await
    .map_err(|e| MeasurementError::ToolFailure(format!("Failed to run mtr: {}", e)))?;

    let result = MtrResult {
        status: match outcome {
            RunOutcome::Completed => ResultStatus::Finished,
            _ => ResultStatus::Failed,
        },
        raw_output: match outcome {
            RunOutcome::TimedOut => format!("{}{}", accumulated, TIMEOUT_SUFFIX),
            _ => accumulated,
        },
        resolved_address: Some(resolved_address),
        resolved_hostname: Some(opts.target.clone()),
        hops: aggregator.hops(),
    };
    Ok(to_value(result))
}

fn to_value(result: MtrResult) -> Value {
    serde_json::to_value(result).unwrap_or(Value::Null)
}
