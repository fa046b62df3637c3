//! Per-tool measurement handlers.
//!
//! Every handler follows the same shell: validate options, build a progress
//! buffer, start the tool, stream partial output through the parser and the
//! safety filter, and push exactly one result no matter how the run ends.

pub mod dns;
pub mod http;
pub mod mtr;
pub mod ping;
pub mod traceroute;

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use common::{IpVersion, MeasurementCommand};

use crate::net::resolver::literal_ip_version;
use crate::safety::PRIVATE_IP_ERROR;
use crate::session::EventSender;

/// Suffix appended to the accumulated output when the wall clock fires.
pub const TIMEOUT_SUFFIX: &str = "\n\nThe measurement command timed out.";

#[derive(Debug, thiserror::Error)]
pub enum MeasurementError {
    #[error("Invalid options: {0}")]
    InvalidOptions(String),
    #[error("{}", PRIVATE_IP_ERROR)]
    PrivateIp,
    #[error("{0}")]
    ToolFailure(String),
}

/// Everything a handler needs besides its own options.
#[derive(Clone)]
pub struct HandlerContext {
    pub tx: EventSender,
    pub command_timeout: Duration,
}

/// Run one validated measurement command to completion. The handler owns
/// the single result emission; this function never fails.
pub async fn dispatch(
    ctx: &HandlerContext,
    measurement_id: &str,
    test_id: &str,
    command: MeasurementCommand,
) {
    tracing::info!(
        "Starting {} measurement {} (test {})",
        command.kind(),
        measurement_id,
        test_id
    );
    match command {
        MeasurementCommand::Ping(opts) => ping::run(ctx, measurement_id, test_id, opts).await,
        MeasurementCommand::Traceroute(opts) => {
            traceroute::run(ctx, measurement_id, test_id, opts).await
        }
        MeasurementCommand::Mtr(opts) => mtr::run(ctx, measurement_id, test_id, opts).await,
        MeasurementCommand::Dns(opts) => dns::run(ctx, measurement_id, test_id, opts).await,
        MeasurementCommand::Http(opts) => http::run(ctx, measurement_id, test_id, opts).await,
    }
    tracing::info!("Measurement {} completed", measurement_id);
}

static TARGET_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9.:_-]*$").unwrap());

/// Hostname-or-IP shape check shared by every tool.
pub(crate) fn validate_target(target: &str) -> Result<(), MeasurementError> {
    if target.is_empty() || target.len() > 255 || !TARGET_RE.is_match(target) {
        return Err(MeasurementError::InvalidOptions(format!(
            "target must be a valid hostname or IP address, got \"{}\"",
            target
        )));
    }
    Ok(())
}

/// Literal-IP targets pin the family; otherwise the requested version wins,
/// defaulting to IPv4.
pub(crate) fn effective_ip_version(target: &str, requested: Option<IpVersion>) -> IpVersion {
    literal_ip_version(target)
        .or(requested)
        .unwrap_or(IpVersion::V4)
}

pub(crate) fn family_flag(version: IpVersion) -> &'static str {
    match version {
        IpVersion::V4 => "-4",
        IpVersion::V6 => "-6",
    }
}
