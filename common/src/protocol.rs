use serde::{Deserialize, Serialize};

// ============ Wire framing ============
// Every frame on the coordinator channel is a two-element JSON array:
// ["event:name", payload]. The event-name constants below are the complete
// vocabulary in both directions.

/// Inbound: coordinator tells the probe where it was geolocated.
pub const EV_CONNECT_LOCATION: &str = "api:connect:location";
/// Inbound: dispatch one measurement.
pub const EV_MEASUREMENT_REQUEST: &str = "probe:measurement:request";
/// Inbound: terminate the process immediately.
pub const EV_SIGKILL: &str = "probe:sigkill";
/// Inbound: adoption code for the operator to claim this probe.
pub const EV_ADOPTION_CODE: &str = "probe:adoption:code";
/// Inbound: coordinator-side error report.
pub const EV_API_ERROR: &str = "api:error";

/// Outbound: current probe status string.
pub const EV_STATUS_UPDATE: &str = "probe:status:update";
/// Outbound: IPv4 reachability flag.
pub const EV_IPV4_UPDATE: &str = "probe:isIPv4Supported:update";
/// Outbound: IPv6 reachability flag.
pub const EV_IPV6_UPDATE: &str = "probe:isIPv6Supported:update";
/// Outbound: acknowledge acceptance of a measurement request.
pub const EV_MEASUREMENT_ACK: &str = "probe:measurement:ack";
/// Outbound: partial measurement output.
pub const EV_MEASUREMENT_PROGRESS: &str = "probe:measurement:progress";
/// Outbound: terminal measurement output.
pub const EV_MEASUREMENT_RESULT: &str = "probe:measurement:result";

/// Probe lifecycle status as reported to the coordinator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProbeStatus {
    #[serde(rename = "initializing")]
    Initializing,
    #[serde(rename = "unbuffer-missing")]
    UnbufferMissing,
    #[serde(rename = "ping-test-failed")]
    PingTestFailed,
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "sigterm")]
    Sigterm,
}

impl ProbeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeStatus::Initializing => "initializing",
            ProbeStatus::UnbufferMissing => "unbuffer-missing",
            ProbeStatus::PingTestFailed => "ping-test-failed",
            ProbeStatus::Ready => "ready",
            ProbeStatus::Sigterm => "sigterm",
        }
    }
}

/// Query parameters sent with every (re)connect handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeQuery {
    pub version: String,
    pub runtime_version: String,
    pub uuid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fake_ip: Option<String>,
}

// ============ Inbound payloads ============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationInfo {
    pub city: String,
    pub country: String,
    pub continent: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdoptionCode {
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub info: ApiErrorInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorInfo {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

/// One measurement dispatched by the coordinator. Immutable during
/// execution; `(measurement_id, test_id)` identifies every event the probe
/// sends back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementRequest {
    pub measurement_id: String,
    pub test_id: String,
    pub measurement: MeasurementCommand,
}

/// The tool to run plus its raw (not yet validated) options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MeasurementCommand {
    Ping(PingOptions),
    Traceroute(TracerouteOptions),
    Mtr(MtrOptions),
    Dns(DnsOptions),
    Http(HttpOptions),
}

impl MeasurementCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            MeasurementCommand::Ping(_) => "ping",
            MeasurementCommand::Traceroute(_) => "traceroute",
            MeasurementCommand::Mtr(_) => "mtr",
            MeasurementCommand::Dns(_) => "dns",
            MeasurementCommand::Http(_) => "http",
        }
    }
}

// ============ Per-tool options ============
// Defaults here mirror what the coordinator may omit; range checks happen
// probe-side during validation.

/// IP family requested for a measurement. On the wire this is the bare
/// number 4 or 6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

impl Serialize for IpVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            IpVersion::V4 => serializer.serialize_u8(4),
            IpVersion::V6 => serializer.serialize_u8(6),
        }
    }
}

impl<'de> Deserialize<'de> for IpVersion {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = serde_json::Value::deserialize(deserializer)?;
        match &v {
            serde_json::Value::Number(n) if n.as_u64() == Some(4) => Ok(IpVersion::V4),
            serde_json::Value::Number(n) if n.as_u64() == Some(6) => Ok(IpVersion::V6),
            serde_json::Value::String(s) if s == "4" => Ok(IpVersion::V4),
            serde_json::Value::String(s) if s == "6" => Ok(IpVersion::V6),
            other => Err(serde::de::Error::custom(format!(
                "ipVersion must be 4 or 6, got {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum PingProtocol {
    #[default]
    Icmp,
    Tcp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingOptions {
    pub target: String,
    #[serde(default = "default_packets")]
    pub packets: u32,
    #[serde(default)]
    pub protocol: PingProtocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_version: Option<IpVersion>,
    #[serde(default)]
    pub in_progress_updates: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum TraceProtocol {
    Icmp,
    Tcp,
    #[default]
    Udp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TracerouteOptions {
    pub target: String,
    #[serde(default)]
    pub protocol: TraceProtocol,
    #[serde(default = "default_trace_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_version: Option<IpVersion>,
    #[serde(default)]
    pub in_progress_updates: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MtrOptions {
    pub target: String,
    #[serde(default)]
    pub protocol: TraceProtocol,
    #[serde(default = "default_trace_port")]
    pub port: u16,
    #[serde(default = "default_packets")]
    pub packets: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_version: Option<IpVersion>,
    #[serde(default)]
    pub in_progress_updates: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum DnsProtocol {
    #[default]
    Udp,
    Tcp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsQueryOptions {
    #[serde(default = "default_dns_type", rename = "type")]
    pub query_type: String,
}

impl Default for DnsQueryOptions {
    fn default() -> Self {
        Self {
            query_type: default_dns_type(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsOptions {
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolver: Option<String>,
    #[serde(default)]
    pub query: DnsQueryOptions,
    #[serde(default = "default_dns_port")]
    pub port: u16,
    #[serde(default)]
    pub protocol: DnsProtocol,
    #[serde(default)]
    pub trace: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_version: Option<IpVersion>,
    #[serde(default)]
    pub in_progress_updates: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum HttpProtocol {
    #[serde(rename = "HTTP")]
    Http,
    #[default]
    #[serde(rename = "HTTPS")]
    Https,
    #[serde(rename = "HTTP2")]
    Http2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestOptions {
    #[serde(default = "default_http_method")]
    pub method: String,
    #[serde(default = "default_http_path")]
    pub path: String,
    #[serde(default)]
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default)]
    pub headers: std::collections::BTreeMap<String, String>,
}

impl Default for HttpRequestOptions {
    fn default() -> Self {
        Self {
            method: default_http_method(),
            path: default_http_path(),
            query: String::new(),
            host: None,
            headers: std::collections::BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpOptions {
    pub target: String,
    #[serde(default)]
    pub protocol: HttpProtocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub request: HttpRequestOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_version: Option<IpVersion>,
    #[serde(default)]
    pub in_progress_updates: bool,
}

fn default_packets() -> u32 {
    3
}

fn default_trace_port() -> u16 {
    80
}

fn default_dns_type() -> String {
    "A".to_string()
}

fn default_dns_port() -> u16 {
    53
}

fn default_http_method() -> String {
    "HEAD".to_string()
}

fn default_http_path() -> String {
    "/".to_string()
}

// ============ Outbound payloads ============

/// One partial-output event. `result` is the tool-specific free-form record;
/// `overwrite` tells the coordinator to replace (rather than append to) the
/// partial state it holds for this measurement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub measurement_id: String,
    pub test_id: String,
    pub result: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overwrite: Option<bool>,
}

/// The single terminal event for a measurement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultEvent {
    pub measurement_id: String,
    pub test_id: String,
    pub result: serde_json::Value,
}

/// Ack payload for an accepted measurement request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementAck {
    pub measurement_id: String,
    pub test_id: String,
}
