use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// Final result records, one fixed schema per tool. Fields that can be
// unknown stay `Option` and serialize as explicit `null` (the coordinator
// distinguishes "measured as absent" from "field missing").

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Finished,
    Failed,
}

// ============ ping ============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResult {
    pub status: ResultStatus,
    pub raw_output: String,
    pub resolved_address: Option<String>,
    pub resolved_hostname: Option<String>,
    pub timings: Vec<PingTiming>,
    pub stats: PingStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingTiming {
    pub ttl: u32,
    pub rtt: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingStats {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
    pub total: Option<u64>,
    pub rcv: Option<u64>,
    pub drop: Option<u64>,
    pub loss: Option<f64>,
}

impl PingResult {
    pub fn failed(raw_output: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Failed,
            raw_output: raw_output.into(),
            resolved_address: None,
            resolved_hostname: None,
            timings: Vec::new(),
            stats: PingStats::default(),
        }
    }
}

// ============ traceroute ============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TracerouteResult {
    pub status: ResultStatus,
    pub raw_output: String,
    pub resolved_address: Option<String>,
    pub resolved_hostname: Option<String>,
    pub hops: Vec<TracerouteHop>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TracerouteHop {
    pub resolved_address: Option<String>,
    pub resolved_hostname: Option<String>,
    pub asn: Vec<u32>,
    pub timings: Vec<RttTiming>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RttTiming {
    pub rtt: f64,
}

impl TracerouteResult {
    pub fn failed(raw_output: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Failed,
            raw_output: raw_output.into(),
            resolved_address: None,
            resolved_hostname: None,
            hops: Vec::new(),
        }
    }
}

// ============ mtr ============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MtrResult {
    pub status: ResultStatus,
    pub raw_output: String,
    pub resolved_address: Option<String>,
    pub resolved_hostname: Option<String>,
    pub hops: Vec<MtrHop>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MtrHop {
    pub resolved_address: Option<String>,
    pub resolved_hostname: Option<String>,
    pub asn: Vec<u32>,
    pub stats: MtrHopStats,
    pub timings: Vec<RttTiming>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MtrHopStats {
    pub total: u64,
    pub rcv: u64,
    pub drop: u64,
    pub loss: f64,
    pub min: Option<f64>,
    pub avg: Option<f64>,
    pub max: Option<f64>,
    pub st_dev: Option<f64>,
    pub j_min: Option<f64>,
    pub j_avg: Option<f64>,
    pub j_max: Option<f64>,
}

impl MtrResult {
    pub fn failed(raw_output: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Failed,
            raw_output: raw_output.into(),
            resolved_address: None,
            resolved_hostname: None,
            hops: Vec::new(),
        }
    }
}

// ============ dns ============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsResult {
    pub status: ResultStatus,
    pub raw_output: String,
    pub status_code: Option<i32>,
    pub status_code_name: Option<String>,
    pub resolver: Option<String>,
    pub answers: Vec<DnsAnswer>,
    pub timings: DnsTimings,
}

/// `dig +trace` result: one entry per delegation step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsTraceResult {
    pub status: ResultStatus,
    pub raw_output: String,
    pub hops: Vec<DnsTraceHop>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsTraceHop {
    pub resolver: Option<String>,
    pub answers: Vec<DnsAnswer>,
    pub timings: DnsTimings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsAnswer {
    pub name: String,
    pub ttl: u64,
    pub class: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnsTimings {
    pub total: Option<f64>,
}

impl DnsResult {
    pub fn failed(raw_output: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Failed,
            raw_output: raw_output.into(),
            status_code: None,
            status_code_name: None,
            resolver: None,
            answers: Vec::new(),
            timings: DnsTimings::default(),
        }
    }
}

// ============ http ============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResult {
    pub status: ResultStatus,
    pub resolved_address: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub raw_headers: String,
    pub raw_body: String,
    pub raw_output: String,
    pub truncated: bool,
    pub status_code: Option<u16>,
    pub status_code_name: Option<String>,
    pub timings: HttpTimings,
    pub tls: Option<TlsDetail>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpTimings {
    pub total: Option<u64>,
    pub dns: Option<u64>,
    pub tcp: Option<u64>,
    pub tls: Option<u64>,
    pub first_byte: Option<u64>,
    pub download: Option<u64>,
}

impl HttpResult {
    pub fn failed(raw_output: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Failed,
            resolved_address: None,
            headers: BTreeMap::new(),
            raw_headers: String::new(),
            raw_body: String::new(),
            raw_output: raw_output.into(),
            truncated: false,
            status_code: None,
            status_code_name: None,
            timings: HttpTimings::default(),
            tls: None,
        }
    }
}

/// Peer-certificate summary attached to HTTPS results.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsDetail {
    pub authorized: bool,
    pub protocol: String,
    pub cipher_name: String,
    pub created_at: String,
    pub expires_at: String,
    pub issuer: TlsIssuer,
    pub subject: TlsSubject,
    pub key_type: Option<String>,
    pub key_bits: Option<u64>,
    pub serial_number: String,
    pub fingerprint256: String,
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsIssuer {
    #[serde(rename = "C")]
    pub country: Option<String>,
    #[serde(rename = "O")]
    pub organization: Option<String>,
    #[serde(rename = "CN")]
    pub common_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsSubject {
    #[serde(rename = "CN")]
    pub common_name: Option<String>,
    pub alt: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_numeric_fields_serialize_as_null() {
        let result = PingResult::failed("no output");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "failed");
        assert!(json["stats"]["min"].is_null());
        assert!(json["stats"]["loss"].is_null());
        assert!(json["resolvedAddress"].is_null());
    }

    #[test]
    fn http_timings_keep_every_phase_key() {
        let result = HttpResult::failed("Request timeout.");
        let json = serde_json::to_value(&result).unwrap();
        for key in ["total", "dns", "tcp", "tls", "firstByte", "download"] {
            assert!(
                json["timings"].get(key).is_some(),
                "missing timing key {}",
                key
            );
            assert!(json["timings"][key].is_null());
        }
    }

    #[test]
    fn dns_answer_uses_type_key() {
        let answer = DnsAnswer {
            name: "example.com.".to_string(),
            ttl: 300,
            class: "IN".to_string(),
            record_type: "A".to_string(),
            value: "93.184.216.34".to_string(),
        };
        let json = serde_json::to_value(&answer).unwrap();
        assert_eq!(json["type"], "A");
        assert_eq!(json["ttl"], 300);
    }

    #[test]
    fn tls_issuer_uses_x509_attribute_keys() {
        let detail = TlsIssuer {
            country: Some("US".to_string()),
            organization: Some("Let's Encrypt".to_string()),
            common_name: Some("R3".to_string()),
        };
        let json = serde_json::to_value(&detail).unwrap();
        assert_eq!(json["C"], "US");
        assert_eq!(json["O"], "Let's Encrypt");
        assert_eq!(json["CN"], "R3");
    }
}
