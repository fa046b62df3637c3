//! HTTP handler, driving the in-process client.

use serde_json::{json, Value};

use common::{HttpOptions, HttpProtocol, HttpResult};

use crate::net::http_client::{self, HttpClientConfig};
use crate::progress::{BufferMode, ProgressBuffer};

use super::{effective_ip_version, validate_target, HandlerContext, MeasurementError};

const ALLOWED_METHODS: &[&str] = &["GET", "HEAD", "OPTIONS"];

pub async fn run(ctx: &HandlerContext, measurement_id: &str, test_id: &str, opts: HttpOptions) {
    let buffer = ProgressBuffer::new(BufferMode::Append, measurement_id, test_id, ctx.tx.clone());
    match run_inner(&buffer, &opts).await {
        Ok(value) => buffer.push_result(value),
        Err(err) => buffer.push_result(to_value(HttpResult::failed(err.to_string()))),
    }
}

fn validate(opts: &HttpOptions) -> Result<String, MeasurementError> {
    validate_target(&opts.target)?;
    let method = opts.request.method.to_uppercase();
    if !ALLOWED_METHODS.contains(&method.as_str()) {
        return Err(MeasurementError::InvalidOptions(format!(
            "method \"{}\" is not supported",
            opts.request.method
        )));
    }
    if let Some(resolver) = &opts.resolver {
        validate_target(resolver)?;
    }
    Ok(method)
}

fn client_config(opts: &HttpOptions, method: String) -> HttpClientConfig {
    let port = opts.port.unwrap_or(match opts.protocol {
        HttpProtocol::Http => 80,
        _ => 443,
    });
    HttpClientConfig {
        target: opts.target.clone(),
        protocol: opts.protocol,
        port,
        method,
        path: opts.request.path.clone(),
        query: opts.request.query.clone(),
        host_header: opts.request.host.clone(),
        user_headers: opts
            .request
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect(),
        resolver: opts.resolver.clone(),
        ip_version: effective_ip_version(&opts.target, opts.ip_version),
    }
}

async fn run_inner(
    buffer: &ProgressBuffer,
    opts: &HttpOptions,
) -> Result<Value, MeasurementError> {
    let method = validate(opts)?;
    let config = client_config(opts, method);

    let in_progress = opts.in_progress_updates;
    let result = http_client::execute(&config, &mut |chunk| {
        if in_progress {
            buffer.push_progress(json!({
                "rawHeaders": chunk.raw_headers,
                "rawBody": chunk.raw_body,
                "rawOutput": chunk.raw_output,
            }));
        }
    })
    .await;

    Ok(to_value(result))
}

fn to_value(result: HttpResult) -> Value {
    serde_json::to_value(result).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::HttpRequestOptions;

    fn base_opts() -> HttpOptions {
        HttpOptions {
            target: "example.com".to_string(),
            protocol: HttpProtocol::Https,
            port: None,
            request: HttpRequestOptions::default(),
            resolver: None,
            ip_version: None,
            in_progress_updates: false,
        }
    }

    #[test]
    fn default_port_follows_protocol() {
        let opts = base_opts();
        let config = client_config(&opts, "GET".to_string());
        assert_eq!(config.port, 443);

        let mut plain = base_opts();
        plain.protocol = HttpProtocol::Http;
        let config = client_config(&plain, "GET".to_string());
        assert_eq!(config.port, 80);

        let mut custom = base_opts();
        custom.port = Some(8443);
        let config = client_config(&custom, "GET".to_string());
        assert_eq!(config.port, 8443);
    }

    #[test]
    fn only_safe_methods_pass_validation() {
        let mut opts = base_opts();
        opts.request.method = "POST".to_string();
        assert!(validate(&opts).is_err());
        opts.request.method = "get".to_string();
        assert_eq!(validate(&opts).unwrap(), "GET");
    }

    #[test]
    fn user_headers_are_forwarded() {
        let mut opts = base_opts();
        opts.request
            .headers
            .insert("x-custom".to_string(), "1".to_string());
        let config = client_config(&opts, "GET".to_string());
        assert_eq!(
            config.user_headers,
            vec![("x-custom".to_string(), "1".to_string())]
        );
    }
}
