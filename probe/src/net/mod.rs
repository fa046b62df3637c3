//! In-process network clients: DNS resolution, TCP-connect ping and the
//! raw HTTP(S) pipeline.

pub mod http_client;
pub mod resolver;
pub mod tcp_ping;
pub mod tls_detail;
