//! Build script for netpulse-probe
//!
//! Captures the compiler version so the coordinator handshake can report
//! what the probe was built with (the runtimeVersion query parameter).

use std::process::Command;

fn main() {
    // Cargo hands build scripts the compiler it drives via $RUSTC
    let rustc = std::env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());
    let version = Command::new(&rustc)
        .arg("--version")
        .output()
        .ok()
        .and_then(|out| String::from_utf8(out.stdout).ok())
        // "rustc 1.79.0 (129f3b996 2024-06-10)" -> "rustc-1.79.0"
        // (query-string safe: no spaces or parens)
        .and_then(|line| {
            line.split_whitespace()
                .nth(1)
                .map(|semver| format!("rustc-{}", semver))
        })
        .unwrap_or_else(|| "rustc".to_string());
    println!("cargo:rustc-env=RUSTC_VERSION={}", version);
    println!("cargo:rerun-if-env-changed=RUSTC");
}
