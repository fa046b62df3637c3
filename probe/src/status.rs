//! Probe status self-test.
//!
//! Readiness is earned, not assumed: the probe must find its subprocess
//! wrapper and demonstrate loss-free reachability to well-known anycast
//! targets before it accepts work. The test repeats every ten minutes and
//! re-announces status only when something changed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use common::{ProbeStatus, EV_IPV4_UPDATE, EV_IPV6_UPDATE, EV_STATUS_UPDATE};

use crate::parsers;
use crate::runner::{self, LineAction};
use crate::session::{EventSender, WireEvent};

/// Targets pinged during the self-test; a family counts as supported when
/// at least two of the three answer every packet.
pub const STATUS_TARGETS: &[&str] = &["ns1.registry.in", "k.root-servers.net", "ns1.dns.nl"];
/// Packets per self-test ping.
const TEST_PACKETS: u32 = 6;
/// Re-test cadence.
pub const STATUS_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq)]
struct StatusState {
    status: ProbeStatus,
    ipv4: bool,
    ipv6: bool,
}

pub struct StatusManager {
    tx: EventSender,
    state: Mutex<StatusState>,
}

impl StatusManager {
    pub fn new(tx: EventSender) -> Self {
        Self {
            tx,
            state: Mutex::new(StatusState {
                status: ProbeStatus::Initializing,
                ipv4: false,
                ipv6: false,
            }),
        }
    }

    pub fn current(&self) -> ProbeStatus {
        self.state.lock().unwrap().status
    }

    /// Announce status and both family flags (used on every reconnect and
    /// whenever the self-test changes anything).
    pub fn emit_all(&self) {
        let state = *self.state.lock().unwrap();
        let _ = self.tx.send(WireEvent {
            name: EV_STATUS_UPDATE,
            payload: json!(state.status.as_str()),
        });
        let _ = self.tx.send(WireEvent {
            name: EV_IPV4_UPDATE,
            payload: json!(state.ipv4),
        });
        let _ = self.tx.send(WireEvent {
            name: EV_IPV6_UPDATE,
            payload: json!(state.ipv6),
        });
    }

    /// SIGTERM is terminal: the scheduler stops and the status never
    /// changes again.
    pub fn set_sigterm(&self) {
        let mut state = self.state.lock().unwrap();
        state.status = ProbeStatus::Sigterm;
        drop(state);
        self.emit_all();
    }

    /// One full self-test pass.
    pub async fn run_self_test(&self, command_timeout: Duration) {
        if self.current() == ProbeStatus::Sigterm {
            return;
        }

        let new_state = if !runner::unbuffer_available().await {
            StatusState {
                status: ProbeStatus::UnbufferMissing,
                ipv4: false,
                ipv6: false,
            }
        } else {
            let ipv4 = family_supported("-4", command_timeout).await;
            let ipv6 = family_supported("-6", command_timeout).await;
            let status = if ipv4 || ipv6 {
                ProbeStatus::Ready
            } else {
                ProbeStatus::PingTestFailed
            };
            StatusState { status, ipv4, ipv6 }
        };

        let changed = {
            let mut state = self.state.lock().unwrap();
            if state.status == ProbeStatus::Sigterm {
                return;
            }
            let changed = *state != new_state;
            *state = new_state;
            changed
        };
        if changed {
            tracing::info!(
                "Probe status: {} (IPv4: {}, IPv6: {})",
                new_state.status.as_str(),
                new_state.ipv4,
                new_state.ipv6
            );
            self.emit_all();
        }
    }

    /// Periodic re-test loop; exits once SIGTERM lands.
    pub fn spawn_scheduler(
        self: Arc<Self>,
        command_timeout: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let manager = self;
        tokio::spawn(async move {
            loop {
                manager.run_self_test(command_timeout).await;
                tokio::time::sleep(STATUS_INTERVAL).await;
                if manager.current() == ProbeStatus::Sigterm {
                    break;
                }
            }
        })
    }
}

/// At least 2 of the 3 targets must answer every packet.
async fn family_supported(family_flag: &str, command_timeout: Duration) -> bool {
    let mut passed = 0;
    for target in STATUS_TARGETS {
        if ping_test(target, family_flag, command_timeout).await {
            passed += 1;
        }
    }
    passed >= 2
}

async fn ping_test(target: &str, family_flag: &str, command_timeout: Duration) -> bool {
    let argv = runner::with_unbuffer(vec![
        "ping".to_string(),
        family_flag.to_string(),
        "-O".to_string(),
        "-c".to_string(),
        TEST_PACKETS.to_string(),
        "-i".to_string(),
        "0.5".to_string(),
        "-w".to_string(),
        "10".to_string(),
        target.to_string(),
    ]);
    let mut accumulated = String::new();
    let outcome = runner::run_tool(&argv, command_timeout, |line| {
        accumulated.push_str(line);
        accumulated.push('\n');
        LineAction::Continue
    })
    .await;
    if outcome.is_err() {
        return false;
    }
    let parsed = parsers::ping::parse(&accumulated);
    matches!(parsed.stats.rcv, Some(rcv) if rcv > 0) && parsed.stats.loss == Some(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn manager() -> (Arc<StatusManager>, mpsc::UnboundedReceiver<WireEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(StatusManager::new(tx)), rx)
    }

    #[test]
    fn starts_initializing() {
        let (manager, _rx) = manager();
        assert_eq!(manager.current(), ProbeStatus::Initializing);
    }

    #[test]
    fn emit_all_sends_status_and_both_families() {
        let (manager, mut rx) = manager();
        manager.emit_all();
        let status = rx.try_recv().unwrap();
        assert_eq!(status.name, EV_STATUS_UPDATE);
        assert_eq!(status.payload, json!("initializing"));
        assert_eq!(rx.try_recv().unwrap().name, EV_IPV4_UPDATE);
        assert_eq!(rx.try_recv().unwrap().name, EV_IPV6_UPDATE);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn sigterm_is_terminal_and_announced() {
        let (manager, mut rx) = manager();
        manager.set_sigterm();
        assert_eq!(manager.current(), ProbeStatus::Sigterm);
        assert_eq!(rx.try_recv().unwrap().payload, json!("sigterm"));
    }

    #[tokio::test]
    async fn self_test_respects_sigterm() {
        let (manager, mut rx) = manager();
        manager.set_sigterm();
        while rx.try_recv().is_ok() {}
        manager.run_self_test(Duration::from_secs(1)).await;
        assert_eq!(manager.current(), ProbeStatus::Sigterm);
        assert!(rx.try_recv().is_err(), "no re-announcement after sigterm");
    }
}
