//! Diagnostic fakes, controlled by environment variables.
//!
//! `FAKE_COMMANDS=1` replaces every external tool invocation with a canned
//! transcript so a probe can run hermetically (CI containers, demo rigs).
//! `FAKE_IP_FIRST_OCTET=<n>` makes the handshake advertise a generated
//! address instead of whatever the coordinator would geolocate.

use rand::Rng;

pub fn fake_commands_enabled() -> bool {
    matches!(
        std::env::var("FAKE_COMMANDS").as_deref(),
        Ok("1") | Ok("true")
    )
}

/// Canned output for the tool named by `argv`, when fakes are enabled.
/// `unbuffer` prefixes are transparent.
pub fn canned_output(argv: &[String]) -> Option<&'static str> {
    if !fake_commands_enabled() {
        return None;
    }
    let tool = argv
        .iter()
        .map(String::as_str)
        .find(|part| *part != "unbuffer")?;
    match tool {
        "ping" => Some(FAKE_PING),
        "traceroute" => Some(FAKE_TRACEROUTE),
        "mtr" => Some(FAKE_MTR),
        "dig" => Some(FAKE_DIG),
        _ => None,
    }
}

/// Diagnostic fake IP for the connect handshake, seeded by
/// `FAKE_IP_FIRST_OCTET`.
pub fn fake_ip() -> Option<String> {
    let first: u8 = std::env::var("FAKE_IP_FIRST_OCTET").ok()?.parse().ok()?;
    let mut rng = rand::thread_rng();
    Some(format!(
        "{}.{}.{}.{}",
        first,
        rng.gen_range(0..=255),
        rng.gen_range(0..=255),
        rng.gen_range(1..=254)
    ))
}

const FAKE_PING: &str = "\
PING fake.example (93.184.216.34) 56(84) bytes of data.
64 bytes from fake.example (93.184.216.34): icmp_seq=1 ttl=60 time=10.0 ms
64 bytes from fake.example (93.184.216.34): icmp_seq=2 ttl=60 time=10.2 ms
64 bytes from fake.example (93.184.216.34): icmp_seq=3 ttl=60 time=10.4 ms

--- fake.example ping statistics ---
3 packets transmitted, 3 received, 0% packet loss, time 2002ms
rtt min/avg/max/mdev = 10.000/10.200/10.400/0.163 ms
";

const FAKE_TRACEROUTE: &str = "\
traceroute to fake.example (93.184.216.34), 20 hops max, 60 byte packets
 1  gw.fake (203.0.114.1)  0.400 ms  0.380 ms
 2  core.fake (203.0.114.9)  1.212 ms  1.190 ms
 3  fake.example (93.184.216.34)  9.801 ms  9.750 ms
";

const FAKE_MTR: &str = "\
h 0 203.0.114.1
d 0 gw.fake
x 0 1
p 0 1 400
h 1 93.184.216.34
d 1 fake.example
x 1 1
p 1 1 9800
x 0 2
p 0 2 420
x 1 2
p 1 2 9750
";

const FAKE_DIG: &str = "\
; <<>> DiG 9.16.1 <<>> fake.example
;; Got answer:
;; ->>HEADER<<- opcode: QUERY, status: NOERROR, id: 7
;; flags: qr rd ra; QUERY: 1, ANSWER: 1, AUTHORITY: 0, ADDITIONAL: 1

;; ANSWER SECTION:
fake.example.\t\t300\tIN\tA\t93.184.216.34

;; Query time: 10 msec
;; SERVER: 127.0.0.53#53(127.0.0.53)
;; WHEN: Mon Jul 20 12:00:00 UTC 2026
;; MSG SIZE  rcvd: 57
";
