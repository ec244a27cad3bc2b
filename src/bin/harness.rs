//! Line-oriented stdio test harness (§6.4, §13).
//!
//! Reads commands from stdin and writes results to stdout, one line per
//! event, so external test drivers can script a node's behavior without
//! a real socket. Backed entirely by [`LoopbackSubstrate`] — the
//! datagram substrate is out of scope for this crate, so "sending" here
//! just means printing the bytes for whatever harness script plays
//! postman between processes.
//!
//! Commands (read from stdin):
//! - `INPUT:<b64>` / `RECV:<b64>` — inject bytes as if received from the
//!   substrate.
//! - `CONNECT:<name>` — start the join protocol using `<name>` as the
//!   local display name (sent the first time this line appears).
//! - `SEND:<stream_id>:<b64>` — submit a payload for transmission.
//! - `TICK` — drive the timer scheduler forward one step.
//! - `DISCONNECT` — begin graceful shutdown.
//!
//! Output (written to stdout):
//! - `SEND:<b64>` — a datagram the core wants emitted.
//! - `OUTPUT:<sender>:<b64>` — an upward delivery.
//! - `NEWNODES: a b c` / `LOSTNODES: a b c` — membership deltas since
//!   the last line.
//! - `FAIL:<name>` — a sender transitioned to a failed state.
//! - `CONNECTED:` / `DISCONNECTED:` — local lifecycle transitions.

use base64::Engine;
use causalcast::config::TransportConfig;
use causalcast::substrate::test_support::LoopbackSubstrate;
use causalcast::transport::{CausalTransport, TransportEvent};
use std::io::{self, BufRead, Write};

fn b64_decode(s: &str) -> Option<Vec<u8>> {
    base64::engine::general_purpose::STANDARD.decode(s).ok()
}

fn b64_encode(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn flush_outbound(node: &mut CausalTransport<LoopbackSubstrate>, out: &mut impl Write) {
    for bytes in node.substrate_mut().outbound.drain(..) {
        writeln!(out, "SEND:{}", b64_encode(&bytes)).ok();
    }
}

fn flush_events(node: &mut CausalTransport<LoopbackSubstrate>, out: &mut impl Write) {
    let mut new_nodes = Vec::new();
    let mut lost_nodes = Vec::new();

    for event in node.drain_events() {
        match event {
            TransportEvent::Connected => {
                writeln!(out, "CONNECTED:").ok();
            }
            TransportEvent::Disconnected => {
                writeln!(out, "DISCONNECTED:").ok();
            }
            TransportEvent::NewSender { id, name } => {
                new_nodes.push(name.unwrap_or_else(|| id.to_string()));
            }
            TransportEvent::LostSender { id, name } => {
                lost_nodes.push(name.unwrap_or_else(|| id.to_string()));
            }
            TransportEvent::SenderFailed { id } => {
                let name = node.group_name(id).map(str::to_owned).unwrap_or_else(|| id.to_string());
                writeln!(out, "FAIL:{name}").ok();
            }
            TransportEvent::Received {
                from, bytes, ..
            } => {
                let name = node.group_name(from).map(str::to_owned).unwrap_or_else(|| from.to_string());
                writeln!(out, "OUTPUT:{name}:{}", b64_encode(&bytes)).ok();
            }
        }
    }

    if !new_nodes.is_empty() {
        writeln!(out, "NEWNODES: {}", new_nodes.join(" ")).ok();
    }
    if !lost_nodes.is_empty() {
        writeln!(out, "LOSTNODES: {}", lost_nodes.join(" ")).ok();
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mtu = std::env::var("CAUSALCAST_MTU")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1200usize);

    let mut node: Option<CausalTransport<LoopbackSubstrate>> = None;

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("CONNECT:") {
            let mut t = CausalTransport::new(
                LoopbackSubstrate::new(mtu),
                rest,
                TransportConfig::default(),
            );
            t.connect().ok();
            node = Some(t);
        } else if let Some(rest) = line.strip_prefix("INPUT:").or_else(|| line.strip_prefix("RECV:")) {
            if let (Some(node), Some(bytes)) = (node.as_mut(), b64_decode(rest)) {
                node.on_datagram(&bytes);
            }
        } else if let Some(rest) = line.strip_prefix("SEND:") {
            if let Some(node) = node.as_mut() {
                if let Some((stream_id, payload)) = rest.split_once(':') {
                    if let (Ok(stream_id), Some(bytes)) =
                        (stream_id.parse::<u16>(), b64_decode(payload))
                    {
                        node.send(stream_id, &bytes).ok();
                    }
                }
            }
        } else if line == "TICK" {
            if let Some(node) = node.as_mut() {
                node.poll_timers();
            }
        } else if line == "DISCONNECT" {
            if let Some(node) = node.as_mut() {
                node.disconnect().ok();
            }
        }

        if let Some(node) = node.as_mut() {
            flush_events(node, &mut stdout);
            flush_outbound(node, &mut stdout);
            stdout.flush().ok();
        }
    }
}
