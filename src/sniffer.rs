//! Protocol sniffer: prints every datagram seen on the patch network

use anyhow::Result;
use colored::*;
use std::net::SocketAddr;
use std::time::Instant;

use patch_surface::config::{JackDirection, NetworkConfig};
use patch_surface::protocol::{Envelope, MessageBody};
use patch_surface::transport::udp::join_group;

/// Colour a message kind by what it does to the patch
fn kind_label(body: &MessageBody) -> ColoredString {
    let kind = format!("{:<13}", body.kind());
    match body {
        MessageBody::Request { .. } => kind.yellow(),
        MessageBody::Complete { .. } => kind.green(),
        MessageBody::Clear { .. } | MessageBody::Cancel { .. } => kind.dimmed(),
        MessageBody::Disconnect { .. } => kind.red(),
        MessageBody::Identify { .. } => kind.cyan(),
        MessageBody::StateInquiry | MessageBody::StateReport { .. } | MessageBody::Restore { .. } => {
            kind.magenta()
        }
        MessageBody::CapabilitiesInquiry | MessageBody::Capabilities { .. } => kind.blue(),
    }
}

fn format_datagram(elapsed_ms: u128, from: SocketAddr, data: &[u8]) -> String {
    let stamp = format!("[{:>8}]", elapsed_ms).dimmed();
    match Envelope::decode(data) {
        Ok(envelope) => format!(
            "{} {:<21} U{:<4} {} {}",
            stamp,
            from,
            envelope.unit,
            kind_label(&envelope.body),
            describe(&envelope.body)
        ),
        Err(e) => format!(
            "{} {:<21} {} {} | {}",
            stamp,
            from,
            "???".red().bold(),
            e,
            hex::encode(data).dimmed()
        ),
    }
}

fn describe(body: &MessageBody) -> String {
    match body {
        MessageBody::Request { source, signal } => format!("{} ({:?})", source, signal),
        MessageBody::Complete { source, dest, scale } => format!("{} -> {} x{}", source, dest, scale),
        MessageBody::Clear { source }
        | MessageBody::Cancel { source }
        | MessageBody::Identify { source } => source.to_string(),
        MessageBody::Disconnect { dest } => format!("-> {}", dest),
        MessageBody::StateInquiry | MessageBody::CapabilitiesInquiry => String::new(),
        MessageBody::StateReport { connections, controls } => {
            format!("{} connections, {} knob values", connections.len(), controls.len())
        }
        MessageBody::Restore {
            target,
            connections,
            controls,
        } => format!(
            "{} connections, {} knob values for {}",
            connections.len(),
            controls.len(),
            target.map_or_else(|| "all units".to_string(), |t| format!("U{}", t))
        ),
        MessageBody::Capabilities { name, jacks } => {
            let inputs = jacks.iter().filter(|j| j.direction == JackDirection::Input).count();
            format!("'{}' {} inputs, {} outputs", name, inputs, jacks.len() - inputs)
        }
    }
}

pub async fn run_cli_sniffer(network: &NetworkConfig) -> Result<()> {
    let (socket, group) = join_group(network).await?;

    println!("{}", "=== Patch Network Sniffer ===".bold().cyan());
    println!("Listening on {}:{}, press Ctrl+C to exit\n", group, network.port);
    println!("{}", "Format: [ms] FROM UNIT KIND DETAIL".dimmed());
    println!("{}\n", "─".repeat(80).dimmed());

    let start = Instant::now();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (len, from) = received?;
                println!("{}", format_datagram(start.elapsed().as_millis(), from, &buf[..len]));
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\n{}", "Sniffer stopped".dimmed());
                return Ok(());
            }
        }
    }
}
