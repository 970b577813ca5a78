//! Chat with the peers of the local network from a terminal.
//!
//! Lines typed on stdin are commands:
//!
//! ```text
//! /peers                      list online peers
//! /groups                     list joined groups
//! /msg <peer> <text>          send a direct message, by peer id or name
//! /history <peer>             show the messages exchanged with a peer
//! /group <name> <peer>...     create a group and invite peers
//! /gmsg <group> <text>        send a message to a group, by id or name
//! /leave <group>              leave a group
//! /quit                       say bye and exit
//! ```

use clap::Parser;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use lanchat::{
    config::MESSAGE_HISTORY_LIMIT, ChatError, ChatNode, CliArgs, MemoryStore, NodeUpdate,
};

fn print_update(update: &NodeUpdate) {
    match update {
        NodeUpdate::PeerOnline(peer) => {
            println!("* {} ({}) is online at {}.", peer.display_name, peer.peer_id, peer.ip)
        }
        NodeUpdate::PeerOffline(peer) => println!("* {} went offline.", peer.display_name),
        NodeUpdate::PeerRemoved(peer) => println!("* {} is gone.", peer.display_name),
        NodeUpdate::DirectMessage(message) => {
            println!("[{}] {}", message.from_name, message.body)
        }
        NodeUpdate::GroupMessage(message) => println!(
            "[{}@{}] {}",
            message.from_name,
            message.group_id.as_deref().unwrap_or_default(),
            message.body
        ),
        NodeUpdate::GroupJoined(group) => println!(
            "* Joined group {} ({}) on {}.",
            group.name,
            group.group_id,
            group.multicast_addr()
        ),
        NodeUpdate::InviteIgnored(_) => {}
        NodeUpdate::Broadcast(payload) => println!("* Broadcast: {payload}"),
    }
}

/// Run one command line; returns `false` to quit.
async fn run_command(node: &ChatNode, line: &str) -> bool {
    let line = line.trim();
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();

    let result: Result<(), ChatError> = async {
        match command {
            "" => {}
            "/quit" | "/exit" => return Ok(()),
            "/peers" => {
                let peers = node.peers().await;
                if peers.is_empty() {
                    println!("No peers online.");
                }
                for peer in peers {
                    println!(
                        "  {:<20} {} at {}:{}",
                        peer.display_name, peer.peer_id, peer.ip, peer.tcp_port
                    );
                }
            }
            "/groups" => {
                for group in node.groups().await {
                    println!(
                        "  {:<20} {} on {} ({} members)",
                        group.name,
                        group.group_id,
                        group.multicast_addr(),
                        group.member_ids.len()
                    );
                }
            }
            "/msg" => {
                let (peer, text) = rest.split_once(' ').unwrap_or((rest, ""));
                node.send_text(peer, text.trim()).await?;
            }
            "/history" => {
                let peer = node
                    .registry()
                    .resolve(rest)
                    .await
                    .ok_or_else(|| ChatError::UnknownPeer(rest.to_owned()))?;
                for message in node.history(&peer.peer_id, MESSAGE_HISTORY_LIMIT).await? {
                    println!("  [{}] {}", message.from_name, message.body);
                }
                node.mark_read(&peer.peer_id).await?;
            }
            "/group" => {
                let mut words = rest.split_whitespace();
                let name = words.next().unwrap_or_default();

                let mut members = Vec::new();
                for key in words {
                    let peer = node
                        .registry()
                        .resolve(key)
                        .await
                        .ok_or_else(|| ChatError::UnknownPeer(key.to_owned()))?;
                    members.push(peer.peer_id);
                }

                let created = node.create_group(name, members).await?;
                println!(
                    "* Created group {} ({}) on {}.",
                    created.descriptor.name,
                    created.descriptor.group_id,
                    created.descriptor.multicast_addr()
                );
                if created.invite.is_none() {
                    println!("* The invite could not be sent.");
                }
            }
            "/gmsg" => {
                let (key, text) = rest.split_once(' ').unwrap_or((rest, ""));
                let group = node
                    .resolve_group(key)
                    .await
                    .ok_or_else(|| ChatError::UnknownGroup(key.to_owned()))?;
                node.send_group_text(&group.group_id, text.trim()).await?;
            }
            "/leave" => {
                let group = node
                    .resolve_group(rest)
                    .await
                    .ok_or_else(|| ChatError::UnknownGroup(rest.to_owned()))?;
                node.leave_group(&group.group_id).await?;
                println!("* Left group {}.", group.name);
            }
            other => println!("Unknown command {other}."),
        }
        Ok(())
    }
    .await;

    if let Err(err) = result {
        println!("! {err}");
    }

    !matches!(command, "/quit" | "/exit")
}

#[tokio::main]
async fn main() -> Result<(), ChatError> {
    let args = CliArgs::parse();
    let config = args.node_config()?;

    let host_name = hostname::get()?.to_string_lossy().into_owned();
    let ip = local_ip_address::local_ip()
        .map_err(|err| ChatError::InvalidConfig(format!("no local IP address: {err}")))?;

    let node = Arc::new(ChatNode::new(
        config,
        args.name.as_deref().unwrap_or_default(),
        &host_name,
        &ip.to_string(),
        Arc::new(MemoryStore::new()),
    )?);
    node.start().await?;

    let local = node.local().await;
    println!(
        "{} ({}) listening on {}:{}. Type /quit to exit.",
        local.display_name, local.peer_id, local.ip, local.tcp_port
    );

    let updates = {
        let node = Arc::clone(&node);
        tokio::spawn(async move {
            loop {
                print_update(&node.next_update().await);
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("SIGINT received, gracefully shutting down.");
                break Ok(());
            },
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !run_command(&node, &line).await {
                        break Ok(());
                    }
                }
                Ok(None) => break Ok(()),
                Err(err) => break Err(ChatError::Io(err)),
            },
        }
    };

    updates.abort();
    node.shutdown().await;
    result
}
