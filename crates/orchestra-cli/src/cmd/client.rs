//! Client commands: `watch`, `send`, `directory`.

use super::{ctrl_c, describe};
use crate::cli::SendCommands;
use anyhow::Context;
use futures::StreamExt;
use orchestra_types::message::{
    ChangeKind, LogMessage, MessageKind, Ping, ReloadRequest, ShutdownRequest,
};
use orchestra_types::{ClientRole, OrchestrationConfig};
use orchestra_wire::{ConnectionDirectory, OrchestrationClient, OrchestrationHandle};

async fn connect(config: &OrchestrationConfig, role: ClientRole) -> anyhow::Result<OrchestrationClient> {
    anyhow::ensure!(
        config.port != 0,
        "no server port: pass --port or set {}",
        orchestra_wire::config::PORT_ENV
    );
    OrchestrationClient::connect(config, role)
        .await
        .with_context(|| format!("failed to connect to {}", config.socket_addr()))
}

pub async fn watch(config: OrchestrationConfig, role: ClientRole) -> anyhow::Result<()> {
    let client = connect(&config, role).await?;
    println!("connected to {} as {role}", config.socket_addr());

    let mut inbox = client.subscribe();
    let interrupted = ctrl_c();
    tokio::pin!(interrupted);
    loop {
        tokio::select! {
            _ = &mut interrupted => break,
            message = inbox.next() => match message {
                Some(message) => println!("{}", describe(&message)),
                None => {
                    println!("server closed the connection");
                    break;
                }
            },
        }
    }

    client.close().await;
    Ok(())
}

pub fn build_message(message: SendCommands) -> MessageKind {
    match message {
        SendCommands::Ping => Ping.into(),
        SendCommands::Shutdown { reason } => ShutdownRequest { reason }.into(),
        SendCommands::Log {
            message,
            tag,
            level,
        } => LogMessage {
            tag,
            level: level.into(),
            message,
        }
        .into(),
        SendCommands::Reload { files } => ReloadRequest {
            changed_files: files
                .into_iter()
                .map(|file| (file, ChangeKind::Modified))
                .collect(),
        }
        .into(),
    }
}

pub async fn send(
    config: OrchestrationConfig,
    role: ClientRole,
    message: SendCommands,
) -> anyhow::Result<()> {
    let client = connect(&config, role).await?;
    let kind = build_message(message);
    let classifier = kind.classifier();
    let id = client.send(kind).await.context("send failed")?;
    println!("sent {classifier} {id}");
    client.close().await;
    Ok(())
}

fn print_directory(directory: &ConnectionDirectory) {
    println!("{} client(s) connected", directory.len());
    for entry in directory.iter() {
        println!(
            "  {} {} (pid {})",
            entry.client_id, entry.client_role, entry.client_pid
        );
    }
}

pub async fn directory(config: OrchestrationConfig, follow: bool) -> anyhow::Result<()> {
    let client = connect(&config, ClientRole::Tooling).await?;
    let mut cell = client.connections().await?;

    // The mirror reads empty until the server's first value arrives.
    let first = match tokio::time::timeout(config.handshake_timeout(), cell.changed()).await {
        Ok(value) => value?,
        Err(_) => cell.value(),
    };
    print_directory(&first);

    if follow {
        let interrupted = ctrl_c();
        tokio::pin!(interrupted);
        loop {
            tokio::select! {
                _ = &mut interrupted => break,
                changed = cell.changed() => match changed {
                    Ok(directory) => print_directory(&directory),
                    Err(_) => break,
                },
            }
        }
    }

    client.close().await;
    Ok(())
}
