//! `orchestra listen`

use super::{ctrl_c, describe};
use anyhow::Context;
use futures::StreamExt;
use orchestra_types::OrchestrationConfig;
use orchestra_wire::{OrchestrationClient, OrchestrationHandle, OrchestrationListener};

pub async fn run(config: OrchestrationConfig) -> anyhow::Result<()> {
    let listener = OrchestrationListener::bind(&config)
        .await
        .context("failed to bind listener")?;
    println!("orchestra listener on {}", listener.local_addr());

    let interrupted = ctrl_c();
    tokio::pin!(interrupted);
    loop {
        tokio::select! {
            _ = &mut interrupted => break,
            accepted = listener.accept() => match accepted {
                Some(peer) => {
                    tokio::spawn(print_peer(peer));
                }
                None => break,
            },
        }
    }

    listener.close();
    Ok(())
}

async fn print_peer(peer: OrchestrationClient) {
    let remote = peer.connection().remote().to_string();
    println!("[{remote}] connected");
    let mut inbox = peer.subscribe();
    while let Some(message) = inbox.next().await {
        println!("[{remote}] {}", describe(&message));
    }
    println!("[{remote}] disconnected");
}
