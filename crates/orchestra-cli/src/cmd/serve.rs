//! `orchestra serve`

use super::{ctrl_c, describe};
use anyhow::Context;
use orchestra_types::OrchestrationConfig;
use orchestra_wire::{OrchestrationHandle, OrchestrationServer};

pub async fn run(config: OrchestrationConfig) -> anyhow::Result<()> {
    let server = OrchestrationServer::start(config)
        .await
        .context("failed to start server")?;
    println!("orchestra server listening on {}", server.local_addr());

    let mut inbox = server.subscribe();
    let mut directory = server.connections().await?;
    let interrupted = ctrl_c();
    tokio::pin!(interrupted);

    loop {
        tokio::select! {
            _ = &mut interrupted => break,
            message = inbox.recv() => match message {
                Some(message) => println!("{}", describe(&message)),
                None => break,
            },
            changed = directory.changed() => match changed {
                Ok(directory) => {
                    println!("{} client(s) connected", directory.len());
                    for entry in directory.iter() {
                        println!("  {} {} (pid {})", entry.client_id, entry.client_role, entry.client_pid);
                    }
                }
                Err(_) => break,
            },
        }
    }

    server.close().await;
    println!("server stopped");
    Ok(())
}
