//! Console transport - `<caller_id> <command>` lines on stdin

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::command::parse_user;
use super::dispatch::Dispatcher;
use crate::core::LifecycleEvent;

pub struct Console {
    dispatcher: Arc<Dispatcher>,
}

impl Console {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Read commands until stdin closes or `shutdown` fires. Each command
    /// runs as its own task, so a slow runtime call does not hold up the
    /// next line.
    pub async fn run(self, mut shutdown: watch::Receiver<()>) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        info!("Console ready, enter commands as `<user_id> .<command>`");

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line.context("Failed to read from stdin")? {
                        Some(line) => self.dispatch_line(&line),
                        None => {
                            info!("stdin closed");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    debug!("Console shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    fn dispatch_line(&self, line: &str) {
        let Some((caller, command)) = split_caller(line) else {
            if !line.trim().is_empty() {
                println!("usage: <user_id> .<command> [args]");
            }
            return;
        };
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            for reply in dispatcher.handle(&caller, &command).await {
                println!("{}\n", reply);
            }
        });
    }
}

/// Split a console line into caller id and command text
fn split_caller(line: &str) -> Option<(String, String)> {
    let (caller, command) = line.trim().split_once(char::is_whitespace)?;
    let caller = parse_user(caller);
    let command = command.trim();
    if caller.is_empty() || command.is_empty() {
        return None;
    }
    Some((caller, command.to_string()))
}

/// Log lifecycle events; a chat transport would act on `OwnerEmptied` by
/// revoking the owner's customer role
pub fn spawn_event_log(mut events: broadcast::Receiver<LifecycleEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(LifecycleEvent::Provisioned {
                    owner_id,
                    container_name,
                }) => info!("Event: {} provisioned for {}", container_name, owner_id),
                Ok(LifecycleEvent::Deleted {
                    owner_id,
                    container_name,
                }) => info!("Event: {} of {} deleted", container_name, owner_id),
                Ok(LifecycleEvent::OwnerEmptied { owner_id }) => {
                    info!("Event: {} has no VPS left, membership revoked", owner_id)
                }
                Ok(LifecycleEvent::EmergencyStop { stopped }) => {
                    warn!("Event: emergency stop, {} VPS stopped", stopped)
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event log lagged, {} events skipped", skipped)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
