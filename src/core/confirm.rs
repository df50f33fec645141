//! Two-step confirmation for destructive actions

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info};
use uuid::Uuid;

use super::error::{VpsError, VpsResult};

/// Action waiting for confirmation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingAction {
    /// Wipe and recreate one container
    Reinstall {
        owner_id: String,
        container_name: String,
    },
    /// Force-stop every container on the host
    StopAll,
}

impl PendingAction {
    pub fn label(&self) -> String {
        match self {
            Self::Reinstall { container_name, .. } => format!("reinstall {}", container_name),
            Self::StopAll => "stop all containers".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct Pending {
    action: PendingAction,
    issued_to: String,
    expires_at: Instant,
}

/// Outstanding confirmation tokens.
///
/// A token is bound to the caller it was issued to, can be redeemed once,
/// and lapses after the configured lifetime.
pub struct ConfirmationBook {
    ttl: Duration,
    pending: Mutex<HashMap<Uuid, Pending>>,
}

impl ConfirmationBook {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a token for `action` on behalf of `caller`
    pub fn issue(&self, caller: &str, action: PendingAction) -> Uuid {
        let token = Uuid::new_v4();
        let now = Instant::now();
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|_, p| p.expires_at > now);
        info!("Confirmation {} issued to {} for {}", token, caller, action.label());
        pending.insert(
            token,
            Pending {
                action,
                issued_to: caller.to_string(),
                expires_at: now + self.ttl,
            },
        );
        token
    }

    /// Consume a token and hand back the action it authorizes
    pub fn redeem(&self, caller: &str, token: Uuid) -> VpsResult<PendingAction> {
        let action = self.take(caller, token)?;
        debug!("Confirmation {} redeemed by {}", token, caller);
        Ok(action)
    }

    /// Withdraw a token without acting on it
    pub fn cancel(&self, caller: &str, token: Uuid) -> VpsResult<PendingAction> {
        let action = self.take(caller, token)?;
        info!("Confirmation {} cancelled by {}", token, caller);
        Ok(action)
    }

    pub fn outstanding(&self) -> usize {
        let now = Instant::now();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|p| p.expires_at > now)
            .count()
    }

    fn take(&self, caller: &str, token: Uuid) -> VpsResult<PendingAction> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = pending
            .get(&token)
            .ok_or_else(|| VpsError::Confirmation("unknown or already used token".to_string()))?;
        if entry.issued_to != caller {
            return Err(VpsError::AccessDenied(
                "this confirmation belongs to another user".to_string(),
            ));
        }
        let entry = pending
            .remove(&token)
            .ok_or_else(|| VpsError::Confirmation("unknown or already used token".to_string()))?;
        if entry.expires_at <= Instant::now() {
            return Err(VpsError::Confirmation("token expired".to_string()));
        }
        Ok(entry.action)
    }
}

/// Parse a token typed by a user
pub fn parse_token(text: &str) -> VpsResult<Uuid> {
    Uuid::parse_str(text.trim())
        .map_err(|_| VpsError::Confirmation(format!("'{}' is not a valid token", text.trim())))
}
