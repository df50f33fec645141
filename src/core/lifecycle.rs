//! VPS lifecycle manager - Provisioning, resizing, reinstalling and sharing containers

use std::sync::Arc;

use chrono::Local;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::catalog::{self, Quote};
use super::confirm::{ConfirmationBook, PendingAction};
use super::error::{RuntimeError, VpsError, VpsResult};
use super::record::{ContainerRecord, ContainerStatus};
use super::resource::{gb_to_mb, Dimension, ResizeRequest, ResourceSpec};
use super::runtime::{
    grow_disk, parse_snapshot_names, CommandOutput, ContainerRuntime, DiskGrowth, LimitKey,
    RuntimeRequest,
};
use super::settings::{Provisioning, DEFAULT_PRIMARY_ADMIN_ID};
use crate::persistence::{CreditChange, Store};

const EVENT_CAPACITY: usize = 64;

/// Notifications for the command surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Provisioned {
        owner_id: String,
        container_name: String,
    },
    Deleted {
        owner_id: String,
        container_name: String,
    },
    /// The owner's last container is gone; revoke any membership marker
    OwnerEmptied { owner_id: String },
    EmergencyStop { stopped: usize },
}

/// A container that was launched and recorded
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub record: ContainerRecord,
    pub disk: DiskGrowth,
}

/// A paid provisioning
#[derive(Debug, Clone)]
pub struct Purchase {
    pub provisioned: Provisioned,
    pub quote: Quote,
    /// Balance left after the debit
    pub balance: u64,
}

/// Per-dimension results of a resize
#[derive(Debug, Clone)]
pub struct ResizeReport {
    pub container_name: String,
    pub outcomes: Vec<(Dimension, u32, VpsResult<()>)>,
    pub disk_warnings: Vec<String>,
    /// Record as stored after the resize
    pub record: ContainerRecord,
}

impl ResizeReport {
    pub fn applied(&self) -> impl Iterator<Item = (Dimension, u32)> + '_ {
        self.outcomes
            .iter()
            .filter(|(_, _, r)| r.is_ok())
            .map(|(d, v, _)| (*d, *v))
    }

    pub fn failures(&self) -> impl Iterator<Item = (Dimension, &VpsError)> + '_ {
        self.outcomes
            .iter()
            .filter_map(|(d, _, r)| r.as_ref().err().map(|e| (*d, e)))
    }

    pub fn is_complete(&self) -> bool {
        self.outcomes.iter().all(|(_, _, r)| r.is_ok())
    }
}

/// A temporary tmate session inside a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshSession {
    pub session_name: String,
    /// SSH command line reported by tmate
    pub connection: String,
    /// Whether tmate had to be installed first
    pub installed: bool,
}

/// Result of redeeming a confirmation token
#[derive(Debug, Clone)]
pub enum Confirmed {
    Reinstalled(Provisioned),
    StoppedAll(usize),
}

/// Per-user totals
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserSummary {
    pub user_id: String,
    pub credits: u64,
    pub is_admin: bool,
    pub total: usize,
    pub running: usize,
    pub stopped: usize,
    pub ram_gb: u64,
    pub cpu_cores: u64,
    pub storage_gb: u64,
}

/// Host-wide totals
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FleetStats {
    pub users: usize,
    pub total: usize,
    pub running: usize,
    pub stopped: usize,
    pub ram_gb: u64,
    pub cpu_cores: u64,
    pub storage_gb: u64,
    pub credits: u64,
    pub admins: usize,
}

/// Owns container lifecycles.
///
/// Every operation sequences its runtime calls first and touches the store
/// afterwards; records are looked up again by name after each `.await`, so a
/// concurrent delete shows up as `NotFound` rather than a stale write.
pub struct VpsManager {
    store: Arc<Store>,
    runtime: Arc<dyn ContainerRuntime>,
    provisioning: Provisioning,
    confirmations: ConfirmationBook,
    primary_admin_id: String,
    events: broadcast::Sender<LifecycleEvent>,
}

impl VpsManager {
    pub fn new(store: Arc<Store>, runtime: Arc<dyn ContainerRuntime>, provisioning: Provisioning) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            runtime,
            confirmations: ConfirmationBook::new(provisioning.confirmation_ttl),
            provisioning,
            primary_admin_id: DEFAULT_PRIMARY_ADMIN_ID.to_string(),
            events,
        }
    }

    pub fn with_primary_admin(mut self, user_id: impl Into<String>) -> Self {
        self.primary_admin_id = user_id.into();
        self
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn provisioning(&self) -> &Provisioning {
        &self.provisioning
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    // === Provisioning ===

    /// Launch a container with explicit resources and record it.
    ///
    /// Nothing is stored unless launch and disk sizing both succeed. A
    /// container left behind by a failed sizing step is not removed.
    pub async fn create(
        &self,
        owner_id: &str,
        spec: ResourceSpec,
        pool: Option<&str>,
    ) -> VpsResult<Provisioned> {
        spec.validate()?;
        self.provision(owner_id, spec, pool, None).await
    }

    /// Buy a plan with credits. The price is debited before provisioning
    /// and refunded if provisioning fails.
    pub async fn purchase(
        &self,
        owner_id: &str,
        plan: &str,
        processor: &str,
        storage_override: Option<u32>,
    ) -> VpsResult<Purchase> {
        let quote = catalog::quote(plan, processor)?;
        let spec = ResourceSpec::new(quote.spec.ram_gb, quote.spec.cpu_cores, quote.spec.storage_gb_default)
            .with_storage(storage_override.unwrap_or(quote.spec.storage_gb_default));
        spec.validate()?;

        let balance = self.store.debit(owner_id, quote.price)?;
        info!(
            "Debited {} credits from {} for {} ({})",
            quote.price, owner_id, quote.plan, quote.processor
        );

        match self.provision(owner_id, spec, None, Some(quote)).await {
            Ok(provisioned) => Ok(Purchase {
                provisioned,
                quote,
                balance,
            }),
            Err(e) => {
                warn!("Provisioning for {} failed, refunding {} credits: {}", owner_id, quote.price, e);
                self.store.refund(owner_id, quote.price)?;
                Err(e)
            }
        }
    }

    async fn provision(
        &self,
        owner_id: &str,
        spec: ResourceSpec,
        pool: Option<&str>,
        quote: Option<Quote>,
    ) -> VpsResult<Provisioned> {
        let name = self.store.next_container_name(owner_id);
        let pool = pool.unwrap_or(&self.provisioning.storage_pool);
        info!("Provisioning {} for {} ({}) on {}", name, owner_id, spec, pool);

        self.launch(&name, spec, pool).await?;
        let disk = grow_disk(
            self.runtime.as_ref(),
            &name,
            spec.storage_gb,
            &self.provisioning.timeouts,
        )
        .await?;

        let mut record = ContainerRecord::new(name.clone(), owner_id, spec);
        if let Some(quote) = quote {
            record = record.with_plan(quote.plan, quote.processor);
        }
        self.store.append(record.clone())?;

        info!("Container {} provisioned for {}", name, owner_id);
        self.emit(LifecycleEvent::Provisioned {
            owner_id: owner_id.to_string(),
            container_name: name,
        });
        Ok(Provisioned { record, disk })
    }

    async fn launch(&self, name: &str, spec: ResourceSpec, pool: &str) -> VpsResult<()> {
        let request = RuntimeRequest::Launch {
            image: self.provisioning.image.clone(),
            name: name.to_string(),
            memory_mb: spec.memory_mb(),
            cpu_cores: spec.cpu_cores,
            pool: pool.to_string(),
        };
        self.runtime
            .run(&request, self.provisioning.timeouts.default)
            .await?;
        Ok(())
    }

    // === Resizing ===

    /// Apply each requested dimension on its own, in RAM, CPU, storage order.
    ///
    /// A dimension's field is stored as soon as its runtime call succeeds;
    /// later failures do not undo earlier dimensions. When every requested
    /// dimension fails the first error is returned.
    pub async fn resize(&self, name: &str, request: ResizeRequest) -> VpsResult<ResizeReport> {
        request.validate()?;
        let mut record = self.require(name)?;

        let mut outcomes = Vec::new();
        let mut disk_warnings = Vec::new();
        for (dimension, value) in request.dimensions() {
            let result = self
                .resize_dimension(name, dimension, value, &mut disk_warnings)
                .await;
            match &result {
                Ok(updated) => {
                    info!("Resized {} {} to {}", name, dimension.label(), value);
                    record = updated.clone();
                }
                Err(e) => warn!("Resizing {} {} failed: {}", name, dimension.label(), e),
            }
            outcomes.push((dimension, value, result.map(|_| ())));
        }

        if outcomes.iter().all(|(_, _, r)| r.is_err()) {
            if let Some((_, _, Err(e))) = outcomes.into_iter().next() {
                return Err(e);
            }
            return Err(VpsError::InvalidSpec("nothing to resize".to_string()));
        }

        Ok(ResizeReport {
            container_name: name.to_string(),
            outcomes,
            disk_warnings,
            record,
        })
    }

    async fn resize_dimension(
        &self,
        name: &str,
        dimension: Dimension,
        value: u32,
        disk_warnings: &mut Vec<String>,
    ) -> VpsResult<ContainerRecord> {
        let timeout = self.provisioning.timeouts.default;
        match dimension {
            Dimension::Ram => {
                self.runtime
                    .run(
                        &RuntimeRequest::SetLimit {
                            name: name.to_string(),
                            key: LimitKey::Memory,
                            value: format!("{}MB", gb_to_mb(value)),
                        },
                        timeout,
                    )
                    .await?;
                self.store.update_record(name, |r| {
                    r.ram_gb = value;
                    Ok(())
                })
            }
            Dimension::Cpu => {
                self.runtime
                    .run(
                        &RuntimeRequest::SetLimit {
                            name: name.to_string(),
                            key: LimitKey::Cpu,
                            value: value.to_string(),
                        },
                        timeout,
                    )
                    .await?;
                self.store.update_record(name, |r| {
                    r.cpu_cores = value;
                    Ok(())
                })
            }
            Dimension::Storage => {
                let growth = grow_disk(
                    self.runtime.as_ref(),
                    name,
                    value,
                    &self.provisioning.timeouts,
                )
                .await?;
                disk_warnings.extend(growth.warnings);
                self.store.update_record(name, |r| {
                    r.storage_gb = value;
                    Ok(())
                })
            }
        }
    }

    // === Power ===

    pub async fn start(&self, name: &str) -> VpsResult<ContainerRecord> {
        self.require(name)?;
        self.runtime
            .run(
                &RuntimeRequest::Start {
                    name: name.to_string(),
                },
                self.provisioning.timeouts.start,
            )
            .await?;
        info!("Container {} started", name);
        self.store.update_record(name, |r| {
            r.mark_running();
            Ok(())
        })
    }

    pub async fn stop(&self, name: &str) -> VpsResult<ContainerRecord> {
        self.require(name)?;
        self.runtime
            .run(
                &RuntimeRequest::Stop {
                    name: name.to_string(),
                },
                self.provisioning.timeouts.stop,
            )
            .await?;
        info!("Container {} stopped", name);
        self.store.update_record(name, |r| {
            r.mark_stopped();
            Ok(())
        })
    }

    pub async fn restart(&self, name: &str) -> VpsResult<ContainerRecord> {
        self.require(name)?;
        self.runtime
            .run(
                &RuntimeRequest::Restart {
                    name: name.to_string(),
                },
                self.provisioning.timeouts.stop,
            )
            .await?;
        info!("Container {} restarted", name);
        self.store.update_record(name, |r| {
            r.mark_running();
            Ok(())
        })
    }

    // === Destructive actions behind confirmation ===

    /// First step of a reinstall: returns the token to confirm with
    pub fn request_reinstall(&self, caller: &str, name: &str) -> VpsResult<Uuid> {
        let record = self.require(name)?;
        if record.owner_id != caller {
            return Err(VpsError::AccessDenied(
                "only the VPS owner can reinstall it".to_string(),
            ));
        }
        Ok(self.confirmations.issue(
            caller,
            PendingAction::Reinstall {
                owner_id: record.owner_id,
                container_name: record.container_name,
            },
        ))
    }

    /// First step of an admin stop-all
    pub fn request_stop_all(&self, caller: &str) -> Uuid {
        self.confirmations.issue(caller, PendingAction::StopAll)
    }

    /// Second step: carry out whatever the token authorizes
    pub async fn confirm(&self, caller: &str, token: Uuid) -> VpsResult<Confirmed> {
        match self.confirmations.redeem(caller, token)? {
            PendingAction::Reinstall { container_name, .. } => {
                self.reinstall(&container_name).await.map(Confirmed::Reinstalled)
            }
            PendingAction::StopAll => self.emergency_stop_all().await.map(Confirmed::StoppedAll),
        }
    }

    pub fn cancel(&self, caller: &str, token: Uuid) -> VpsResult<PendingAction> {
        self.confirmations.cancel(caller, token)
    }

    /// Force-delete and recreate with the stored resources
    async fn reinstall(&self, name: &str) -> VpsResult<Provisioned> {
        let record = self.require(name)?;
        let spec = record.spec();
        warn!("Reinstalling {} for {}", name, record.owner_id);

        self.runtime
            .run(
                &RuntimeRequest::Delete {
                    name: name.to_string(),
                    force: true,
                },
                self.provisioning.timeouts.default,
            )
            .await?;
        self.launch(name, spec, &self.provisioning.storage_pool)
            .await?;
        let disk = grow_disk(
            self.runtime.as_ref(),
            name,
            spec.storage_gb,
            &self.provisioning.timeouts,
        )
        .await?;

        let record = self.store.update_record(name, |r| {
            r.mark_reinstalled();
            Ok(())
        })?;
        info!("Container {} reinstalled", name);
        Ok(Provisioned { record, disk })
    }

    /// Force-stop every container, then mark every running record stopped.
    /// Returns the number of records transitioned.
    pub async fn emergency_stop_all(&self) -> VpsResult<usize> {
        self.runtime
            .run(&RuntimeRequest::StopAll, self.provisioning.timeouts.stop)
            .await?;
        let stopped = self.store.mark_all_stopped()?;
        warn!("Emergency stop: {} containers marked stopped", stopped);
        self.emit(LifecycleEvent::EmergencyStop { stopped });
        Ok(stopped)
    }

    /// Force-delete the container at a 1-based position in the owner's list
    pub async fn delete(&self, owner_id: &str, position: usize) -> VpsResult<ContainerRecord> {
        let record = self.store.record_at(owner_id, position)?;
        let name = record.container_name;

        self.runtime
            .run(
                &RuntimeRequest::Delete {
                    name: name.clone(),
                    force: true,
                },
                self.provisioning.timeouts.default,
            )
            .await?;

        let (removed, emptied) = self.store.remove_record(&name)?;
        info!("Container {} deleted", name);
        self.emit(LifecycleEvent::Deleted {
            owner_id: removed.owner_id.clone(),
            container_name: name,
        });
        if emptied {
            self.emit(LifecycleEvent::OwnerEmptied {
                owner_id: removed.owner_id.clone(),
            });
        }
        Ok(removed)
    }

    // === Sharing ===

    pub fn share(&self, owner_id: &str, position: usize, grantee: &str) -> VpsResult<ContainerRecord> {
        if grantee == owner_id {
            return Err(VpsError::InvalidSpec(
                "a container cannot be shared with its owner".to_string(),
            ));
        }
        let record = self.store.update_at(owner_id, position, |r| {
            if !r.shared_with.insert(grantee.to_string()) {
                return Err(VpsError::AlreadyShared {
                    grantee: grantee.to_string(),
                });
            }
            Ok(())
        })?;
        info!("Container {} shared with {}", record.container_name, grantee);
        Ok(record)
    }

    pub fn unshare(&self, owner_id: &str, position: usize, grantee: &str) -> VpsResult<ContainerRecord> {
        let record = self.store.update_at(owner_id, position, |r| {
            if !r.shared_with.remove(grantee) {
                return Err(VpsError::NotShared {
                    grantee: grantee.to_string(),
                });
            }
            Ok(())
        })?;
        info!("Access to {} revoked for {}", record.container_name, grantee);
        Ok(record)
    }

    /// Owner's record at `position`, visible only to grantees
    pub fn shared_record(&self, owner_id: &str, position: usize, grantee: &str) -> VpsResult<ContainerRecord> {
        let record = self.store.record_at(owner_id, position)?;
        if !record.is_shared_with(grantee) {
            return Err(VpsError::AccessDenied(format!(
                "VPS #{} of user {} is not shared with you",
                position, owner_id
            )));
        }
        Ok(record)
    }

    // === Snapshots ===

    /// Snapshot named `<name>-backup-<YYYYmmdd-HHMMSS>`
    pub async fn snapshot(&self, name: &str) -> VpsResult<String> {
        self.require(name)?;
        let snapshot = format!("{}-backup-{}", name, Local::now().format("%Y%m%d-%H%M%S"));
        self.runtime
            .run(
                &RuntimeRequest::Snapshot {
                    name: name.to_string(),
                    snapshot: snapshot.clone(),
                },
                self.provisioning.timeouts.default,
            )
            .await?;
        info!("Snapshot {} created", snapshot);
        Ok(snapshot)
    }

    pub async fn restore(&self, name: &str, snapshot: &str) -> VpsResult<()> {
        self.require(name)?;
        self.runtime
            .run(
                &RuntimeRequest::Restore {
                    name: name.to_string(),
                    snapshot: snapshot.to_string(),
                },
                self.provisioning.timeouts.default,
            )
            .await?;
        info!("Container {} restored from {}", name, snapshot);
        Ok(())
    }

    pub async fn list_snapshots(&self, name: &str) -> VpsResult<Vec<String>> {
        self.require(name)?;
        let info = self
            .runtime
            .run(
                &RuntimeRequest::Info {
                    name: name.to_string(),
                },
                self.provisioning.timeouts.default,
            )
            .await?;
        Ok(parse_snapshot_names(&info))
    }

    // === Guest access ===

    /// Run a shell command inside the container and return its output,
    /// whatever the exit code
    pub async fn exec_one_off(&self, name: &str, command: &str) -> VpsResult<CommandOutput> {
        self.require(name)?;
        info!("Executing in {}: {}", name, command);
        let output = self
            .runtime
            .execute(
                &RuntimeRequest::Exec {
                    name: name.to_string(),
                    argv: vec!["bash".to_string(), "-c".to_string(), command.to_string()],
                },
                self.provisioning.timeouts.default,
            )
            .await?;
        debug!("Exec in {} finished with {:?}", name, output.exit_code);
        Ok(output)
    }

    /// Open a tmate session, installing tmate first when missing
    pub async fn open_ssh_session(&self, name: &str) -> VpsResult<SshSession> {
        self.require(name)?;
        let timeout = self.provisioning.timeouts.default;

        let check = self.runtime.execute(&exec(name, &["which", "tmate"]), timeout).await?;
        let installed = !check.success();
        if installed {
            info!("Installing tmate in {}", name);
            self.runtime
                .run(&exec(name, &["apt-get", "update", "-y"]), timeout)
                .await?;
            self.runtime
                .run(&exec(name, &["apt-get", "install", "-y", "tmate"]), timeout)
                .await?;
        }

        let session_name = format!("session-{}", Local::now().format("%Y%m%d%H%M%S"));
        let socket = format!("/tmp/{}.sock", session_name);
        self.runtime
            .run(
                &exec(name, &["tmate", "-S", &socket, "new-session", "-d"]),
                timeout,
            )
            .await?;
        tokio::time::sleep(self.provisioning.ssh_settle).await;

        let output = self
            .runtime
            .execute(
                &exec(name, &["tmate", "-S", &socket, "display", "-p", "#{tmate_ssh}"]),
                timeout,
            )
            .await?;
        let connection = output.stdout.trim().to_string();
        if connection.is_empty() {
            return Err(RuntimeError::Exit {
                code: output.exit_code,
                stderr: "tmate did not report an SSH connection string".to_string(),
            }
            .into());
        }

        info!("SSH session {} opened in {}", session_name, name);
        Ok(SshSession {
            session_name,
            connection,
            installed,
        })
    }

    // === Credits ===

    pub fn balance(&self, user_id: &str) -> u64 {
        self.store.credits(user_id)
    }

    pub fn grant_credits(&self, user_id: &str, amount: u64) -> VpsResult<u64> {
        let balance = self.store.grant_credits(user_id, amount)?;
        info!("Granted {} credits to {} (balance {})", amount, user_id, balance);
        Ok(balance)
    }

    /// Returns (removed, remaining)
    pub fn revoke_credits(&self, user_id: &str, change: CreditChange) -> VpsResult<(u64, u64)> {
        let (removed, remaining) = self.store.revoke_credits(user_id, change)?;
        info!("Removed {} credits from {} (balance {})", removed, user_id, remaining);
        Ok((removed, remaining))
    }

    // === Admin roster ===

    pub fn primary_admin_id(&self) -> &str {
        &self.primary_admin_id
    }

    pub fn is_primary_admin(&self, user_id: &str) -> bool {
        user_id == self.primary_admin_id
    }

    pub fn is_admin(&self, user_id: &str) -> bool {
        self.is_primary_admin(user_id) || self.store.is_admin(user_id)
    }

    pub fn add_admin(&self, user_id: &str) -> VpsResult<()> {
        if self.is_primary_admin(user_id) {
            return Err(VpsError::AlreadyAdmin(user_id.to_string()));
        }
        self.store.add_admin(user_id)?;
        info!("{} added to the admin roster", user_id);
        Ok(())
    }

    pub fn remove_admin(&self, user_id: &str) -> VpsResult<()> {
        if self.is_primary_admin(user_id) {
            return Err(VpsError::AccessDenied(
                "the primary admin cannot be removed".to_string(),
            ));
        }
        self.store.remove_admin(user_id)?;
        info!("{} removed from the admin roster", user_id);
        Ok(())
    }

    /// Roster admins, without the primary admin
    pub fn admins(&self) -> Vec<String> {
        self.store.admins()
    }

    // === Queries ===

    pub fn records_of(&self, owner_id: &str) -> Vec<ContainerRecord> {
        self.store.records_of(owner_id)
    }

    /// Record at a 1-based display position
    pub fn record_at(&self, owner_id: &str, position: usize) -> VpsResult<ContainerRecord> {
        self.store.record_at(owner_id, position)
    }

    /// Look a container up by name across all owners
    pub fn find(&self, name: &str) -> Option<ContainerRecord> {
        self.store.find(name)
    }

    pub fn all_records(&self) -> Vec<ContainerRecord> {
        self.store.all_records().into_values().flatten().collect()
    }

    pub fn user_summary(&self, user_id: &str) -> UserSummary {
        let records = self.store.records_of(user_id);
        let mut summary = UserSummary {
            user_id: user_id.to_string(),
            credits: self.store.credits(user_id),
            is_admin: self.is_admin(user_id),
            ..Default::default()
        };
        for record in &records {
            tally(
                record,
                &mut summary.running,
                &mut summary.stopped,
                &mut summary.ram_gb,
                &mut summary.cpu_cores,
                &mut summary.storage_gb,
            );
        }
        summary.total = records.len();
        summary
    }

    pub fn fleet_stats(&self) -> FleetStats {
        let all = self.store.all_records();
        let mut stats = FleetStats {
            users: all.len(),
            credits: self.store.total_credits(),
            admins: self.store.admins().len() + 1,
            ..Default::default()
        };
        for record in all.values().flatten() {
            stats.total += 1;
            tally(
                record,
                &mut stats.running,
                &mut stats.stopped,
                &mut stats.ram_gb,
                &mut stats.cpu_cores,
                &mut stats.storage_gb,
            );
        }
        stats
    }

    fn require(&self, name: &str) -> VpsResult<ContainerRecord> {
        self.store
            .find(name)
            .ok_or_else(|| VpsError::NotFound(format!("container {}", name)))
    }

    fn emit(&self, event: LifecycleEvent) {
        if self.events.send(event).is_err() {
            debug!("No lifecycle event subscribers");
        }
    }
}

fn exec(name: &str, argv: &[&str]) -> RuntimeRequest {
    RuntimeRequest::Exec {
        name: name.to_string(),
        argv: argv.iter().map(|s| s.to_string()).collect(),
    }
}

fn tally(
    record: &ContainerRecord,
    running: &mut usize,
    stopped: &mut usize,
    ram_gb: &mut u64,
    cpu_cores: &mut u64,
    storage_gb: &mut u64,
) {
    match record.status {
        ContainerStatus::Running => *running += 1,
        ContainerStatus::Stopped => *stopped += 1,
    }
    *ram_gb += u64::from(record.ram_gb);
    *cpu_cores += u64::from(record.cpu_cores);
    *storage_gb += u64::from(record.storage_gb);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::catalog::{Plan, Processor};
    use crate::core::runtime::testing::FakeRuntime;

    fn manager() -> (VpsManager, Arc<FakeRuntime>) {
        manager_with(Store::in_memory())
    }

    fn manager_with(store: Store) -> (VpsManager, Arc<FakeRuntime>) {
        let runtime = Arc::new(FakeRuntime::new());
        let provisioning = Provisioning {
            ssh_settle: Duration::ZERO,
            ..Provisioning::default()
        };
        let manager = VpsManager::new(Arc::new(store), runtime.clone(), provisioning)
            .with_primary_admin("root");
        (manager, runtime)
    }

    /// A directory squatting on a document's temp path makes its writes fail
    fn block_writes(dir: &std::path::Path, document: &str) -> std::path::PathBuf {
        let blocker = dir.join(format!("{}.tmp", document));
        std::fs::create_dir(&blocker).unwrap();
        blocker
    }

    #[tokio::test]
    async fn purchase_without_credits_has_no_side_effects() {
        let (manager, runtime) = manager();
        let err = manager
            .purchase("U1", "Starter", "Intel", None)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            VpsError::InsufficientCredits {
                needed: 42,
                available: 0
            }
        );
        assert_eq!(manager.balance("U1"), 0);
        assert!(manager.records_of("U1").is_empty());
        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn purchase_keeps_credits_when_the_debit_cannot_be_saved() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, runtime) = manager_with(Store::open(dir.path()).unwrap());
        manager.grant_credits("U1", 100).unwrap();
        block_writes(dir.path(), "user_data.json");

        let err = manager
            .purchase("U1", "Starter", "Intel", None)
            .await
            .unwrap_err();
        assert!(matches!(err, VpsError::Storage(_)));
        assert_eq!(manager.balance("U1"), 100);
        assert!(manager.records_of("U1").is_empty());
        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn purchase_refunds_when_the_record_cannot_be_saved() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _runtime) = manager_with(Store::open(dir.path()).unwrap());
        manager.grant_credits("U1", 100).unwrap();
        block_writes(dir.path(), "vps_data.json");

        let err = manager
            .purchase("U1", "Starter", "Intel", None)
            .await
            .unwrap_err();
        assert!(matches!(err, VpsError::Storage(_)));
        assert_eq!(manager.balance("U1"), 100);
        assert!(manager.records_of("U1").is_empty());

        // Nothing half-written survives a restart either
        let reopened = Store::open(dir.path()).unwrap();
        assert_eq!(reopened.credits("U1"), 100);
        assert_eq!(reopened.record_count("U1"), 0);
    }

    #[tokio::test]
    async fn delete_keeps_the_record_when_removal_cannot_be_saved() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _runtime) = manager_with(Store::open(dir.path()).unwrap());
        manager
            .create("U1", ResourceSpec::new(4, 1, 20), None)
            .await
            .unwrap();
        let mut events = manager.subscribe();
        let blocker = block_writes(dir.path(), "vps_data.json");

        let err = manager.delete("U1", 1).await.unwrap_err();
        assert!(matches!(err, VpsError::Storage(_)));
        assert_eq!(manager.records_of("U1").len(), 1);
        assert!(events.try_recv().is_err());

        std::fs::remove_dir(blocker).unwrap();
        manager.delete("U1", 1).await.unwrap();
        assert!(manager.records_of("U1").is_empty());
        assert_eq!(Store::open(dir.path()).unwrap().record_count("U1"), 0);
    }

    #[tokio::test]
    async fn purchase_debits_and_records_the_plan() {
        let (manager, runtime) = manager();
        manager.grant_credits("U1", 100).unwrap();

        let purchase = manager
            .purchase("U1", "Starter", "Intel", None)
            .await
            .unwrap();
        assert_eq!(purchase.balance, 58);
        assert_eq!(manager.balance("U1"), 58);

        let records = manager.records_of("U1");
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.container_name, "vps-U1-1");
        assert_eq!((record.ram_gb, record.cpu_cores, record.storage_gb), (4, 1, 20));
        assert_eq!(record.status, ContainerStatus::Running);
        assert_eq!(record.plan, Some(Plan::Starter));
        assert_eq!(record.processor, Some(Processor::Intel));

        let lines = runtime.command_lines();
        assert_eq!(
            lines[0],
            "launch debian:12 vps-U1-1 --config limits.memory=4096MB --config limits.cpu=1 -s btrpool"
        );
        assert_eq!(lines[1], "config device override vps-U1-1 root size=20GB");
    }

    #[tokio::test]
    async fn failed_provisioning_refunds_the_debit() {
        let (manager, runtime) = manager();
        manager.grant_credits("U1", 100).unwrap();
        runtime.fail_exit("launch", "image not found");

        let err = manager
            .purchase("U1", "basic", "amd", Some(40))
            .await
            .unwrap_err();
        assert!(matches!(err, VpsError::Runtime(RuntimeError::Exit { .. })));
        assert_eq!(manager.balance("U1"), 100);
        assert!(manager.records_of("U1").is_empty());
    }

    #[tokio::test]
    async fn failed_quota_after_launch_stores_nothing() {
        let (manager, runtime) = manager();
        manager.grant_credits("U1", 100).unwrap();
        runtime.fail_exit("config device override", "quota refused");

        assert!(manager.purchase("U1", "Starter", "Intel", None).await.is_err());
        assert_eq!(manager.balance("U1"), 100);
        assert!(manager.records_of("U1").is_empty());
        // the launched container is left on the host
        assert_eq!(runtime.count("delete"), 0);
    }

    #[tokio::test]
    async fn unknown_plan_fails_before_debit() {
        let (manager, _) = manager();
        manager.grant_credits("U1", 500).unwrap();
        assert!(matches!(
            manager.purchase("U1", "Mega", "Intel", None).await,
            Err(VpsError::UnknownPlan(_))
        ));
        assert!(matches!(
            manager.purchase("U1", "Pro", "Intel", Some(0)).await,
            Err(VpsError::InvalidSpec(_))
        ));
        assert_eq!(manager.balance("U1"), 500);
    }

    #[tokio::test]
    async fn create_rejects_zero_resources() {
        let (manager, runtime) = manager();
        assert!(matches!(
            manager.create("U1", ResourceSpec::new(0, 1, 10), None).await,
            Err(VpsError::InvalidSpec(_))
        ));
        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn create_uses_requested_pool_and_emits_event() {
        let (manager, runtime) = manager();
        let mut events = manager.subscribe();
        let provisioned = manager
            .create("U1", ResourceSpec::new(2, 1, 10), Some("fastpool"))
            .await
            .unwrap();
        assert_eq!(provisioned.record.plan_label(), "Custom");
        assert!(runtime.command_lines()[0].ends_with("-s fastpool"));
        assert_eq!(
            events.try_recv().unwrap(),
            LifecycleEvent::Provisioned {
                owner_id: "U1".into(),
                container_name: "vps-U1-1".into()
            }
        );
    }

    #[tokio::test]
    async fn disk_growth_failures_are_only_warnings() {
        let (manager, runtime) = manager();
        runtime.fail_exit("exec vps-U1-1 -- growpart", "NOCHANGE");
        let provisioned = manager
            .create("U1", ResourceSpec::new(2, 1, 10), None)
            .await
            .unwrap();
        assert_eq!(provisioned.disk.warnings.len(), 1);
        assert_eq!(manager.records_of("U1").len(), 1);
    }

    #[tokio::test]
    async fn concurrent_creates_for_one_owner_pick_the_same_name() {
        let (manager, runtime) = manager();
        runtime.gate_launches(2);
        let spec = ResourceSpec::new(2, 1, 10);

        let (a, b) = tokio::join!(
            manager.create("U1", spec, None),
            manager.create("U1", spec, None)
        );
        assert_eq!(a.unwrap().record.container_name, "vps-U1-1");
        assert_eq!(b.unwrap().record.container_name, "vps-U1-1");
        assert_eq!(manager.records_of("U1").len(), 2);
    }

    #[tokio::test]
    async fn resize_storage_failure_keeps_stored_size() {
        let (manager, runtime) = manager();
        manager
            .create("U1", ResourceSpec::new(4, 1, 20), None)
            .await
            .unwrap();
        runtime.fail_exit("config device override vps-U1-1 root size=50GB", "quota exceeded");

        let err = manager
            .resize("vps-U1-1", ResizeRequest::default().with_storage(50))
            .await
            .unwrap_err();
        assert!(matches!(err, VpsError::Runtime(_)));
        assert_eq!(manager.find("vps-U1-1").unwrap().storage_gb, 20);
    }

    #[tokio::test]
    async fn resize_keeps_dimensions_that_succeeded() {
        let (manager, runtime) = manager();
        manager
            .create("U1", ResourceSpec::new(4, 1, 20), None)
            .await
            .unwrap();
        runtime.fail_exit("config set vps-U1-1 limits.cpu", "too many cores");

        let report = manager
            .resize(
                "vps-U1-1",
                ResizeRequest::default().with_ram(8).with_cpu(64).with_storage(40),
            )
            .await
            .unwrap();
        assert!(!report.is_complete());
        assert_eq!(
            report.applied().collect::<Vec<_>>(),
            vec![(Dimension::Ram, 8), (Dimension::Storage, 40)]
        );
        assert_eq!(report.failures().count(), 1);

        let stored = manager.find("vps-U1-1").unwrap();
        assert_eq!((stored.ram_gb, stored.cpu_cores, stored.storage_gb), (8, 1, 40));
        assert_eq!(report.record, stored);
        assert!(runtime
            .command_lines()
            .contains(&"config set vps-U1-1 limits.memory 8192MB".to_string()));
    }

    #[tokio::test]
    async fn resize_of_unknown_container_is_not_found() {
        let (manager, _) = manager();
        assert!(matches!(
            manager
                .resize("vps-x-1", ResizeRequest::default().with_ram(2))
                .await,
            Err(VpsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn power_transitions_follow_acknowledged_calls() {
        let (manager, runtime) = manager();
        manager
            .create("U1", ResourceSpec::new(2, 1, 10), None)
            .await
            .unwrap();

        assert_eq!(
            manager.stop("vps-U1-1").await.unwrap().status,
            ContainerStatus::Stopped
        );
        runtime.fail_exit("start", "boom");
        assert!(manager.start("vps-U1-1").await.is_err());
        assert_eq!(manager.find("vps-U1-1").unwrap().status, ContainerStatus::Stopped);

        runtime.clear_failures();
        assert!(manager.restart("vps-U1-1").await.unwrap().status.is_running());
    }

    #[tokio::test]
    async fn reinstall_needs_a_token_and_keeps_resources() {
        let (manager, runtime) = manager();
        manager
            .create("U1", ResourceSpec::new(8, 2, 30), None)
            .await
            .unwrap();
        manager.stop("vps-U1-1").await.unwrap();
        let before = manager.find("vps-U1-1").unwrap().created_at;

        manager.share("U1", 1, "U2").unwrap();
        for outsider in ["U2", "root"] {
            assert!(matches!(
                manager.request_reinstall(outsider, "vps-U1-1"),
                Err(VpsError::AccessDenied(_))
            ));
        }

        let token = manager.request_reinstall("U1", "vps-U1-1").unwrap();
        assert_eq!(runtime.count("delete"), 0);
        assert!(matches!(
            manager.confirm("U2", token).await,
            Err(VpsError::AccessDenied(_))
        ));

        let Confirmed::Reinstalled(done) = manager.confirm("U1", token).await.unwrap() else {
            panic!("expected a reinstall");
        };
        assert_eq!(done.record.spec(), ResourceSpec::new(8, 2, 30));
        assert_eq!(done.record.status, ContainerStatus::Running);
        assert!(done.record.created_at >= before);
        assert!(runtime
            .command_lines()
            .contains(&"delete vps-U1-1 --force".to_string()));
        assert_eq!(runtime.count("launch"), 2);

        assert!(matches!(
            manager.confirm("U1", token).await,
            Err(VpsError::Confirmation(_))
        ));
    }

    #[tokio::test]
    async fn deleting_compacts_the_owner_list() {
        let (manager, _) = manager();
        let spec = ResourceSpec::new(2, 1, 10);
        manager.create("U1", spec, None).await.unwrap();
        manager.create("U1", spec, None).await.unwrap();
        manager.create("U2", spec, None).await.unwrap();
        let mut events = manager.subscribe();

        let removed = manager.delete("U1", 1).await.unwrap();
        assert_eq!(removed.container_name, "vps-U1-1");

        let left = manager.records_of("U1");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].container_name, "vps-U1-2");
        assert_eq!(manager.records_of("U2").len(), 1);
        assert!(matches!(events.try_recv(), Ok(LifecycleEvent::Deleted { .. })));
        assert!(events.try_recv().is_err());

        // next name steps past the surviving vps-U1-2
        let next = manager.create("U1", spec, None).await.unwrap();
        assert_eq!(next.record.container_name, "vps-U1-3");
    }

    #[tokio::test]
    async fn deleting_the_last_record_empties_the_owner() {
        let (manager, runtime) = manager();
        manager
            .create("U1", ResourceSpec::new(2, 1, 10), None)
            .await
            .unwrap();
        let mut events = manager.subscribe();

        runtime.fail_exit("delete", "busy");
        assert!(manager.delete("U1", 1).await.is_err());
        assert_eq!(manager.records_of("U1").len(), 1);

        runtime.clear_failures();
        manager.delete("U1", 1).await.unwrap();
        assert!(matches!(events.try_recv(), Ok(LifecycleEvent::Deleted { .. })));
        assert_eq!(
            events.try_recv().unwrap(),
            LifecycleEvent::OwnerEmptied {
                owner_id: "U1".into()
            }
        );
        assert!(matches!(manager.delete("U1", 1).await, Err(VpsError::NotFound(_))));
    }

    #[tokio::test]
    async fn sharing_is_guarded_both_ways() {
        let (manager, runtime) = manager();
        manager
            .create("U1", ResourceSpec::new(2, 1, 10), None)
            .await
            .unwrap();
        let calls = runtime.calls().len();

        manager.share("U1", 1, "U2").unwrap();
        assert_eq!(
            manager.share("U1", 1, "U2").unwrap_err(),
            VpsError::AlreadyShared {
                grantee: "U2".into()
            }
        );
        assert_eq!(manager.find("vps-U1-1").unwrap().shared_with.len(), 1);
        assert!(manager.share("U1", 1, "U1").is_err());

        assert_eq!(
            manager.unshare("U1", 1, "U3").unwrap_err(),
            VpsError::NotShared {
                grantee: "U3".into()
            }
        );
        assert!(manager.shared_record("U1", 1, "U2").is_ok());
        assert!(matches!(
            manager.shared_record("U1", 1, "U3"),
            Err(VpsError::AccessDenied(_))
        ));

        manager.unshare("U1", 1, "U2").unwrap();
        assert!(manager.find("vps-U1-1").unwrap().shared_with.is_empty());
        assert_eq!(runtime.calls().len(), calls);
    }

    #[tokio::test]
    async fn snapshots_pass_through_to_the_runtime() {
        let (manager, runtime) = manager();
        manager
            .create("U1", ResourceSpec::new(2, 1, 10), None)
            .await
            .unwrap();

        let snapshot = manager.snapshot("vps-U1-1").await.unwrap();
        assert!(snapshot.starts_with("vps-U1-1-backup-"));

        runtime.respond(
            "info vps-U1-1",
            CommandOutput::ok("Name: vps-U1-1\nSnapshots:\n  snapshot: snap0\n  snapshot: snap1 (stateless)\n"),
        );
        assert_eq!(
            manager.list_snapshots("vps-U1-1").await.unwrap(),
            vec!["snap0".to_string(), "snap1 (stateless)".to_string()]
        );

        manager.restore("vps-U1-1", "snap0").await.unwrap();
        assert!(runtime
            .command_lines()
            .contains(&"restore vps-U1-1 snap0".to_string()));
        assert!(matches!(
            manager.snapshot("vps-nope-1").await,
            Err(VpsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn exec_returns_output_whatever_the_exit_code() {
        let (manager, runtime) = manager();
        manager
            .create("U1", ResourceSpec::new(2, 1, 10), None)
            .await
            .unwrap();
        runtime.respond("exec vps-U1-1 -- bash -c", CommandOutput::failed(2, "no such file"));

        let output = manager
            .exec_one_off("vps-U1-1", "cat /missing; echo $HOME")
            .await
            .unwrap();
        assert_eq!(output.exit_code, Some(2));
        assert_eq!(output.stderr, "no such file");
        match runtime.calls().last().unwrap() {
            RuntimeRequest::Exec { argv, .. } => {
                assert_eq!(argv[2], "cat /missing; echo $HOME");
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[tokio::test]
    async fn ssh_session_installs_tmate_when_missing() {
        let (manager, runtime) = manager();
        manager
            .create("U1", ResourceSpec::new(2, 1, 10), None)
            .await
            .unwrap();
        runtime.respond("exec vps-U1-1 -- which tmate", CommandOutput::failed(1, ""));
        runtime.respond(
            "exec vps-U1-1 -- tmate",
            CommandOutput::ok("ssh abc@nyc1.tmate.io\n"),
        );

        let session = manager.open_ssh_session("vps-U1-1").await.unwrap();
        assert!(session.installed);
        assert_eq!(session.connection, "ssh abc@nyc1.tmate.io");
        assert!(session.session_name.starts_with("session-"));
        assert_eq!(runtime.count("exec vps-U1-1 -- apt-get install -y tmate"), 1);
    }

    #[tokio::test]
    async fn ssh_session_without_connection_string_fails() {
        let (manager, _) = manager();
        manager
            .create("U1", ResourceSpec::new(2, 1, 10), None)
            .await
            .unwrap();
        assert!(matches!(
            manager.open_ssh_session("vps-U1-1").await,
            Err(VpsError::Runtime(RuntimeError::Exit { .. }))
        ));
    }

    #[tokio::test]
    async fn stop_all_requires_confirmation() {
        let (manager, runtime) = manager();
        let spec = ResourceSpec::new(2, 1, 10);
        manager.create("U1", spec, None).await.unwrap();
        manager.create("U2", spec, None).await.unwrap();
        manager.stop("vps-U2-1").await.unwrap();

        let token = manager.request_stop_all("root");
        assert_eq!(runtime.count("stop --all"), 0);
        let Confirmed::StoppedAll(stopped) = manager.confirm("root", token).await.unwrap() else {
            panic!("expected stop-all");
        };
        assert_eq!(stopped, 1);
        assert_eq!(runtime.count("stop --all --force"), 1);
    }

    #[tokio::test]
    async fn failed_emergency_stop_changes_nothing() {
        let (manager, runtime) = manager();
        manager
            .create("U1", ResourceSpec::new(2, 1, 10), None)
            .await
            .unwrap();
        runtime.fail(
            "stop --all",
            RuntimeError::Timeout {
                after: Duration::from_secs(300),
            },
        );
        assert!(manager.emergency_stop_all().await.is_err());
        assert!(manager.find("vps-U1-1").unwrap().status.is_running());
    }

    #[tokio::test]
    async fn admin_roster_protects_the_primary_admin() {
        let (manager, _) = manager();
        assert!(manager.is_admin("root"));
        assert!(manager.add_admin("root").is_err());
        assert!(matches!(
            manager.remove_admin("root"),
            Err(VpsError::AccessDenied(_))
        ));

        manager.add_admin("A1").unwrap();
        assert!(manager.is_admin("A1"));
        assert_eq!(manager.admins(), vec!["A1".to_string()]);
        manager.remove_admin("A1").unwrap();
        assert!(!manager.is_admin("A1"));
    }

    #[tokio::test]
    async fn summaries_add_up() {
        let (manager, _) = manager();
        manager.grant_credits("U1", 10).unwrap();
        manager
            .create("U1", ResourceSpec::new(4, 1, 20), None)
            .await
            .unwrap();
        manager
            .create("U1", ResourceSpec::new(8, 2, 30), None)
            .await
            .unwrap();
        manager
            .create("U2", ResourceSpec::new(2, 1, 10), None)
            .await
            .unwrap();
        manager.stop("vps-U1-2").await.unwrap();

        let summary = manager.user_summary("U1");
        assert_eq!(summary.credits, 10);
        assert_eq!((summary.total, summary.running, summary.stopped), (2, 1, 1));
        assert_eq!((summary.ram_gb, summary.cpu_cores), (12, 3));

        let stats = manager.fleet_stats();
        assert_eq!(stats.users, 2);
        assert_eq!((stats.total, stats.running, stats.stopped), (3, 2, 1));
        assert_eq!(stats.storage_gb, 60);
        assert_eq!(stats.admins, 1);
    }
}
