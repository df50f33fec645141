//! Dispatcher - Runs parsed commands against the lifecycle manager

use std::sync::Arc;

use tracing::{info, warn};

use super::access::Role;
use super::command::{Command, MonitorAction, Target, COMMANDS};
use super::Reply;
use crate::core::catalog::{plan_spec, price, Plan, Processor};
use crate::core::confirm::parse_token;
use crate::core::error::{VpsError, VpsResult};
use crate::core::guard::{GuardHandle, GuardState};
use crate::core::lifecycle::{Confirmed, Provisioned};
use crate::core::record::ContainerRecord;
use crate::core::resource::{ResizeRequest, ResourceSpec};
use crate::core::settings::PaymentMethod;
use crate::core::{AppState, VpsManager};
use crate::persistence::CreditChange;

/// Longest exec output shown in a reply
const MAX_OUTPUT_CHARS: usize = 1000;

/// Turns command lines from an authenticated caller into replies
pub struct Dispatcher {
    manager: Arc<VpsManager>,
    guard: GuardHandle,
    default_custom_storage_gb: u32,
    payment_methods: Vec<PaymentMethod>,
}

impl Dispatcher {
    pub fn new(manager: Arc<VpsManager>, guard: GuardHandle, default_custom_storage_gb: u32) -> Self {
        Self {
            manager,
            guard,
            default_custom_storage_gb,
            payment_methods: Vec::new(),
        }
    }

    pub fn with_payment_methods(mut self, methods: Vec<PaymentMethod>) -> Self {
        self.payment_methods = methods;
        self
    }

    pub fn from_state(state: &AppState) -> Self {
        Self::new(
            state.manager.clone(),
            state.guard.clone(),
            state.settings.default_custom_storage_gb,
        )
        .with_payment_methods(state.settings.payment_methods.clone())
    }

    pub fn manager(&self) -> &Arc<VpsManager> {
        &self.manager
    }

    /// Parse, authorize and run one command line
    pub async fn handle(&self, caller: &str, line: &str) -> Vec<Reply> {
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(e) => return vec![Reply::error("Invalid Command", e.to_string())],
        };
        let role = Role::of(&self.manager, caller);
        info!("{} ({}) -> {:?}", caller, role.label(), command);

        match self.execute(caller, role, command).await {
            Ok(replies) => replies,
            Err(e) => {
                warn!("Command from {} failed: {}", caller, e);
                vec![Reply::error(e.title(), e.to_string())]
            }
        }
    }

    async fn execute(&self, caller: &str, role: Role, command: Command) -> VpsResult<Vec<Reply>> {
        role.require(command.required_role())?;
        let manager = &self.manager;

        let reply = match command {
            Command::Help => help(role),
            Command::Plans => plans(),
            Command::Credits => Reply::info(
                "Your Credits",
                format!("You have {} credits", manager.balance(caller)),
            )
            .with_field("Need More?", "Use .buyc to see payment methods"),
            Command::BuyCredits => buy_credits(&self.payment_methods),
            Command::BuyWithCredits {
                plan,
                processor,
                storage_gb,
            } => {
                let purchase = manager
                    .purchase(caller, &plan, &processor, storage_gb)
                    .await?;
                let mut replies = vec![record_reply(
                    Reply::success(
                        "VPS Purchased",
                        format!(
                            "{} ({}) purchased for {} credits",
                            purchase.quote.plan, purchase.quote.processor, purchase.quote.price
                        ),
                    ),
                    &purchase.provisioned.record,
                )
                .with_field("Remaining Credits", purchase.balance.to_string())];
                replies.extend(disk_warning(&purchase.provisioned));
                return Ok(replies);
            }
            Command::Manage { user } => {
                let owner = user.unwrap_or_else(|| caller.to_string());
                list_records(
                    &format!("VPS of {}", owner),
                    &manager.records_of(&owner),
                )
            }
            Command::Start(target) => {
                let record = self.resolve(caller, role, &target)?;
                let record = manager.start(&record.container_name).await?;
                Reply::success(
                    "VPS Started",
                    format!("VPS `{}` is now running", record.container_name),
                )
            }
            Command::Stop(target) => {
                let record = self.resolve(caller, role, &target)?;
                let record = manager.stop(&record.container_name).await?;
                Reply::success(
                    "VPS Stopped",
                    format!("VPS `{}` has been stopped", record.container_name),
                )
            }
            Command::Ssh(target) => {
                let record = self.resolve(caller, role, &target)?;
                let session = manager.open_ssh_session(&record.container_name).await?;
                Reply::success(
                    "SSH Access",
                    format!("SSH connection for VPS `{}`", record.container_name),
                )
                .with_field("Command", session.connection)
                .with_field("Session", session.session_name)
                .with_field("Security", "This link is temporary. Do not share it.")
            }
            Command::Reinstall(target) => {
                if target.owner.as_deref().is_some_and(|owner| owner != caller) {
                    return Err(VpsError::AccessDenied(
                        "only the VPS owner can reinstall it".to_string(),
                    ));
                }
                let record = manager.record_at(caller, target.position)?;
                let token = manager.request_reinstall(caller, &record.container_name)?;
                Reply::warning(
                    "Confirm Reinstall",
                    format!(
                        "This erases all data on `{}` and cannot be undone. Run .confirm {} within {} seconds to proceed.",
                        record.container_name,
                        token,
                        manager.provisioning().confirmation_ttl.as_secs()
                    ),
                )
                .with_field("Token", token.to_string())
            }
            Command::Confirm { token } => {
                let token = parse_token(&token)?;
                match manager.confirm(caller, token).await? {
                    Confirmed::Reinstalled(provisioned) => {
                        let mut replies = vec![record_reply(
                            Reply::success(
                                "VPS Reinstalled",
                                format!(
                                    "VPS `{}` has been reinstalled",
                                    provisioned.record.container_name
                                ),
                            ),
                            &provisioned.record,
                        )];
                        replies.extend(disk_warning(&provisioned));
                        return Ok(replies);
                    }
                    Confirmed::StoppedAll(stopped) => Reply::success(
                        "All VPS Stopped",
                        format!("{} VPS marked as stopped", stopped),
                    ),
                }
            }
            Command::Cancel { token } => {
                let action = manager.cancel(caller, parse_token(&token)?)?;
                Reply::info("Cancelled", format!("Cancelled: {}", action.label()))
            }
            Command::ShareUser { grantee, position } => {
                let record = manager.share(caller, position, &grantee)?;
                Reply::success(
                    "VPS Shared",
                    format!("VPS #{} (`{}`) shared with {}", position, record.container_name, grantee),
                )
            }
            Command::RevokeShare { grantee, position } => {
                let record = manager.unshare(caller, position, &grantee)?;
                Reply::success(
                    "Access Revoked",
                    format!(
                        "Access to VPS #{} (`{}`) removed for {}",
                        position, record.container_name, grantee
                    ),
                )
            }
            Command::ManageShared { owner, position } => {
                let record = manager.shared_record(&owner, position, caller)?;
                record_reply(
                    Reply::info(
                        "Shared VPS",
                        format!(
                            "Use .start/.stop/.ssh {} <@{}> to manage it",
                            position, owner
                        ),
                    ),
                    &record,
                )
            }
            Command::Create {
                user,
                ram_gb,
                cpu_cores,
                storage_gb,
            } => {
                let spec = ResourceSpec::new(
                    ram_gb,
                    cpu_cores,
                    storage_gb.unwrap_or(self.default_custom_storage_gb),
                );
                let provisioned = manager.create(&user, spec, None).await?;
                let mut replies = vec![record_reply(
                    Reply::success("VPS Created", format!("Custom VPS created for {}", user)),
                    &provisioned.record,
                )];
                replies.extend(disk_warning(&provisioned));
                return Ok(replies);
            }
            Command::DeleteVps {
                user,
                position,
                reason,
            } => {
                let record = manager.delete(&user, position).await?;
                Reply::success(
                    "VPS Deleted",
                    format!("VPS `{}` of {} has been deleted", record.container_name, user),
                )
                .with_field("Reason", reason.unwrap_or_else(|| "No reason".to_string()))
            }
            Command::ListAll | Command::VpsInfo { container: None } => {
                list_records("All VPS", &manager.all_records())
            }
            Command::VpsInfo {
                container: Some(container),
            } => {
                let record = manager
                    .find(&container)
                    .ok_or_else(|| VpsError::NotFound(format!("container {}", container)))?;
                record_reply(Reply::info("VPS Information", ""), &record)
                    .with_field("Owner", record.owner_id.clone())
                    .with_field(
                        "Created",
                        record.created_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                    )
                    .with_field("Shared With", joined_or(&record.shared_with, "Nobody"))
            }
            Command::RestartVps { container } => {
                manager.restart(&container).await?;
                Reply::success(
                    "VPS Restarted",
                    format!("VPS `{}` has been restarted", container),
                )
            }
            Command::BackupVps { container } => {
                let snapshot = manager.snapshot(&container).await?;
                Reply::success(
                    "Backup Created",
                    format!("Snapshot `{}` created", snapshot),
                )
            }
            Command::RestoreVps {
                container,
                snapshot,
            } => {
                manager.restore(&container, &snapshot).await?;
                Reply::success(
                    "VPS Restored",
                    format!("VPS `{}` has been restored from `{}`", container, snapshot),
                )
            }
            Command::ListSnapshots { container } => {
                let snapshots = manager.list_snapshots(&container).await?;
                if snapshots.is_empty() {
                    Reply::info(
                        "No Snapshots",
                        format!("No snapshots found for `{}`", container),
                    )
                } else {
                    Reply::info(
                        format!("Snapshots for {}", container),
                        format!("Found {} snapshots", snapshots.len()),
                    )
                    .with_field("Snapshots", snapshots.join("\n"))
                }
            }
            Command::Exec { container, command } => {
                let output = manager.exec_one_off(&container, &command).await?;
                let mut reply = Reply::info(
                    format!("Command Output - {}", container),
                    format!("Command: `{}`", command),
                );
                if !output.stdout.trim().is_empty() {
                    reply = reply.with_field("Output", truncate(&output.stdout));
                }
                if !output.stderr.trim().is_empty() {
                    reply = reply.with_field("Error", truncate(&output.stderr));
                }
                let code = output
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "killed".to_string());
                reply.with_field("Exit Code", code)
            }
            Command::StopVpsAll => {
                let token = manager.request_stop_all(caller);
                Reply::warning(
                    "Confirm Stop All",
                    format!(
                        "This force-stops every VPS on the host. Run .confirm {} within {} seconds to proceed.",
                        token,
                        manager.provisioning().confirmation_ttl.as_secs()
                    ),
                )
                .with_field("Token", token.to_string())
            }
            Command::CpuMonitor(action) => {
                match action {
                    MonitorAction::Enable => self.guard.enable(),
                    MonitorAction::Disable => self.guard.disable(),
                    MonitorAction::Status => {}
                }
                let title = match action {
                    MonitorAction::Enable => "CPU Monitor Enabled",
                    MonitorAction::Disable => "CPU Monitor Disabled",
                    MonitorAction::Status => "CPU Monitor Status",
                };
                guard_reply(Reply::info(title, ""), &self.guard)
            }
            Command::Resize {
                container,
                ram_gb,
                cpu_cores,
                storage_gb,
            } => {
                let request = ResizeRequest {
                    ram_gb,
                    cpu_cores,
                    storage_gb,
                };
                let report = manager.resize(&container, request).await?;
                let mut reply = if report.is_complete() {
                    Reply::success("VPS Resized", format!("VPS `{}` resized", container))
                } else {
                    Reply::warning(
                        "VPS Partially Resized",
                        format!("Some changes to `{}` failed", container),
                    )
                };
                for (dimension, value) in report.applied() {
                    reply = reply.with_field(dimension.label(), format!("set to {}", value));
                }
                for (dimension, error) in report.failures() {
                    reply = reply.with_field(dimension.label(), format!("failed: {}", error));
                }
                if !report.disk_warnings.is_empty() {
                    reply = reply.with_field(
                        "Filesystem",
                        "Disk quota applied, filesystem growth unconfirmed",
                    );
                }
                reply
            }
            Command::AdminCredits { user, amount } => {
                let balance = manager.grant_credits(&user, amount)?;
                Reply::success(
                    "Credits Added",
                    format!("Added {} credits to {}", amount, user),
                )
                .with_field("Balance", balance.to_string())
            }
            Command::AdminRemoveCredits { user, change } => {
                let (removed, remaining) = manager.revoke_credits(&user, change)?;
                let body = match change {
                    CreditChange::All => format!("Removed all {} credits from {}", removed, user),
                    CreditChange::Exact(_) => format!("Removed {} credits from {}", removed, user),
                };
                Reply::success("Credits Removed", body).with_field("Balance", remaining.to_string())
            }
            Command::UserInfo { user } => {
                let summary = manager.user_summary(&user);
                let reply = Reply::info(format!("User Information - {}", user), "")
                    .with_field("Credits", summary.credits.to_string())
                    .with_field("Admin", if summary.is_admin { "Yes" } else { "No" })
                    .with_field(
                        "VPS",
                        format!(
                            "{} total, {} running, {} stopped",
                            summary.total, summary.running, summary.stopped
                        ),
                    )
                    .with_field(
                        "Resources",
                        format!(
                            "{}GB RAM, {} CPU, {}GB Disk",
                            summary.ram_gb, summary.cpu_cores, summary.storage_gb
                        ),
                    );
                let records = manager.records_of(&user);
                return Ok(vec![reply, list_records(&format!("VPS of {}", user), &records)]);
            }
            Command::ServerStats => {
                let stats = manager.fleet_stats();
                let reply = Reply::info("Server Statistics", "")
                    .with_field("Users", stats.users.to_string())
                    .with_field("Admins", stats.admins.to_string())
                    .with_field(
                        "VPS",
                        format!(
                            "{} total, {} running, {} stopped",
                            stats.total, stats.running, stats.stopped
                        ),
                    )
                    .with_field(
                        "Allocated",
                        format!(
                            "{}GB RAM, {} CPU, {}GB Disk",
                            stats.ram_gb, stats.cpu_cores, stats.storage_gb
                        ),
                    )
                    .with_field("Credits In Circulation", stats.credits.to_string());
                guard_reply(reply, &self.guard)
            }
            Command::AdminAdd { user } => {
                manager.add_admin(&user)?;
                Reply::success("Admin Added", format!("{} is now an admin", user))
            }
            Command::AdminRemove { user } => {
                manager.remove_admin(&user)?;
                Reply::success("Admin Removed", format!("{} is no longer an admin", user))
            }
            Command::AdminList => {
                let admins = manager.admins();
                Reply::info("Admin Users", "")
                    .with_field("Primary Admin", manager.primary_admin_id().to_string())
                    .with_field("Admins", joined_or(&admins, "No additional admins"))
            }
        };
        Ok(vec![reply])
    }

    /// Find the VPS a target points at. Other owners' VPS are reachable by
    /// admins and by users they are shared with.
    fn resolve(&self, caller: &str, role: Role, target: &Target) -> VpsResult<ContainerRecord> {
        let owner = target.owner.as_deref().unwrap_or(caller);
        if owner == caller || role.is_admin() {
            return self.manager.record_at(owner, target.position);
        }
        self.manager.shared_record(owner, target.position, caller)
    }
}

fn help(role: Role) -> Reply {
    let mut reply = Reply::info(
        "Command Help",
        format!("Commands available to you ({})", role.label()),
    );
    for (_, usage, description, required) in COMMANDS {
        if role >= *required {
            reply = reply.with_field(*usage, *description);
        }
    }
    reply
}

fn plans() -> Reply {
    let mut reply = Reply::info("VPS Plans", "Buy with .buywc <plan> [Intel|AMD] [storage_gb]");
    for plan in Plan::all() {
        let spec = plan_spec(*plan);
        reply = reply.with_field(
            plan.label(),
            format!(
                "{}GB RAM, {} CPU, {}GB Disk - {} {} / {} {} credits",
                spec.ram_gb,
                spec.cpu_cores,
                spec.storage_gb_default,
                Processor::Intel,
                price(*plan, Processor::Intel),
                Processor::Amd,
                price(*plan, Processor::Amd)
            ),
        );
    }
    reply
}

fn record_reply(reply: Reply, record: &ContainerRecord) -> Reply {
    let plan = match record.processor {
        Some(processor) => format!("{} ({})", record.plan_label(), processor),
        None => record.plan_label().to_string(),
    };
    reply
        .with_field("Container", record.container_name.clone())
        .with_field("Plan", plan)
        .with_field("Specs", record.spec().to_string())
        .with_field("Status", record.status.label())
}

fn list_records(title: &str, records: &[ContainerRecord]) -> Reply {
    if records.is_empty() {
        return Reply::info(title, "No VPS found");
    }
    let mut reply = Reply::info(title, format!("{} VPS", records.len()));
    for (idx, record) in records.iter().enumerate() {
        reply = reply.with_field(
            format!("#{} {}", idx + 1, record.container_name),
            format!(
                "{} | {} | {} | owner {}",
                record.status.label(),
                record.plan_label(),
                record.spec(),
                record.owner_id
            ),
        );
    }
    reply
}

fn disk_warning(provisioned: &Provisioned) -> Option<Reply> {
    if provisioned.disk.warnings.is_empty() {
        return None;
    }
    Some(
        Reply::warning(
            "Filesystem Not Confirmed",
            format!(
                "Disk quota of {}GB applied, filesystem growth inside `{}` could not be confirmed",
                provisioned.disk.size_gb, provisioned.record.container_name
            ),
        )
        .with_field("Details", provisioned.disk.warnings.join("\n")),
    )
}

fn buy_credits(methods: &[PaymentMethod]) -> Reply {
    if methods.is_empty() {
        return Reply::info(
            "Purchase Credits",
            "No payment methods are configured. Contact an admin to buy credits.",
        );
    }
    let mut reply = Reply::info("Purchase Credits", "Choose a payment method below:");
    for method in methods {
        reply = reply.with_field(&method.name, &method.details);
    }
    reply.with_field(
        "Next Steps",
        "1. Pay\n2. Contact an admin with the transaction ID\n3. Receive credits",
    )
}

fn guard_reply(reply: Reply, guard: &GuardHandle) -> Reply {
    let state = match guard.state() {
        GuardState::Active => "Active",
        GuardState::Disabled => "Disabled",
    };
    reply
        .with_field("CPU Guard", state)
        .with_field("Threshold", format!("{:.0}%", guard.threshold_percent()))
        .with_field(
            "Check Interval",
            format!("{}s", guard.check_interval().as_secs()),
        )
}

fn joined_or<'a, I>(items: I, empty: &str) -> String
where
    I: IntoIterator<Item = &'a String>,
{
    let joined = items
        .into_iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    if joined.is_empty() {
        empty.to_string()
    } else {
        joined
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_OUTPUT_CHARS {
        return text.trim_end().to_string();
    }
    let head: String = text.chars().take(MAX_OUTPUT_CHARS).collect();
    format!("{}\n... (truncated)", head)
}
