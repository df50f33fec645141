//! Command parsing
//!
//! Commands follow the bot's `.name arg ...` form; the leading dot is
//! optional. Users are referenced by id or by a `<@id>` mention.

use thiserror::Error;

use super::access::Role;
use crate::persistence::CreditChange;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown command '{0}', try .help")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}

/// A caller's own VPS (by display number), or another owner's VPS when
/// `owner` is given
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub position: usize,
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorAction {
    Status,
    Enable,
    Disable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Plans,
    Credits,
    BuyCredits,
    BuyWithCredits {
        plan: String,
        processor: String,
        storage_gb: Option<u32>,
    },
    Manage {
        user: Option<String>,
    },
    Start(Target),
    Stop(Target),
    Ssh(Target),
    Reinstall(Target),
    Confirm {
        token: String,
    },
    Cancel {
        token: String,
    },
    ShareUser {
        grantee: String,
        position: usize,
    },
    RevokeShare {
        grantee: String,
        position: usize,
    },
    ManageShared {
        owner: String,
        position: usize,
    },
    Create {
        user: String,
        ram_gb: u32,
        cpu_cores: u32,
        storage_gb: Option<u32>,
    },
    DeleteVps {
        user: String,
        position: usize,
        reason: Option<String>,
    },
    ListAll,
    VpsInfo {
        container: Option<String>,
    },
    RestartVps {
        container: String,
    },
    BackupVps {
        container: String,
    },
    RestoreVps {
        container: String,
        snapshot: String,
    },
    ListSnapshots {
        container: String,
    },
    Exec {
        container: String,
        command: String,
    },
    StopVpsAll,
    CpuMonitor(MonitorAction),
    Resize {
        container: String,
        ram_gb: Option<u32>,
        cpu_cores: Option<u32>,
        storage_gb: Option<u32>,
    },
    AdminCredits {
        user: String,
        amount: u64,
    },
    AdminRemoveCredits {
        user: String,
        change: CreditChange,
    },
    UserInfo {
        user: String,
    },
    ServerStats,
    AdminAdd {
        user: String,
    },
    AdminRemove {
        user: String,
    },
    AdminList,
}

/// (name, usage, description, role) for every command, in help order
pub const COMMANDS: &[(&str, &str, &str, Role)] = &[
    ("help", ".help", "Show this help", Role::User),
    ("plans", ".plans", "Show VPS plans and prices", Role::User),
    ("credits", ".credits", "Show your credit balance", Role::User),
    ("buyc", ".buyc", "How to buy credits", Role::User),
    ("buywc", ".buywc <plan> [processor] [storage_gb]", "Buy a VPS with credits", Role::User),
    ("manage", ".manage", "List your VPS", Role::User),
    ("start", ".start <vps#> [@owner]", "Start a VPS", Role::User),
    ("stop", ".stop <vps#> [@owner]", "Stop a VPS", Role::User),
    ("ssh", ".ssh <vps#> [@owner]", "Open a temporary SSH session", Role::User),
    ("reinstall", ".reinstall <vps#>", "Reinstall your own VPS (asks for confirmation)", Role::User),
    ("confirm", ".confirm <token>", "Confirm a pending action", Role::User),
    ("cancel", ".cancel <token>", "Cancel a pending action", Role::User),
    ("share-user", ".share-user <@user> <vps#>", "Share VPS access", Role::User),
    ("share-ruser", ".share-ruser <@user> <vps#>", "Revoke shared access", Role::User),
    ("manage-shared", ".manage-shared <@owner> <vps#>", "Show a VPS shared with you", Role::User),
    ("create", ".create <@user> <ram_gb> <cpu> [storage_gb]", "Create a custom VPS", Role::Admin),
    ("delete-vps", ".delete-vps <@user> <vps#> [reason]", "Delete a user's VPS", Role::Admin),
    ("manage @user", ".manage <@user>", "List another user's VPS", Role::Admin),
    ("list-all", ".list-all", "List every VPS", Role::Admin),
    ("vpsinfo", ".vpsinfo [container]", "VPS details", Role::Admin),
    ("restart-vps", ".restart-vps <container>", "Restart a VPS", Role::Admin),
    ("backup-vps", ".backup-vps <container>", "Create a VPS snapshot", Role::Admin),
    ("restore-vps", ".restore-vps <container> <snapshot>", "Restore from snapshot", Role::Admin),
    ("list-snapshots", ".list-snapshots <container>", "List VPS snapshots", Role::Admin),
    ("exec", ".exec <container> <command>", "Run a command inside a VPS", Role::Admin),
    ("stop-vps-all", ".stop-vps-all", "Stop every VPS (asks for confirmation)", Role::Admin),
    ("cpu-monitor", ".cpu-monitor [status|enable|disable]", "Control the CPU guard", Role::Admin),
    ("resize", ".resize <container> [ram_gb] [cpu] [storage_gb]", "Resize a VPS", Role::Admin),
    ("adminc", ".adminc <@user> <amount>", "Give credits", Role::Admin),
    ("adminrc", ".adminrc <@user> <amount|all>", "Remove credits", Role::Admin),
    ("userinfo", ".userinfo <@user>", "User details", Role::Admin),
    ("serverstats", ".serverstats", "Server statistics", Role::Admin),
    ("admin-add", ".admin-add <@user>", "Grant admin", Role::PrimaryAdmin),
    ("admin-remove", ".admin-remove <@user>", "Revoke admin", Role::PrimaryAdmin),
    ("admin-list", ".admin-list", "List admins", Role::PrimaryAdmin),
];

impl Command {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim();
        let line = line.strip_prefix('.').unwrap_or(line);
        let mut args = Args::new(line);
        let name = args.next().ok_or(ParseError::Empty)?.to_ascii_lowercase();

        let command = match name.as_str() {
            "help" => Self::Help,
            "plans" => Self::Plans,
            "credits" => Self::Credits,
            "buyc" => Self::BuyCredits,
            "buywc" => {
                const USAGE: &str = ".buywc <plan> [processor] [storage_gb]";
                Self::BuyWithCredits {
                    plan: args.required(USAGE)?.to_string(),
                    processor: args.next().unwrap_or("Intel").to_string(),
                    storage_gb: args.optional_number(USAGE)?,
                }
            }
            "manage" => Self::Manage {
                user: args.next().map(parse_user),
            },
            "start" => Self::Start(args.target(".start <vps#> [@owner]")?),
            "stop" => Self::Stop(args.target(".stop <vps#> [@owner]")?),
            "ssh" => Self::Ssh(args.target(".ssh <vps#> [@owner]")?),
            "reinstall" => Self::Reinstall(args.target(".reinstall <vps#>")?),
            "confirm" => Self::Confirm {
                token: args.required(".confirm <token>")?.to_string(),
            },
            "cancel" => Self::Cancel {
                token: args.required(".cancel <token>")?.to_string(),
            },
            "share-user" => {
                const USAGE: &str = ".share-user <@user> <vps#>";
                Self::ShareUser {
                    grantee: args.user(USAGE)?,
                    position: args.number(USAGE)?,
                }
            }
            "share-ruser" => {
                const USAGE: &str = ".share-ruser <@user> <vps#>";
                Self::RevokeShare {
                    grantee: args.user(USAGE)?,
                    position: args.number(USAGE)?,
                }
            }
            "manage-shared" => {
                const USAGE: &str = ".manage-shared <@owner> <vps#>";
                Self::ManageShared {
                    owner: args.user(USAGE)?,
                    position: args.number(USAGE)?,
                }
            }
            "create" => {
                const USAGE: &str = ".create <@user> <ram_gb> <cpu> [storage_gb]";
                Self::Create {
                    user: args.user(USAGE)?,
                    ram_gb: args.number(USAGE)?,
                    cpu_cores: args.number(USAGE)?,
                    storage_gb: args.optional_number(USAGE)?,
                }
            }
            "delete-vps" => {
                const USAGE: &str = ".delete-vps <@user> <vps#> [reason]";
                Self::DeleteVps {
                    user: args.user(USAGE)?,
                    position: args.number(USAGE)?,
                    reason: args.rest(),
                }
            }
            "list-all" => Self::ListAll,
            "vpsinfo" => Self::VpsInfo {
                container: args.next().map(str::to_string),
            },
            "restart-vps" => Self::RestartVps {
                container: args.required(".restart-vps <container>")?.to_string(),
            },
            "backup-vps" => Self::BackupVps {
                container: args.required(".backup-vps <container>")?.to_string(),
            },
            "restore-vps" => {
                const USAGE: &str = ".restore-vps <container> <snapshot>";
                Self::RestoreVps {
                    container: args.required(USAGE)?.to_string(),
                    snapshot: args.required(USAGE)?.to_string(),
                }
            }
            "list-snapshots" => Self::ListSnapshots {
                container: args.required(".list-snapshots <container>")?.to_string(),
            },
            "exec" => {
                const USAGE: &str = ".exec <container> <command>";
                Self::Exec {
                    container: args.required(USAGE)?.to_string(),
                    command: args.rest().ok_or(ParseError::Usage(USAGE))?,
                }
            }
            "stop-vps-all" => Self::StopVpsAll,
            "cpu-monitor" => {
                let action = match args.next().map(|a| a.to_ascii_lowercase()).as_deref() {
                    None | Some("status") => MonitorAction::Status,
                    Some("enable") | Some("on") => MonitorAction::Enable,
                    Some("disable") | Some("off") => MonitorAction::Disable,
                    Some(_) => {
                        return Err(ParseError::Usage(".cpu-monitor [status|enable|disable]"))
                    }
                };
                Self::CpuMonitor(action)
            }
            "resize" => {
                const USAGE: &str = ".resize <container> [ram_gb] [cpu] [storage_gb]";
                Self::Resize {
                    container: args.required(USAGE)?.to_string(),
                    ram_gb: args.optional_number(USAGE)?,
                    cpu_cores: args.optional_number(USAGE)?,
                    storage_gb: args.optional_number(USAGE)?,
                }
            }
            "adminc" => {
                const USAGE: &str = ".adminc <@user> <amount>";
                Self::AdminCredits {
                    user: args.user(USAGE)?,
                    amount: args.number(USAGE)?,
                }
            }
            "adminrc" => {
                const USAGE: &str = ".adminrc <@user> <amount|all>";
                let user = args.user(USAGE)?;
                let amount = args.required(USAGE)?;
                let change = if amount.eq_ignore_ascii_case("all") {
                    CreditChange::All
                } else {
                    CreditChange::Exact(amount.parse().map_err(|_| ParseError::Usage(USAGE))?)
                };
                Self::AdminRemoveCredits { user, change }
            }
            "userinfo" => Self::UserInfo {
                user: args.user(".userinfo <@user>")?,
            },
            "serverstats" => Self::ServerStats,
            "admin-add" => Self::AdminAdd {
                user: args.user(".admin-add <@user>")?,
            },
            "admin-remove" => Self::AdminRemove {
                user: args.user(".admin-remove <@user>")?,
            },
            "admin-list" => Self::AdminList,
            _ => return Err(ParseError::Unknown(name)),
        };
        Ok(command)
    }

    /// Minimum role allowed to run this command. Acting on someone else's
    /// VPS is checked separately against ownership and sharing.
    pub fn required_role(&self) -> Role {
        match self {
            Self::Help
            | Self::Plans
            | Self::Credits
            | Self::BuyCredits
            | Self::BuyWithCredits { .. }
            | Self::Manage { user: None }
            | Self::Start(_)
            | Self::Stop(_)
            | Self::Ssh(_)
            | Self::Reinstall(_)
            | Self::Confirm { .. }
            | Self::Cancel { .. }
            | Self::ShareUser { .. }
            | Self::RevokeShare { .. }
            | Self::ManageShared { .. } => Role::User,
            Self::AdminAdd { .. } | Self::AdminRemove { .. } | Self::AdminList => {
                Role::PrimaryAdmin
            }
            _ => Role::Admin,
        }
    }
}

/// Normalize a user reference: `<@123>`, `<@!123>`, `@123` or `123`
pub fn parse_user(token: &str) -> String {
    let token = token.trim();
    let token = token
        .strip_prefix("<@")
        .and_then(|t| t.strip_suffix('>'))
        .map(|t| t.trim_start_matches('!'))
        .unwrap_or(token);
    token.trim_start_matches('@').to_string()
}

/// Word-by-word view over the argument text that can also hand out the
/// untouched remainder
struct Args<'a> {
    rest: &'a str,
}

impl<'a> Args<'a> {
    fn new(text: &'a str) -> Self {
        Self { rest: text.trim() }
    }

    fn next(&mut self) -> Option<&'a str> {
        if self.rest.is_empty() {
            return None;
        }
        let (word, rest) = self
            .rest
            .split_once(char::is_whitespace)
            .unwrap_or((self.rest, ""));
        self.rest = rest.trim_start();
        Some(word)
    }

    fn rest(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.rest).trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }

    fn required(&mut self, usage: &'static str) -> Result<&'a str, ParseError> {
        self.next().ok_or(ParseError::Usage(usage))
    }

    fn user(&mut self, usage: &'static str) -> Result<String, ParseError> {
        let user = parse_user(self.required(usage)?);
        if user.is_empty() {
            return Err(ParseError::Usage(usage));
        }
        Ok(user)
    }

    fn number<T: std::str::FromStr>(&mut self, usage: &'static str) -> Result<T, ParseError> {
        self.required(usage)?
            .parse()
            .map_err(|_| ParseError::Usage(usage))
    }

    fn optional_number<T: std::str::FromStr>(
        &mut self,
        usage: &'static str,
    ) -> Result<Option<T>, ParseError> {
        self.next()
            .map(|word| word.parse().map_err(|_| ParseError::Usage(usage)))
            .transpose()
    }

    fn target(&mut self, usage: &'static str) -> Result<Target, ParseError> {
        Ok(Target {
            position: self.number(usage)?,
            owner: self.next().map(parse_user),
        })
    }
}
