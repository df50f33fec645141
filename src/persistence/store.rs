//! JSON document store for credits, container records and admins

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::error::{VpsError, VpsResult};
use crate::core::record::{container_name, AdminRoster, ContainerRecord, ContainerStatus, UserAccount};

const USERS_FILE: &str = "user_data.json";
const VPS_FILE: &str = "vps_data.json";
const ADMINS_FILE: &str = "admin_data.json";

/// One independently flushed table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Users,
    Vps,
    Admins,
}

impl Table {
    fn file_name(&self) -> &'static str {
        match self {
            Self::Users => USERS_FILE,
            Self::Vps => VPS_FILE,
            Self::Admins => ADMINS_FILE,
        }
    }
}

/// How many credits to take away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditChange {
    Exact(u64),
    All,
}

/// Owner of the three tables.
///
/// Every mutating method rewrites the affected table's document in full
/// before returning. Locks are never held across an `.await`.
pub struct Store {
    users: RwLock<BTreeMap<String, UserAccount>>,
    vps: RwLock<BTreeMap<String, Vec<ContainerRecord>>>,
    admins: RwLock<AdminRoster>,
    /// Directory holding the documents, `None` for in-memory stores
    directory: Option<PathBuf>,
    /// Serializes flushes so the last writer always carries the newest state
    flush_lock: Mutex<()>,
}

impl Store {
    /// Store without backing files
    pub fn in_memory() -> Self {
        Self {
            users: RwLock::new(BTreeMap::new()),
            vps: RwLock::new(BTreeMap::new()),
            admins: RwLock::new(AdminRoster::default()),
            directory: None,
            flush_lock: Mutex::new(()),
        }
    }

    /// Open (or initialize) the documents in `directory`
    pub fn open(directory: &Path) -> VpsResult<Self> {
        std::fs::create_dir_all(directory)?;

        let users = load_document(&directory.join(USERS_FILE));
        let vps: BTreeMap<String, Vec<ContainerRecord>> = load_document(&directory.join(VPS_FILE));
        let admins = load_document(&directory.join(ADMINS_FILE));

        info!(
            "Store opened at {:?} ({} owners, {} containers)",
            directory,
            vps.len(),
            vps.values().map(Vec::len).sum::<usize>()
        );

        Ok(Self {
            users: RwLock::new(users),
            vps: RwLock::new(vps),
            admins: RwLock::new(admins),
            directory: Some(directory.to_path_buf()),
            flush_lock: Mutex::new(()),
        })
    }

    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    /// Rewrite one table's document from the in-memory state
    pub fn flush(&self, table: Table) -> VpsResult<()> {
        match table {
            Table::Users => self.persist(table, &*self.read_users()),
            Table::Vps => self.persist(table, &*self.read_vps()),
            Table::Admins => self.persist(table, &*self.read_admins()),
        }
    }

    pub fn flush_all(&self) -> VpsResult<()> {
        self.flush(Table::Users)?;
        self.flush(Table::Vps)?;
        self.flush(Table::Admins)
    }

    // === Users ===

    pub fn credits(&self, user_id: &str) -> u64 {
        self.read_users()
            .get(user_id)
            .map(|a| a.credits)
            .unwrap_or(0)
    }

    /// Add credits, creating the account on first use
    pub fn grant_credits(&self, user_id: &str, amount: u64) -> VpsResult<u64> {
        if amount == 0 {
            return Err(VpsError::InvalidAmount(
                "amount must be a positive integer".to_string(),
            ));
        }
        self.commit(Table::Users, &self.users, |users| {
            let account = users.entry(user_id.to_string()).or_default();
            account.credits = account.credits.saturating_add(amount);
            Ok(account.credits)
        })
    }

    /// Remove credits, never going below zero. Returns (removed, remaining).
    pub fn revoke_credits(&self, user_id: &str, change: CreditChange) -> VpsResult<(u64, u64)> {
        if change == CreditChange::Exact(0) {
            return Err(VpsError::InvalidAmount(
                "use a positive number or 'all'".to_string(),
            ));
        }
        self.commit(Table::Users, &self.users, |users| {
            let account = users.entry(user_id.to_string()).or_default();
            let removed = match change {
                CreditChange::All => account.credits,
                CreditChange::Exact(amount) => amount.min(account.credits),
            };
            account.credits -= removed;
            Ok((removed, account.credits))
        })
    }

    /// Check and debit in one step; fails without side effects when short
    pub fn debit(&self, user_id: &str, amount: u64) -> VpsResult<u64> {
        self.commit(Table::Users, &self.users, |users| {
            let account = users.entry(user_id.to_string()).or_default();
            if account.credits < amount {
                return Err(VpsError::InsufficientCredits {
                    needed: amount,
                    available: account.credits,
                });
            }
            account.credits -= amount;
            Ok(account.credits)
        })
    }

    pub fn refund(&self, user_id: &str, amount: u64) -> VpsResult<u64> {
        self.commit(Table::Users, &self.users, |users| {
            let account = users.entry(user_id.to_string()).or_default();
            account.credits = account.credits.saturating_add(amount);
            Ok(account.credits)
        })
    }

    pub fn total_credits(&self) -> u64 {
        self.read_users().values().map(|a| a.credits).sum()
    }

    // === Container records ===

    /// Snapshot of an owner's records in display order
    pub fn records_of(&self, owner_id: &str) -> Vec<ContainerRecord> {
        self.read_vps().get(owner_id).cloned().unwrap_or_default()
    }

    pub fn record_count(&self, owner_id: &str) -> usize {
        self.read_vps().get(owner_id).map(Vec::len).unwrap_or(0)
    }

    /// Record at a 1-based display position
    pub fn record_at(&self, owner_id: &str, position: usize) -> VpsResult<ContainerRecord> {
        let vps = self.read_vps();
        position
            .checked_sub(1)
            .and_then(|idx| vps.get(owner_id)?.get(idx))
            .cloned()
            .ok_or_else(|| not_found_at(owner_id, position))
    }

    pub fn find(&self, name: &str) -> Option<ContainerRecord> {
        self.read_vps()
            .values()
            .flatten()
            .find(|r| r.container_name == name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    /// All records grouped by owner
    pub fn all_records(&self) -> BTreeMap<String, Vec<ContainerRecord>> {
        self.read_vps().clone()
    }

    /// Next name for an owner: `vps-<owner>-<count+1>`, stepping past any
    /// name still held by a surviving record.
    ///
    /// Nothing is reserved, so two concurrent callers for the same owner can
    /// receive the same name.
    pub fn next_container_name(&self, owner_id: &str) -> String {
        let vps = self.read_vps();
        let taken = |name: &str| vps.values().flatten().any(|r| r.container_name == name);
        let mut seq = vps.get(owner_id).map(Vec::len).unwrap_or(0) + 1;
        let mut name = container_name(owner_id, seq);
        while taken(&name) {
            warn!("Container name {} is still in use, skipping", name);
            seq += 1;
            name = container_name(owner_id, seq);
        }
        name
    }

    pub fn append(&self, record: ContainerRecord) -> VpsResult<()> {
        self.commit(Table::Vps, &self.vps, |vps| {
            vps.entry(record.owner_id.clone()).or_default().push(record);
            Ok(())
        })
    }

    /// Apply `change` to the named record; nothing is kept if it fails
    pub fn update_record<F>(&self, name: &str, change: F) -> VpsResult<ContainerRecord>
    where
        F: FnOnce(&mut ContainerRecord) -> VpsResult<()>,
    {
        self.commit(Table::Vps, &self.vps, |vps| {
            let record = vps
                .values_mut()
                .flatten()
                .find(|r| r.container_name == name)
                .ok_or_else(|| VpsError::NotFound(format!("container {}", name)))?;
            change(record)?;
            Ok(record.clone())
        })
    }

    /// Apply `change` to the record at a 1-based display position
    pub fn update_at<F>(&self, owner_id: &str, position: usize, change: F) -> VpsResult<ContainerRecord>
    where
        F: FnOnce(&mut ContainerRecord) -> VpsResult<()>,
    {
        self.commit(Table::Vps, &self.vps, |vps| {
            let record = position
                .checked_sub(1)
                .and_then(|idx| vps.get_mut(owner_id)?.get_mut(idx))
                .ok_or_else(|| not_found_at(owner_id, position))?;
            change(record)?;
            Ok(record.clone())
        })
    }

    /// Remove the named record; the owner's list compacts. Returns the
    /// removed record and whether the owner has no records left.
    pub fn remove_record(&self, name: &str) -> VpsResult<(ContainerRecord, bool)> {
        self.commit(Table::Vps, &self.vps, |vps| {
            let (owner_id, idx) = vps
                .iter()
                .find_map(|(owner, list)| {
                    list.iter()
                        .position(|r| r.container_name == name)
                        .map(|idx| (owner.clone(), idx))
                })
                .ok_or_else(|| VpsError::NotFound(format!("container {}", name)))?;
            let list = vps
                .get_mut(&owner_id)
                .ok_or_else(|| VpsError::NotFound(format!("container {}", name)))?;
            let removed = list.remove(idx);
            let emptied = list.is_empty();
            if emptied {
                vps.remove(&owner_id);
            }
            Ok((removed, emptied))
        })
    }

    /// Flip every running record to stopped; others are left untouched
    pub fn mark_all_stopped(&self) -> VpsResult<usize> {
        self.commit(Table::Vps, &self.vps, |vps| {
            let mut stopped = 0;
            for record in vps.values_mut().flatten() {
                if record.status == ContainerStatus::Running {
                    record.mark_stopped();
                    stopped += 1;
                }
            }
            Ok(stopped)
        })
    }

    // === Admins ===

    pub fn is_admin(&self, user_id: &str) -> bool {
        self.read_admins().admins.contains(user_id)
    }

    pub fn admins(&self) -> Vec<String> {
        self.read_admins().admins.iter().cloned().collect()
    }

    pub fn add_admin(&self, user_id: &str) -> VpsResult<()> {
        self.commit(Table::Admins, &self.admins, |roster| {
            if !roster.admins.insert(user_id.to_string()) {
                return Err(VpsError::AlreadyAdmin(user_id.to_string()));
            }
            Ok(())
        })
    }

    pub fn remove_admin(&self, user_id: &str) -> VpsResult<()> {
        self.commit(Table::Admins, &self.admins, |roster| {
            if !roster.admins.remove(user_id) {
                return Err(VpsError::NotAdmin(user_id.to_string()));
            }
            Ok(())
        })
    }

    /// Drop an id from the roster if present (used to keep the primary
    /// admin out of the stored roster)
    pub fn forget_admin(&self, user_id: &str) -> VpsResult<bool> {
        if !self.is_admin(user_id) {
            return Ok(false);
        }
        self.commit(Table::Admins, &self.admins, |roster| {
            Ok(roster.admins.remove(user_id))
        })
    }

    /// Run `change` against a copy of one table, write the copy, and only
    /// then install it. The table's write lock is held throughout, so a
    /// failed change or a failed write leaves memory and disk as they were.
    fn commit<T, R, F>(&self, table: Table, lock: &RwLock<T>, change: F) -> VpsResult<R>
    where
        T: Clone + Serialize,
        F: FnOnce(&mut T) -> VpsResult<R>,
    {
        let mut current = lock.write().unwrap_or_else(PoisonError::into_inner);
        let mut draft = current.clone();
        let result = change(&mut draft)?;
        if let Err(e) = self.persist(table, &draft) {
            warn!("Discarding {:?} change, write failed: {}", table, e);
            return Err(e);
        }
        *current = draft;
        Ok(result)
    }

    /// Write a table's document. Callers hold that table's lock first.
    fn persist<T: Serialize>(&self, table: Table, value: &T) -> VpsResult<()> {
        let Some(directory) = &self.directory else {
            return Ok(());
        };
        let _guard = self.flush_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let path = directory.join(table.file_name());
        write_document(&path, value)?;
        debug!("Flushed {:?}", path);
        Ok(())
    }

    fn read_users(&self) -> RwLockReadGuard<'_, BTreeMap<String, UserAccount>> {
        self.users.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_vps(&self) -> RwLockReadGuard<'_, BTreeMap<String, Vec<ContainerRecord>>> {
        self.vps.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_admins(&self) -> RwLockReadGuard<'_, AdminRoster> {
        self.admins.read().unwrap_or_else(PoisonError::into_inner)
    }
}

fn not_found_at(owner_id: &str, position: usize) -> VpsError {
    VpsError::NotFound(format!("VPS #{} of user {}", position, owner_id))
}

/// Read a JSON document, falling back to the default when missing or invalid
fn load_document<T: DeserializeOwned + Default>(path: &Path) -> T {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("{:?} could not be read ({}), initializing default", path, e);
            } else {
                info!("{:?} not found, initializing default", path);
            }
            return T::default();
        }
    };
    match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(e) => {
            warn!("{:?} is invalid ({}), initializing default", path, e);
            T::default()
        }
    }
}

/// Replace a document in full via a sibling temp file
fn write_document<T: Serialize>(path: &Path, value: &T) -> VpsResult<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
