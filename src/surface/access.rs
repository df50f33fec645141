//! Role checks for commands

use crate::core::error::{VpsError, VpsResult};
use crate::core::VpsManager;

/// Caller privilege, ordered from least to most
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    User,
    Admin,
    PrimaryAdmin,
}

impl Role {
    pub fn of(manager: &VpsManager, user_id: &str) -> Self {
        if manager.is_primary_admin(user_id) {
            Self::PrimaryAdmin
        } else if manager.is_admin(user_id) {
            Self::Admin
        } else {
            Self::User
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
            Self::PrimaryAdmin => "primary admin",
        }
    }

    pub fn is_admin(&self) -> bool {
        *self >= Self::Admin
    }

    /// Fail with `AccessDenied` unless this role reaches `required`
    pub fn require(&self, required: Role) -> VpsResult<()> {
        if *self >= required {
            return Ok(());
        }
        let message = match required {
            Role::PrimaryAdmin => "only the primary admin can use this command",
            _ => "you need admin permissions to use this command",
        };
        Err(VpsError::AccessDenied(message.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::runtime::testing::FakeRuntime;
    use crate::core::settings::Provisioning;
    use crate::persistence::Store;

    #[test]
    fn roles_are_ordered() {
        assert!(Role::PrimaryAdmin.require(Role::Admin).is_ok());
        assert!(Role::Admin.require(Role::User).is_ok());
        assert!(matches!(
            Role::Admin.require(Role::PrimaryAdmin),
            Err(VpsError::AccessDenied(_))
        ));
        assert!(Role::User.require(Role::Admin).is_err());
        assert!(!Role::User.is_admin());
    }

    #[test]
    fn roles_come_from_the_roster() {
        let manager = VpsManager::new(
            Arc::new(Store::in_memory()),
            Arc::new(FakeRuntime::new()),
            Provisioning::default(),
        )
        .with_primary_admin("root");
        manager.add_admin("A1").unwrap();

        assert_eq!(Role::of(&manager, "root"), Role::PrimaryAdmin);
        assert_eq!(Role::of(&manager, "A1"), Role::Admin);
        assert_eq!(Role::of(&manager, "U1"), Role::User);
    }
}
