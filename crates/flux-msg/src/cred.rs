use bitflags::bitflags;

use crate::error::ProtoError;

/// Sentinel userid meaning "identity unknown".
pub const USERID_UNKNOWN: u32 = 0xFFFF_FFFF;

bitflags! {
    /// Roles granted to a message sender.
    ///
    /// Unknown bits are preserved across encode/decode so that newer peers
    /// can define additional roles without breaking older ones.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RoleMask: u32 {
        const OWNER = 1;
        const USER = 2;
        const LOCAL = 4;

        const _ = !0;
    }
}

impl RoleMask {
    pub const NONE: RoleMask = RoleMask::empty();
}

/// Message credentials: who sent it and with what roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cred {
    pub userid: u32,
    pub rolemask: RoleMask,
}

impl Cred {
    pub fn new(userid: u32, rolemask: RoleMask) -> Self {
        Cred { userid, rolemask }
    }

    /// The shared authorization predicate.
    ///
    /// Grant if the sender holds the OWNER role.  Grant if the sender holds
    /// the USER role, its userid is known, and it matches `userid`.
    /// Otherwise deny with a permission error.
    pub fn authorize(&self, userid: u32) -> Result<(), ProtoError> {
        if self.rolemask.contains(RoleMask::OWNER) {
            return Ok(());
        }
        if self.rolemask.contains(RoleMask::USER)
            && self.userid != USERID_UNKNOWN
            && self.userid == userid
        {
            return Ok(());
        }
        Err(ProtoError::permission("request rejected"))
    }

    /// True if the sender is on the same node (LOCAL role).
    pub fn is_local(&self) -> bool {
        self.rolemask.contains(RoleMask::LOCAL)
    }
}

impl Default for Cred {
    fn default() -> Self {
        Cred {
            userid: USERID_UNKNOWN,
            rolemask: RoleMask::NONE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cred(userid: u32, rolemask: RoleMask) -> Cred {
        Cred::new(userid, rolemask)
    }

    #[test]
    fn owner_always_authorized() {
        assert!(cred(100, RoleMask::OWNER).authorize(100).is_ok());
        assert!(cred(100, RoleMask::OWNER).authorize(101).is_ok());
        assert!(
            cred(USERID_UNKNOWN, RoleMask::OWNER)
                .authorize(100)
                .is_ok()
        );
    }

    #[test]
    fn user_authorized_only_for_own_userid() {
        assert!(cred(100, RoleMask::USER).authorize(100).is_ok());
        assert!(cred(100, RoleMask::USER).authorize(101).is_err());
    }

    #[test]
    fn unknown_userid_never_matches() {
        assert!(
            cred(USERID_UNKNOWN, RoleMask::USER)
                .authorize(USERID_UNKNOWN)
                .is_err()
        );
    }

    #[test]
    fn no_roles_denied() {
        assert!(cred(100, RoleMask::NONE).authorize(100).is_err());
        assert!(cred(100, RoleMask::LOCAL).authorize(100).is_err());
    }

    #[test]
    fn owner_and_user_combined() {
        let c = cred(100, RoleMask::OWNER | RoleMask::USER);
        assert!(c.authorize(100).is_ok());
        assert!(c.authorize(999).is_ok());
    }

    #[test]
    fn unknown_role_bits_roundtrip() {
        let mask = RoleMask::from_bits_retain(0x8000_0002);
        assert_eq!(mask.bits(), 0x8000_0002);
        assert!(mask.contains(RoleMask::USER));
    }
}
