//! Effective-id switching for a starter that runs as root.
//!
//! A starter started without root privileges runs everything as itself and
//! every guard is a no-op.

use nix::errno::Errno;
use nix::unistd::{Gid, Uid, getegid, geteuid, setegid, seteuid};
use tracing::warn;

/// Owner ids a job runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
}

impl Identity {
    /// Ids of the calling process.
    pub fn current() -> Self {
        Self {
            uid: Uid::current().as_raw(),
            gid: Gid::current().as_raw(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

/// Restores the previous effective ids on drop.
#[must_use]
pub struct PrivGuard {
    restore: Option<(Uid, Gid)>,
}

impl PrivGuard {
    fn noop() -> Self {
        Self { restore: None }
    }

    fn switch(uid: Uid, gid: Gid) -> Result<Self, Errno> {
        if !Uid::current().is_root() {
            return Ok(Self::noop());
        }
        let (euid, egid) = (geteuid(), getegid());
        if euid == uid && egid == gid {
            return Ok(Self::noop());
        }
        // Changing the group needs root as the effective user.
        if !euid.is_root() {
            seteuid(Uid::from_raw(0))?;
        }
        let guard = Self {
            restore: Some((euid, egid)),
        };
        setegid(gid)?;
        seteuid(uid)?;
        Ok(guard)
    }

    /// Act as the job's owner until the guard drops.
    pub fn user(id: Identity) -> Result<Self, Errno> {
        Self::switch(Uid::from_raw(id.uid), Gid::from_raw(id.gid))
    }

    /// Act as root until the guard drops.
    pub fn root() -> Result<Self, Errno> {
        Self::switch(Uid::from_raw(0), getegid())
    }
}

impl Drop for PrivGuard {
    fn drop(&mut self) {
        let Some((uid, gid)) = self.restore.take() else {
            return;
        };
        let result = seteuid(Uid::from_raw(0))
            .and_then(|()| setegid(gid))
            .and_then(|()| seteuid(uid));
        if let Err(errno) = result {
            warn!(%errno, uid = uid.as_raw(), "failed to restore effective ids");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switching_to_current_ids_is_a_no_op() {
        let before = (geteuid(), getegid());
        {
            let _g = PrivGuard::user(Identity {
                uid: before.0.as_raw(),
                gid: before.1.as_raw(),
            })
            .unwrap();
            assert_eq!((geteuid(), getegid()), before);
        }
        assert_eq!((geteuid(), getegid()), before);
    }

    #[test]
    fn root_guard_restores_ids() {
        let before = (geteuid(), getegid());
        drop(PrivGuard::root().unwrap());
        assert_eq!((geteuid(), getegid()), before);
    }
}
