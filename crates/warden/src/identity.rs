//! Worker identity: security label and privilege drop
//!
//! Everything here runs in the forked child before any module code. Every
//! step is irreversible and every failure is fatal for the child: the caller
//! must `_exit` rather than continue with residual privilege.

use crate::registry::Identity;
use nix::errno::Errno;
use nix::unistd::{self, Gid, Uid};
use std::path::Path;

/// Where the kernel exposes the SELinux filesystem when it is enabled.
const SELINUX_MOUNT: &str = "/sys/fs/selinux";

/// Per-thread current security context, the interface `setcon(3)` writes to.
const CURRENT_CONTEXT: &str = "/proc/thread-self/attr/current";

/// Exit codes used by the child when it cannot assume its identity or
/// deliver its reply.
///
/// In every case the supervisor has received no message, so these never
/// collide with module results.
pub mod exit_code {
    pub const PARENT_GONE: i32 = 120;
    pub const LABEL: i32 = 121;
    pub const GROUPS: i32 = 122;
    pub const GID: i32 = 123;
    pub const UID: i32 = 124;
    pub const VERIFY: i32 = 125;
    pub const PANIC: i32 = 126;
    pub const SEND_FAILED: i32 = 127;
}

/// Which step of the identity change failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropFailure {
    Label(Errno),
    Groups(Errno),
    Gid(Errno),
    Uid(Errno),
    Verify,
}

impl DropFailure {
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            DropFailure::Label(_) => exit_code::LABEL,
            DropFailure::Groups(_) => exit_code::GROUPS,
            DropFailure::Gid(_) => exit_code::GID,
            DropFailure::Uid(_) => exit_code::UID,
            DropFailure::Verify => exit_code::VERIFY,
        }
    }
}

/// Whether the running kernel enforces SELinux labels at all.
#[must_use]
pub fn selinux_enabled() -> bool {
    Path::new(SELINUX_MOUNT).join("enforce").exists()
}

/// Apply the label, then the group identity, then the user identity.
///
/// Group before user: once the uid is dropped the process no longer has the
/// capability to change its gid.
pub fn assume(identity: &Identity) -> Result<(), DropFailure> {
    if let Some(label) = identity.label.as_deref() {
        if selinux_enabled() {
            apply_label(label)?;
        }
    }

    let gid = Gid::from_raw(identity.gid);
    let uid = Uid::from_raw(identity.uid);

    // Supplementary groups survive setresgid; only root can clear them.
    if unistd::geteuid().is_root() {
        unistd::setgroups(&[gid]).map_err(DropFailure::Groups)?;
    }
    unistd::setresgid(gid, gid, gid).map_err(DropFailure::Gid)?;
    unistd::setresuid(uid, uid, uid).map_err(DropFailure::Uid)?;

    verify(uid, gid)
}

fn apply_label(label: &str) -> Result<(), DropFailure> {
    std::fs::write(CURRENT_CONTEXT, label.as_bytes()).map_err(|e| {
        DropFailure::Label(e.raw_os_error().map_or(Errno::EINVAL, Errno::from_raw))
    })
}

fn verify(uid: Uid, gid: Gid) -> Result<(), DropFailure> {
    let ids = unistd::getresuid().map_err(|_| DropFailure::Verify)?;
    let gids = unistd::getresgid().map_err(|_| DropFailure::Verify)?;
    let uid_ok = ids.real == uid && ids.effective == uid && ids.saved == uid;
    let gid_ok = gids.real == gid && gids.effective == gid && gids.saved == gid;
    if !(uid_ok && gid_ok) {
        return Err(DropFailure::Verify);
    }

    // A non-root target must not be able to climb back.
    if !uid.is_root() && unistd::setuid(Uid::from_raw(0)).is_ok() {
        return Err(DropFailure::Verify);
    }
    Ok(())
}
