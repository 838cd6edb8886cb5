//! Working directory, umask, and privilege-drop handling (unix-only).
//! The working directory/umask are applied before the listening sockets
//! are bound, and privileges are dropped after: a privileged port may
//! need root to bind, but nothing past that point does.

use nix::sys::stat::{umask, Mode};
use nix::unistd::{chdir, setgid, setgroups, setuid, Group, Uid, User};

use crate::config::{Config, DropPrivileges};
use crate::error::Error;

pub fn apply_working_directory_and_umask(config: &Config) -> Result<(), Error> {
    if let Some(mask) = config.umask {
        umask(Mode::from_bits_truncate(mask));
    }

    if let Some(dir) = &config.working_directory {
        std::fs::create_dir_all(dir).map_err(Error::Io)?;
        chdir(dir.as_path()).map_err(|e| Error::Privilege(format!("chdir to {}: {e}", dir.display())))?;
    }

    Ok(())
}

pub fn drop_privileges_if_needed(target: &DropPrivileges) -> Result<(), Error> {
    if !Uid::effective().is_root() {
        return Ok(());
    }

    let group = Group::from_name(&target.group)
        .map_err(|e| Error::Privilege(format!("group lookup for {}: {e}", target.group)))?
        .ok_or_else(|| Error::Privilege(format!("no such group: {}", target.group)))?;
    let user = User::from_name(&target.user)
        .map_err(|e| Error::Privilege(format!("user lookup for {}: {e}", target.user)))?
        .ok_or_else(|| Error::Privilege(format!("no such user: {}", target.user)))?;

    setgroups(&[]).map_err(|e| Error::Privilege(format!("setgroups: {e}")))?;
    setgid(group.gid).map_err(|e| Error::Privilege(format!("setgid: {e}")))?;
    setuid(user.uid).map_err(|e| Error::Privilege(format!("setuid: {e}")))?;

    Ok(())
}
