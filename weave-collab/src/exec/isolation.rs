//! Linux isolation primitives.
//!
//! Filesystem access is narrowed with a Landlock ruleset: system paths are
//! read-only, the request's directory (plus any configured extras) is
//! read-write, everything else is unreachable. Network access is cut by
//! moving the child into a fresh network namespace, which only holds a
//! downed loopback device.
//!
//! Rulesets are built in the parent, where allocation is fine, and only
//! enforced between fork and exec.

use landlock::{
    Access, AccessFs, CompatLevel, Compatible, PathBeneath, PathFd, Ruleset, RulesetAttr,
    RulesetCreated, RulesetCreatedAttr, RulesetError, ABI,
};
use std::io;
use std::path::{Path, PathBuf};

const LANDLOCK_ABI: ABI = ABI::V1;

/// Whether the kernel enforces Landlock for this process.
pub fn filesystem_supported() -> bool {
    let created = Ruleset::default()
        .set_compatibility(CompatLevel::HardRequirement)
        .handle_access(AccessFs::from_all(LANDLOCK_ABI))
        .and_then(|ruleset| ruleset.create());
    match created {
        Ok(_) => true,
        Err(e) => {
            log::debug!("Landlock unavailable: {e}");
            false
        }
    }
}

/// Whether this process may create a network namespace.
pub fn network_supported() -> bool {
    // SAFETY: the child only makes async-signal-safe calls before _exit.
    unsafe {
        let pid = libc::fork();
        if pid == 0 {
            let code = if libc::unshare(libc::CLONE_NEWNET) == 0 { 0 } else { 1 };
            libc::_exit(code);
        }
        if pid < 0 {
            return false;
        }
        let mut status = 0;
        libc::waitpid(pid, &mut status, 0) == pid
            && libc::WIFEXITED(status)
            && libc::WEXITSTATUS(status) == 0
    }
}

/// Build the ruleset for one request. Paths that do not exist are skipped.
pub fn filesystem_rules(
    read_only: &[PathBuf],
    read_write: &[PathBuf],
    work_dir: &Path,
) -> Result<RulesetCreated, RulesetError> {
    let read = AccessFs::from_read(LANDLOCK_ABI);
    let all = AccessFs::from_all(LANDLOCK_ABI);

    let mut ruleset = Ruleset::default().handle_access(all)?.create()?;
    for path in read_only {
        if let Ok(fd) = PathFd::new(path) {
            ruleset = ruleset.add_rule(PathBeneath::new(fd, read))?;
        }
    }
    for path in read_write.iter().map(PathBuf::as_path).chain(std::iter::once(work_dir)) {
        if let Ok(fd) = PathFd::new(path) {
            ruleset = ruleset.add_rule(PathBeneath::new(fd, all))?;
        }
    }
    Ok(ruleset)
}

/// Enforce `rules` on the calling process. Runs in the forked child.
pub fn enforce_filesystem(rules: RulesetCreated) -> io::Result<()> {
    rules
        .restrict_self()
        .map(|_| ())
        .map_err(|_| io::Error::from_raw_os_error(libc::EPERM))
}

/// Move the calling process into a new network namespace.
pub fn enter_network_namespace() -> io::Result<()> {
    if unsafe { libc::unshare(libc::CLONE_NEWNET) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
