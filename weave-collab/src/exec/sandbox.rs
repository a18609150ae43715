//! Subprocess sandbox for submitted programs.
//!
//! Each request gets a fresh directory under the configured work root,
//! removed when its [`EphemeralDir`] guard drops. Programs run with a
//! cleared environment, no stdin, the ephemeral directory as cwd, `HOME`
//! and `TMPDIR`, and in a process group of their own that is killed as
//! soon as the program exits or the run is abandoned.
//!
//! On Unix, resource limits and the user switch are applied between fork
//! and exec. On Linux the program is also confined to its directory with
//! Landlock and cut off from the network with a private namespace, when
//! the kernel and the server's privileges allow it.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use uuid::Uuid;

#[cfg(target_os = "linux")]
use super::isolation;
use super::ExecError;

/// Appended to output cut at the byte cap.
pub const TRUNCATED_MARKER: &str = "[output truncated]";

/// `nobody` on most distributions.
pub const NOBODY: u32 = 65534;

/// Per-process resource limits. `None` leaves the inherited limit alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// RLIMIT_CPU, seconds of CPU time
    pub cpu_secs: Option<u64>,
    /// RLIMIT_AS, bytes of address space
    pub address_space_bytes: Option<u64>,
    /// RLIMIT_FSIZE, largest file the program may write
    pub file_size_bytes: Option<u64>,
    /// RLIMIT_NPROC, processes for the running user
    pub max_processes: Option<u64>,
    /// Run as this uid (requires privileges)
    pub uid: Option<u32>,
    /// Run as this gid (requires privileges)
    pub gid: Option<u32>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_secs: Some(10),
            // The default java commands cap the heap to fit under this
            address_space_bytes: Some(2 * 1024 * 1024 * 1024),
            file_size_bytes: Some(16 * 1024 * 1024),
            max_processes: None,
            uid: None,
            gid: None,
        }
    }
}

#[cfg(unix)]
macro_rules! set_limit {
    ($resource:expr, $value:expr) => {{
        let limit = libc::rlimit {
            rlim_cur: $value as libc::rlim_t,
            rlim_max: $value as libc::rlim_t,
        };
        if unsafe { libc::setrlimit($resource, &limit) } != 0 {
            return Err(io::Error::last_os_error());
        }
    }};
}

impl ResourceLimits {
    /// Apply the limits to the current process. Runs in the forked child,
    /// so it must not allocate.
    #[cfg(unix)]
    fn apply(&self) -> io::Result<()> {
        if let Some(secs) = self.cpu_secs {
            set_limit!(libc::RLIMIT_CPU, secs);
        }
        if let Some(bytes) = self.address_space_bytes {
            set_limit!(libc::RLIMIT_AS, bytes);
        }
        if let Some(bytes) = self.file_size_bytes {
            set_limit!(libc::RLIMIT_FSIZE, bytes);
        }
        if let Some(count) = self.max_processes {
            set_limit!(libc::RLIMIT_NPROC, count);
        }
        Ok(())
    }
}

/// Filesystem, network and identity restrictions.
///
/// ```toml
/// [execution.isolation]
/// restrict_filesystem = true
/// read_only_paths = ["/bin", "/usr", "/lib", "/etc"]
/// read_write_paths = ["/dev"]
/// isolate_network = true
/// drop_root = true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Isolation {
    /// Confine programs to their directory and the paths below (Linux, Landlock)
    pub restrict_filesystem: bool,
    pub read_only_paths: Vec<PathBuf>,
    pub read_write_paths: Vec<PathBuf>,
    /// Run programs in an empty network namespace (Linux, needs CAP_SYS_ADMIN)
    pub isolate_network: bool,
    /// Run programs as `nobody` when the server is root and no uid is set
    pub drop_root: bool,
}

impl Default for Isolation {
    fn default() -> Self {
        Self {
            restrict_filesystem: true,
            read_only_paths: ["/bin", "/usr", "/lib", "/lib64", "/etc", "/opt", "/proc", "/sys"]
                .into_iter()
                .map(PathBuf::from)
                .collect(),
            read_write_paths: vec![PathBuf::from("/dev")],
            isolate_network: true,
            drop_root: true,
        }
    }
}

impl Isolation {
    /// No restrictions beyond resource limits.
    pub fn none() -> Self {
        Self {
            restrict_filesystem: false,
            read_only_paths: Vec::new(),
            read_write_paths: Vec::new(),
            isolate_network: false,
            drop_root: false,
        }
    }
}

/// The uid and gid programs run as, given the configured ones.
fn resolve_identity(limits: &ResourceLimits, drop_root: bool, is_root: bool) -> (Option<u32>, Option<u32>) {
    match (limits.uid, limits.gid) {
        (None, None) if drop_root && is_root => (Some(NOBODY), Some(NOBODY)),
        ids => ids,
    }
}

#[cfg(unix)]
fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}

#[cfg(target_os = "linux")]
type FilesystemRules = landlock::RulesetCreated;

#[cfg(not(target_os = "linux"))]
type FilesystemRules = ();

/// A uniquely named directory that is removed on drop.
#[derive(Debug)]
pub struct EphemeralDir {
    path: PathBuf,
}

impl EphemeralDir {
    pub fn create(root: &Path) -> io::Result<Self> {
        let path = root.join(format!("run-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&path)?;
        log::trace!("Created ephemeral dir {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for EphemeralDir {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => log::trace!("Removed ephemeral dir {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove ephemeral dir {}: {e}", self.path.display()),
        }
    }
}

/// Kills every process in a child's group, once, at the latest on drop.
struct ProcessGroup(AtomicI32);

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        let pgid = child.id().and_then(|id| i32::try_from(id).ok()).unwrap_or(0);
        Self(AtomicI32::new(pgid))
    }

    fn kill(&self) {
        let pgid = self.0.swap(0, Ordering::AcqRel);
        #[cfg(unix)]
        if pgid > 0 {
            // ESRCH only means the group is already gone
            unsafe {
                libc::killpg(pgid, libc::SIGKILL);
            }
        }
        #[cfg(not(unix))]
        let _ = pgid;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// What a finished process left behind.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// stderr if there is any, otherwise a description of the exit status.
    pub fn diagnostic(&self) -> String {
        if !self.stderr.trim().is_empty() {
            return self.stderr.clone();
        }
        match self.status.code() {
            Some(code) => format!("Process exited with status {code}"),
            None => "Process terminated by signal".to_string(),
        }
    }
}

/// Launches programs under the configured restrictions.
#[derive(Debug)]
pub struct Sandbox {
    limits: ResourceLimits,
    isolation: Isolation,
    uid: Option<u32>,
    gid: Option<u32>,
    filesystem_isolated: bool,
    network_isolated: bool,
    path_env: String,
    max_output_bytes: usize,
    spawned: AtomicU64,
}

impl Sandbox {
    /// Resolve what the host supports. Requested isolation the host cannot
    /// provide is logged and skipped.
    pub fn new(
        limits: ResourceLimits,
        isolation: Isolation,
        path_env: impl Into<String>,
        max_output_bytes: usize,
    ) -> Self {
        let filesystem_isolated = isolation.restrict_filesystem && filesystem_available();
        if isolation.restrict_filesystem && !filesystem_isolated {
            log::warn!("Landlock is not available, programs can reach the whole filesystem");
        }
        let network_isolated = isolation.isolate_network && network_available();
        if isolation.isolate_network && !network_isolated {
            log::warn!("Cannot create network namespaces (needs CAP_SYS_ADMIN), programs keep network access");
        }

        let (uid, gid) = resolve_identity(&limits, isolation.drop_root, is_root());
        if uid.is_none() && is_root() {
            log::warn!("Programs will run as root; set execution.limits.uid or enable drop_root");
        }
        log::debug!(
            "Sandbox: filesystem {}, network {}, uid {uid:?}, gid {gid:?}",
            if filesystem_isolated { "confined" } else { "open" },
            if network_isolated { "isolated" } else { "shared" },
        );

        Self {
            limits,
            isolation,
            uid,
            gid,
            filesystem_isolated,
            network_isolated,
            path_env: path_env.into(),
            max_output_bytes,
            spawned: AtomicU64::new(0),
        }
    }

    /// Processes started so far.
    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    /// Whether programs are confined to their directory.
    pub fn filesystem_isolated(&self) -> bool {
        self.filesystem_isolated
    }

    /// Whether programs run without network access.
    pub fn network_isolated(&self) -> bool {
        self.network_isolated
    }

    /// The uid programs run as, if it differs from the server's.
    pub fn run_as(&self) -> Option<u32> {
        self.uid
    }

    /// Create a request directory under `root`, owned by the program's user.
    pub fn stage(&self, root: &Path) -> Result<EphemeralDir, ExecError> {
        let dir = EphemeralDir::create(root)?;
        #[cfg(unix)]
        if self.uid.is_some() || self.gid.is_some() {
            use std::os::unix::fs::PermissionsExt;

            // The program's user has to traverse the root to reach its directory
            let mode = std::fs::metadata(root)?.permissions().mode();
            if mode & 0o001 == 0 {
                std::fs::set_permissions(root, std::fs::Permissions::from_mode(mode | 0o111))?;
            }
            std::os::unix::fs::chown(dir.path(), self.uid, self.gid)?;
        }
        Ok(dir)
    }

    /// Run `argv` in `dir` to completion and capture its output.
    ///
    /// Whatever the program started is killed once it exits. Dropping the
    /// returned future kills the whole group too.
    pub async fn run(&self, argv: &[String], dir: &Path) -> Result<ProcessOutput, ExecError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ExecError::EmptyCommand(String::new()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(dir)
            .env_clear()
            .env("PATH", &self.path_env)
            .env("HOME", dir)
            .env("TMPDIR", dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        self.restrict(&mut cmd, dir)?;

        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            program: program.clone(),
            source,
        })?;
        self.spawned.fetch_add(1, Ordering::Relaxed);
        log::debug!("Spawned {program} (pid {:?}) in {}", child.id(), dir.display());

        let group = ProcessGroup::of(&child);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let cap = self.max_output_bytes;
        let exited = async {
            let status = child.wait().await;
            // Background processes would otherwise hold the pipes open
            group.kill();
            status
        };
        let (stdout, stderr, status) =
            tokio::join!(read_capped(stdout, cap), read_capped(stderr, cap), exited);

        Ok(ProcessOutput {
            status: status?,
            stdout: stdout?,
            stderr: stderr?,
        })
    }

    #[cfg(unix)]
    fn restrict(&self, cmd: &mut Command, dir: &Path) -> Result<(), ExecError> {
        cmd.process_group(0);

        let limits = self.limits;
        let (uid, gid) = (self.uid, self.gid);
        let network = self.network_isolated;
        let rules = std::sync::Mutex::new(self.filesystem_rules(dir)?);

        // SAFETY: the hook only makes async-signal-safe calls. The ruleset
        // is built before fork and enforced without allocating.
        unsafe {
            cmd.pre_exec(move || {
                limits.apply()?;
                #[cfg(target_os = "linux")]
                if network {
                    isolation::enter_network_namespace()?;
                }
                drop_privileges(uid, gid)?;
                let rules = rules.lock().ok().and_then(|mut r| r.take());
                #[cfg(target_os = "linux")]
                if let Some(rules) = rules {
                    isolation::enforce_filesystem(rules)?;
                }
                #[cfg(not(target_os = "linux"))]
                let _ = (network, rules);
                Ok(())
            });
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn restrict(&self, _cmd: &mut Command, _dir: &Path) -> Result<(), ExecError> {
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn filesystem_rules(&self, dir: &Path) -> Result<Option<FilesystemRules>, ExecError> {
        if !self.filesystem_isolated {
            return Ok(None);
        }
        isolation::filesystem_rules(&self.isolation.read_only_paths, &self.isolation.read_write_paths, dir)
            .map(Some)
            .map_err(|e| ExecError::Isolation(e.to_string()))
    }

    #[cfg(not(target_os = "linux"))]
    fn filesystem_rules(&self, _dir: &Path) -> Result<Option<FilesystemRules>, ExecError> {
        let _ = &self.isolation;
        Ok(None)
    }
}

#[cfg(target_os = "linux")]
fn filesystem_available() -> bool {
    isolation::filesystem_supported()
}

#[cfg(target_os = "linux")]
fn network_available() -> bool {
    isolation::network_supported()
}

#[cfg(not(target_os = "linux"))]
fn filesystem_available() -> bool {
    false
}

#[cfg(not(target_os = "linux"))]
fn network_available() -> bool {
    false
}

/// Switch to the program's user. Runs in the forked child.
#[cfg(unix)]
fn drop_privileges(uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
    unsafe {
        if (uid.is_some() || gid.is_some()) && libc::geteuid() == 0 && libc::setgroups(0, std::ptr::null()) != 0 {
            return Err(io::Error::last_os_error());
        }
        if let Some(gid) = gid {
            if libc::setgid(gid) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        if let Some(uid) = uid {
            if libc::setuid(uid) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }
    Ok(())
}

/// Read a stream to its end, keeping at most `cap` bytes.
///
/// The rest is drained and discarded so the writer never blocks on a full
/// pipe.
async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>, cap: usize) -> io::Result<String> {
    let Some(mut reader) = reader else {
        return Ok(String::new());
    };

    let mut kept = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let room = cap.saturating_sub(kept.len());
        if n > room {
            truncated = true;
        }
        kept.extend_from_slice(&chunk[..n.min(room)]);
    }

    let mut text = String::from_utf8_lossy(&kept).into_owned();
    if truncated {
        if !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(TRUNCATED_MARKER);
    }
    Ok(text)
}
