//! Per-launch task environment.
//!
//! [`TaskEnv`] aggregates everything the launcher and the in-container
//! configurator need: namespace descriptors, credentials, capability
//! sets, resource limits, scheduling knobs, mounts, devices and stdio.
//! It lives only for the duration of one start sequence; descriptors are
//! closed at exec or abort.

use std::collections::HashMap;
use std::path::PathBuf;

use caps::Capability;
use nix::mount::MsFlags;
use nix::sys::resource::Resource;
use nix::unistd::{Gid, Uid};

use crate::netns::NsKind;

/// One rlimit to apply in the child.
#[derive(Debug, Clone, Copy)]
pub struct Ulimit {
    pub resource: Resource,
    pub soft: u64,
    pub hard: u64,
}

/// Capability sets applied in order: ambient, bounding, then (for
/// non-root tasks) the effective/permitted/inheritable sets.
#[derive(Debug, Clone, Default)]
pub struct CapSpec {
    pub ambient: Vec<Capability>,
    pub bounding: Vec<Capability>,
    pub effective: Vec<Capability>,
}

/// Scheduling and OOM knobs applied by the intermediary before namespace
/// entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedSpec {
    /// `SCHED_OTHER`/`SCHED_RR`/... ; `None` keeps the inherited policy.
    pub policy: Option<i32>,
    pub priority: i32,
    pub nice: Option<i32>,
    /// Packed ioprio value for `ioprio_set(2)`.
    pub ioprio: Option<u32>,
    pub oom_score_adj: Option<i32>,
}

/// One mount performed inside the new mount namespace.
#[derive(Debug, Clone)]
pub struct MountSpec {
    pub source: Option<PathBuf>,
    pub target: PathBuf,
    pub fstype: Option<String>,
    pub flags: MsFlags,
    pub data: Option<String>,
}

/// One device node created inside the container.
#[derive(Debug, Clone)]
pub struct DeviceSpec {
    pub path: PathBuf,
    pub block: bool,
    pub major: u64,
    pub minor: u64,
    pub mode: u32,
}

/// Stdio targets; `None` keeps the inherited descriptor.
#[derive(Debug, Clone, Default)]
pub struct StdioSpec {
    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
}

/// Credentials of the user command.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub uid: Uid,
    pub gid: Gid,
    pub groups: Vec<Gid>,
    /// Written to `/proc/self/loginuid` before dropping privileges.
    pub loginuid: Option<u32>,
}

impl Default for Credentials {
    fn default() -> Self {
        Credentials {
            uid: Uid::current(),
            gid: Gid::current(),
            groups: Vec::new(),
            loginuid: None,
        }
    }
}

/// Everything one launch needs. Built by the container layer, consumed by
/// `launcher::start_task`.
#[derive(Debug, Default)]
pub struct TaskEnv {
    pub container: String,
    /// argv[0] plus arguments after expansion, or a raw command line to
    /// split with `$VAR` expansion against `env`.
    pub command: String,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,

    /// Namespace descriptors to join, opened from the leader of the
    /// shared container or the named netns.
    pub namespaces: HashMap<NsKind, std::os::fd::OwnedFd>,
    /// `cgroup.procs` files the intermediary attaches itself to.
    pub cgroups: Vec<PathBuf>,

    pub credentials: Credentials,
    pub capabilities: CapSpec,
    pub ulimits: Vec<Ulimit>,
    pub sched: SchedSpec,

    pub isolate: bool,
    pub new_mount_ns: bool,
    pub hostname: Option<String>,
    pub root: Option<PathBuf>,

    pub mounts: Vec<MountSpec>,
    pub sysctls: Vec<(String, String)>,
    pub devices: Vec<DeviceSpec>,
    pub resolv_conf: Option<String>,

    pub stdio: StdioSpec,
    pub umask: Option<u32>,

    /// Extra fork in the intermediary so the clone parent can exit and an
    /// init takes over inside the pid namespace.
    pub triple_fork: bool,
    /// Extra fork in the clone child so `portoinit --wait` supervises the
    /// user process.
    pub quadro_fork: bool,

    /// Interfaces to wait on for router-advertised IPv6 addresses.
    pub autoconf_ifaces: Vec<String>,
    pub autoconf_timeout_s: u64,

    /// Descriptor of the `portoinit` binary for `fexecve`.
    pub portoinit_fd: Option<std::os::fd::OwnedFd>,
    /// Meta containers exec portoinit instead of a user command.
    pub meta: bool,

    pub start_timeout_ms: u64,
}

impl TaskEnv {
    /// Clone flags for the task per the isolation request: a fresh
    /// PID+IPC pair when isolating, a mount namespace on request, and a
    /// UTS namespace whenever the hostname diverges.
    pub fn clone_flags(&self) -> nix::sched::CloneFlags {
        use nix::sched::CloneFlags;
        let mut flags = CloneFlags::empty();
        if self.isolate {
            flags |= CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWIPC;
        }
        if self.new_mount_ns {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.isolate || self.hostname.is_some() {
            flags |= CloneFlags::CLONE_NEWUTS;
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sched::CloneFlags;

    #[test]
    fn clone_flags_follow_isolation() {
        let mut env = TaskEnv::default();
        assert_eq!(env.clone_flags(), CloneFlags::empty());

        env.isolate = true;
        let flags = env.clone_flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(flags.contains(CloneFlags::CLONE_NEWIPC));
        assert!(flags.contains(CloneFlags::CLONE_NEWUTS));
        assert!(!flags.contains(CloneFlags::CLONE_NEWNS));

        env.isolate = false;
        env.hostname = Some("ct1".to_string());
        env.new_mount_ns = true;
        let flags = env.clone_flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWUTS));
        assert!(flags.contains(CloneFlags::CLONE_NEWNS));
        assert!(!flags.contains(CloneFlags::CLONE_NEWPID));
    }
}
