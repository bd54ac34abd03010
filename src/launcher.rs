//! Task launch sequencing.
//!
//! The supervisor forks an intermediary which joins the container's
//! namespaces, applies scheduling and cgroup membership, and clones the
//! task with the requested namespace flags. Pids travel back over the
//! control socket in three strictly serial stages (see [`crate::control`]):
//! the host-side waitable pid, the pid inside the pid namespace, and the
//! final stage-2 report.
//!
//! Without a pid namespace the clone child reports both pids itself (its
//! host pid is its own pid). With triple fork, the post-fork intermediate
//! reports its own pid as stage 0 (it becomes the in-namespace init via
//! `portoinit --wait`), relays the child's stage-1 pid from the second
//! socket pair, and the supervisor ends up with an init it can wait on.
//!
//! All of this is blocking code: call it from a blocking thread.

use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd};
use std::time::Duration;

use nix::sched::{clone, CloneFlags};
use nix::sys::prctl;
use nix::sys::signal::{kill, sigprocmask, SigSet, SigmaskHow, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, chroot, fexecve, fork, getpid, ForkResult, Pid};

use crate::child::{start_child, ExecImage};
use crate::control::ControlSocket;
use crate::error::{Error, ErrorKind, Result};
use crate::netns::NsKind;
use crate::task::TaskEnv;

/// Clone-child stack size.
const CHILD_STACK_SIZE: usize = 1024 * 1024;

/// Pids recorded for a started task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskPids {
    /// Host-side pid the daemon waits on (stage 0).
    pub wait_pid: Pid,
    /// Task pid as reported at stage 1.
    pub task_pid: Pid,
    /// Task pid inside its pid namespace.
    pub task_vpid: Pid,
}

/// Launch the task described by `env`. Returns once the task has passed
/// exec setup; on any failure the intermediary is killed and the child's
/// error is preferred over the local wait status.
pub fn start_task(env: &TaskEnv) -> Result<TaskPids> {
    let image = ExecImage::build(env)?;
    let (mut master, sock) = ControlSocket::pair()?;
    master.set_recv_timeout(Some(Duration::from_millis(
        if env.start_timeout_ms == 0 {
            300_000
        } else {
            env.start_timeout_ms
        },
    )))?;

    let intermediary = match unsafe { fork() }.map_err(|e| Error::from_kernel(e as i32, "fork"))?
    {
        ForkResult::Parent { child } => {
            drop(sock);
            child
        }
        ForkResult::Child => {
            drop(master);
            let code = run_intermediary(env, sock, &image);
            // _exit: no atexit handlers or stdio flushing in the fork.
            unsafe { libc::_exit(code) };
        }
    };

    match supervise(&mut master, intermediary) {
        Ok(pids) => Ok(pids),
        Err(e) => {
            let _ = kill(intermediary, Signal::SIGKILL);
            let _ = waitpid(intermediary, None);
            Err(e)
        }
    }
}

/// Supervisor side of the pid/ack protocol.
fn supervise(master: &mut ControlSocket, intermediary: Pid) -> Result<TaskPids> {
    let wait_pid = master.recv_pid()?;
    master.send_ack()?;

    let task_pid = master.recv_pid()?;
    master.send_ack()?;

    let status = waitpid(intermediary, None)
        .map_err(|e| Error::from_kernel(e as i32, "waitpid(intermediary)"))?;
    let intermediary_failed = !matches!(status, WaitStatus::Exited(_, 0));

    // Wakeup; the peer may already be gone on the failure path.
    let _ = master.send_ack();

    let report = master.recv_error()?;
    if !report.is_success() {
        return Err(report);
    }
    if intermediary_failed {
        return Err(Error::new(
            ErrorKind::Unknown,
            format!("intermediary failed: {:?}", status),
        ));
    }

    Ok(TaskPids {
        wait_pid,
        task_pid,
        task_vpid: task_pid,
    })
}

/// Fill the not-yet-sent pid stages with our own pid so the supervisor's
/// serial reads line up, then ship the error.
fn flush_and_report(sock: &mut ControlSocket, stages_sent: u8, err: &Error) {
    let me = getpid();
    for _ in stages_sent..2 {
        let _ = sock.send_pid(me);
    }
    let _ = sock.send_error(err);
}

/// Runs in the forked intermediary; returns its exit code.
fn run_intermediary(env: &TaskEnv, mut sock: ControlSocket, image: &ExecImage) -> i32 {
    match intermediary_main(env, &mut sock, image) {
        Ok(code) => code,
        Err(e) => {
            flush_and_report(&mut sock, 0, &e);
            1
        }
    }
}

fn intermediary_main(env: &TaskEnv, sock: &mut ControlSocket, image: &ExecImage) -> Result<i32> {
    prctl::set_pdeathsig(Signal::SIGKILL)
        .map_err(|e| Error::from_kernel(e as i32, "prctl(PDEATHSIG)"))?;
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
        .map_err(|e| Error::from_kernel(e as i32, "sigprocmask"))?;

    attach_cgroups(env)?;
    apply_sched(env)?;

    enter_namespaces(env)?;

    if let Some(root) = &env.root {
        chroot(root.as_path())
            .map_err(|e| Error::from_kernel(e as i32, &format!("chroot({})", root.display())))?;
        chdir("/").map_err(|e| Error::from_kernel(e as i32, "chdir(/)"))?;
    }

    if env.triple_fork {
        match unsafe { fork() }.map_err(|e| Error::from_kernel(e as i32, "fork"))? {
            // The direct fork child exits at once so the supervisor can
            // reap it while the intermediate lives on under portoinit.
            ForkResult::Parent { .. } => return Ok(0),
            ForkResult::Child => {
                let mut stages_sent = 0u8;
                return Ok(match run_intermediate(env, sock, image, &mut stages_sent) {
                    Ok(code) => code,
                    Err(e) => {
                        flush_and_report(sock, stages_sent, &e);
                        1
                    }
                });
            }
        }
    }

    // Plain launch: clone the task and get out of the way. The child owns
    // the whole pid protocol from here.
    let _child = clone_task(env, sock, None, image, true)?;
    Ok(0)
}

/// Triple-fork intermediate: reports stage 0, clones the task, relays
/// stage 1 from the in-namespace socket pair, then becomes the init.
fn run_intermediate(
    env: &TaskEnv,
    sock: &mut ControlSocket,
    image: &ExecImage,
    stages_sent: &mut u8,
) -> Result<i32> {
    sock.send_pid(getpid())?;
    *stages_sent = 1;
    sock.recv_ack()?;

    let (mut master2, sock2) = ControlSocket::pair()?;
    let child = clone_task(env, sock, Some(sock2), image, false)?;

    let vpid = master2.recv_pid()?;
    sock.send_pid(vpid)?;
    *stages_sent = 2;
    sock.recv_ack()?;
    master2.send_ack()?;

    become_init(env, image, child)
}

/// Replace the intermediate with `portoinit --wait <pid>`, or fall back
/// to reaping in place when no portoinit descriptor was handed in.
fn become_init(env: &TaskEnv, image: &ExecImage, child: Pid) -> Result<i32> {
    if let Some(fd) = env.portoinit_fd.as_ref() {
        let wait_arg = CString::new(format!("{}", child.as_raw())).unwrap();
        let argv = [
            CString::new("portoinit").unwrap(),
            CString::new("--wait").unwrap(),
            wait_arg,
        ];
        fexecve(fd.as_raw_fd(), &argv, &image.envp)
            .map_err(|e| Error::from_kernel(e as i32, "fexecve(portoinit)"))?;
        unreachable!();
    }
    loop {
        match waitpid(Pid::from_raw(-1), None) {
            Ok(WaitStatus::Exited(pid, code)) if pid == child => return Ok(code),
            Ok(WaitStatus::Signaled(pid, _, _)) if pid == child => return Ok(128),
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(Error::from_kernel(e as i32, "waitpid")),
        }
    }
}

/// Clone the task with the requested namespace flags.
fn clone_task(
    env: &TaskEnv,
    sock: &mut ControlSocket,
    mut sock2: Option<ControlSocket>,
    image: &ExecImage,
    child_reports_wpid: bool,
) -> Result<Pid> {
    let mut flags = env.clone_flags();
    // Joined namespaces must not be unshared again.
    for (kind, flag) in [
        (NsKind::Pid, CloneFlags::CLONE_NEWPID),
        (NsKind::Ipc, CloneFlags::CLONE_NEWIPC),
        (NsKind::Uts, CloneFlags::CLONE_NEWUTS),
        (NsKind::Mnt, CloneFlags::CLONE_NEWNS),
    ] {
        if env.namespaces.contains_key(&kind) {
            flags.remove(flag);
        }
    }

    let mut stack = vec![0u8; CHILD_STACK_SIZE];
    let pid = unsafe {
        clone(
            Box::new(|| start_child(env, &mut *sock, sock2.as_mut(), image, child_reports_wpid)),
            &mut stack,
            flags,
            Some(libc::SIGCHLD),
        )
    }
    .map_err(|e| match e {
        nix::errno::Errno::ENOMEM => {
            Error::with_errno(ErrorKind::ResourceNotAvailable, libc::ENOMEM, "clone")
        }
        other => Error::from_kernel(other as i32, "clone"),
    })?;
    Ok(pid)
}

/// Write our pid into every configured `cgroup.procs`.
fn attach_cgroups(env: &TaskEnv) -> Result<()> {
    let pid = format!("{}", getpid().as_raw());
    for cgroup in &env.cgroups {
        std::fs::write(cgroup, &pid).map_err(|e| {
            Error::with_errno(
                ErrorKind::Unknown,
                e.raw_os_error().unwrap_or(0),
                format!("cgroup attach {}: {}", cgroup.display(), e),
            )
        })?;
    }
    Ok(())
}

fn apply_sched(env: &TaskEnv) -> Result<()> {
    let sched = &env.sched;
    if let Some(adj) = sched.oom_score_adj {
        std::fs::write("/proc/self/oom_score_adj", format!("{}", adj))
            .map_err(|e| Error::new(ErrorKind::Unknown, format!("oom_score_adj: {}", e)))?;
    }
    if let Some(nice) = sched.nice {
        // -1 is a legal return value; only a set errno means failure.
        nix::errno::Errno::clear();
        let res = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) };
        if res == -1 && nix::errno::Errno::last_raw() != 0 {
            return Err(Error::from_kernel(
                nix::errno::Errno::last_raw(),
                "setpriority",
            ));
        }
    }
    if let Some(policy) = sched.policy {
        let param = libc::sched_param {
            sched_priority: sched.priority,
        };
        let res = unsafe { libc::sched_setscheduler(0, policy, &param) };
        if res == -1 {
            return Err(Error::from_kernel(
                nix::errno::Errno::last() as i32,
                "sched_setscheduler",
            ));
        }
    }
    if let Some(ioprio) = sched.ioprio {
        const IOPRIO_WHO_PROCESS: libc::c_int = 1;
        let res = unsafe {
            libc::syscall(libc::SYS_ioprio_set, IOPRIO_WHO_PROCESS, 0, ioprio as libc::c_int)
        };
        if res == -1 {
            return Err(Error::from_kernel(
                nix::errno::Errno::last() as i32,
                "ioprio_set",
            ));
        }
    }
    Ok(())
}

/// Join the configured namespaces in the canonical order. Failure to
/// enter any of them is fatal for the launch.
fn enter_namespaces(env: &TaskEnv) -> Result<()> {
    for kind in [NsKind::Ipc, NsKind::Uts, NsKind::Net, NsKind::Pid, NsKind::Mnt] {
        let Some(fd) = env.namespaces.get(&kind) else {
            continue;
        };
        nix::sched::setns(fd, kind.clone_flag()).map_err(|e| {
            Error::from_kernel(e as i32, &format!("setns({})", kind.name()))
        })?;
    }
    Ok(())
}

/// Open the five namespace descriptors of a running process, keyed for
/// [`TaskEnv::namespaces`].
pub fn open_task_namespaces(
    pid: Pid,
) -> Result<std::collections::HashMap<NsKind, OwnedFd>> {
    let mut out = std::collections::HashMap::new();
    for kind in [NsKind::Net, NsKind::Ipc, NsKind::Uts, NsKind::Pid, NsKind::Mnt] {
        let handle = crate::netns::NamespaceHandle::open(Some(pid), kind)?;
        let file: std::fs::File = handle.into_file();
        out.insert(kind, OwnedFd::from(file));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_flag_suppression_for_joined_namespaces() {
        let mut env = TaskEnv {
            isolate: true,
            ..Default::default()
        };
        assert!(env.clone_flags().contains(CloneFlags::CLONE_NEWPID));

        // Joining another container's pid namespace suppresses NEWPID but
        // keeps the rest.
        let handle =
            crate::netns::NamespaceHandle::open(None, NsKind::Pid).expect("own pid ns opens");
        env.namespaces
            .insert(NsKind::Pid, OwnedFd::from(handle.into_file()));
        let mut flags = env.clone_flags();
        for (kind, flag) in [(NsKind::Pid, CloneFlags::CLONE_NEWPID)] {
            if env.namespaces.contains_key(&kind) {
                flags.remove(flag);
            }
        }
        assert!(!flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(flags.contains(CloneFlags::CLONE_NEWIPC));
    }
}
