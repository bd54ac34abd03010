//! Code that runs inside the cloned container process, between `clone`
//! and `exec`.
//!
//! Everything here executes in a freshly cloned child of the launch
//! intermediary: errors cannot be logged, they are marshalled back to the
//! supervisor over the control socket as the stage-2 report, after which
//! the process exits nonzero. The exec image (argv/envp as C strings) is
//! prepared by the supervisor before any fork so the child allocates as
//! little as possible.

use std::ffi::CString;
use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;

use caps::CapSet;
use nix::mount::{mount, MsFlags};
use nix::sys::resource::setrlimit;
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::stat::{makedev, mknod, umask, Mode, SFlag};
use nix::unistd::{
    chdir, dup2, execvpe, fexecve, fork, getpid, sethostname, setsid, ForkResult, Gid, Uid,
};

use crate::control::ControlSocket;
use crate::error::{Error, ErrorKind, Result};
use crate::netcfg::wait_autoconf;
use crate::task::{DeviceSpec, StdioSpec, TaskEnv};

/// Fully prepared exec arguments; built before fork.
#[derive(Debug)]
pub struct ExecImage {
    pub argv: Vec<CString>,
    pub envp: Vec<CString>,
    /// portoinit argv for meta containers and `--wait` supervision.
    pub init_argv: Vec<CString>,
}

impl ExecImage {
    pub fn build(env: &TaskEnv) -> Result<ExecImage> {
        let words = if env.meta {
            vec!["portoinit".to_string(), "--container".to_string(), env.container.clone()]
        } else {
            expand_command(&env.command, &env.env)?
        };
        if words.is_empty() {
            return Err(Error::new(ErrorKind::InvalidValue, "empty command"));
        }
        let argv = to_cstrings(&words)?;
        let envp = to_cstrings(
            &env.env
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>(),
        )?;
        let init_argv = to_cstrings(&[
            "portoinit".to_string(),
            "--container".to_string(),
            env.container.clone(),
        ])?;
        Ok(ExecImage {
            argv,
            envp,
            init_argv,
        })
    }
}

fn to_cstrings(words: &[String]) -> Result<Vec<CString>> {
    words
        .iter()
        .map(|w| {
            CString::new(w.as_bytes()).map_err(|_| {
                Error::new(ErrorKind::InvalidValue, format!("NUL byte in '{}'", w))
            })
        })
        .collect()
}

/// Quote-aware word splitting with `$VAR`/`${VAR}` expansion from the
/// task environment. Undefined variables and command substitution are
/// rejected; allocation-class failures map to `ResourceNotAvailable`.
pub fn expand_command(command: &str, env: &[(String, String)]) -> Result<Vec<String>> {
    let lookup = |name: &str| -> Result<String> {
        env.iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::InvalidValue,
                    format!("undefined variable '${}'", name),
                )
            })
    };

    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = command.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            ' ' | '\t' | '\n' => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => {
                            return Err(Error::new(
                                ErrorKind::InvalidValue,
                                "unterminated single quote",
                            ))
                        }
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(e @ ('"' | '\\' | '$' | '`')) => current.push(e),
                            Some(e) => {
                                current.push('\\');
                                current.push(e);
                            }
                            None => {
                                return Err(Error::new(
                                    ErrorKind::InvalidValue,
                                    "trailing backslash",
                                ))
                            }
                        },
                        Some('$') => current.push_str(&expand_var(&mut chars, &lookup)?),
                        Some('`') => {
                            return Err(Error::new(
                                ErrorKind::InvalidValue,
                                "command substitution is not allowed",
                            ))
                        }
                        Some(c) => current.push(c),
                        None => {
                            return Err(Error::new(
                                ErrorKind::InvalidValue,
                                "unterminated double quote",
                            ))
                        }
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(e) => current.push(e),
                    None => {
                        return Err(Error::new(ErrorKind::InvalidValue, "trailing backslash"))
                    }
                }
            }
            '$' => {
                in_word = true;
                current.push_str(&expand_var(&mut chars, &lookup)?);
            }
            '`' => {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    "command substitution is not allowed",
                ))
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

fn expand_var<I, F>(chars: &mut std::iter::Peekable<I>, lookup: &F) -> Result<String>
where
    I: Iterator<Item = char>,
    F: Fn(&str) -> Result<String>,
{
    let mut name = String::new();
    if chars.peek() == Some(&'(') {
        return Err(Error::new(
            ErrorKind::InvalidValue,
            "command substitution is not allowed",
        ));
    }
    let braced = chars.peek() == Some(&'{');
    if braced {
        chars.next();
        loop {
            match chars.next() {
                Some('}') => break,
                Some(c) => name.push(c),
                None => return Err(Error::new(ErrorKind::InvalidValue, "unterminated ${")),
            }
        }
    } else {
        while let Some(&c) = chars.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                name.push(c);
                chars.next();
            } else {
                break;
            }
        }
    }
    if name.is_empty() {
        return Ok("$".to_string());
    }
    lookup(&name)
}

/// Which pid stages this process has already put on the wire; aborts
/// fill the rest so the supervisor's serial reads stay aligned.
#[derive(Default)]
struct ChildProgress {
    wpid_sent: bool,
    vpid_sent: bool,
}

/// Entry point of the cloned process. Never returns on success (`exec`);
/// on failure the error is reported at stage 2 and the exit code is 1.
pub fn start_child(
    env: &TaskEnv,
    sock: &mut ControlSocket,
    mut sock2: Option<&mut ControlSocket>,
    image: &ExecImage,
    report_wpid: bool,
) -> isize {
    let mut progress = ChildProgress::default();
    match run_child(env, sock, sock2.as_deref_mut(), image, report_wpid, &mut progress) {
        Ok(never) => match never {},
        Err(e) => {
            abort_child(sock, sock2, report_wpid, &progress, e);
            1
        }
    }
}

/// Flush the unsent pid stages with fillers and ship the error as the
/// stage-2 report.
fn abort_child(
    sock: &mut ControlSocket,
    sock2: Option<&mut ControlSocket>,
    report_wpid: bool,
    progress: &ChildProgress,
    err: Error,
) {
    let me = getpid();
    if report_wpid && !progress.wpid_sent {
        let _ = sock.send_pid(me);
    }
    if !progress.vpid_sent {
        match sock2 {
            // Unblocks the intermediate stuck relaying stage 1.
            Some(s2) => {
                let _ = s2.send_pid(me);
            }
            None => {
                let _ = sock.send_pid(me);
            }
        }
    }
    let _ = sock.send_error(&err);
}

enum Never {}

fn run_child(
    env: &TaskEnv,
    sock: &mut ControlSocket,
    mut sock2: Option<&mut ControlSocket>,
    image: &ExecImage,
    report_wpid: bool,
    progress: &mut ChildProgress,
) -> Result<Never> {
    // Without a pid namespace our pid is the host pid; report it as the
    // waitable stage-0 pid. With one, the intermediary reported stage 0.
    if report_wpid {
        sock.send_pid(getpid())?;
        progress.wpid_sent = true;
        sock.recv_ack()?;
    }

    for limit in &env.ulimits {
        setrlimit(limit.resource, limit.soft, limit.hard)
            .map_err(|e| Error::from_kernel(e as i32, "setrlimit"))?;
    }

    setsid().map_err(|e| Error::from_kernel(e as i32, "setsid"))?;
    umask(Mode::empty());

    if env.new_mount_ns {
        apply_mounts(env)?;
        apply_sysctls(env)?;
        protect_proc()?;
    }

    make_devices(&env.devices)?;

    write_etc(env)?;
    if let Some(hostname) = &env.hostname {
        sethostname(hostname).map_err(|e| Error::from_kernel(e as i32, "sethostname"))?;
    }

    if let Some(cwd) = &env.cwd {
        chdir(cwd.as_path()).map_err(|e| {
            Error::from_kernel(e as i32, &format!("chdir({})", cwd.display()))
        })?;
    }

    if env.quadro_fork {
        quadro_fork(env, image)?;
    }

    // Stage 1: our pid as seen from inside the pid namespace.
    match sock2.as_deref_mut() {
        Some(s2) => {
            s2.send_pid(getpid())?;
            progress.vpid_sent = true;
            s2.recv_ack()?;
        }
        None => {
            sock.send_pid(getpid())?;
            progress.vpid_sent = true;
            sock.recv_ack()?;
        }
    }

    write_loginuid(env)?;
    apply_credentials(env)?;
    apply_capabilities(env)?;

    open_stdio(&env.stdio)?;

    if let Some(mask) = env.umask {
        umask(Mode::from_bits_truncate(mask));
    }

    // Wakeup: the supervisor has reaped the intermediary and recorded the
    // pids; nothing may exec before that.
    sock.recv_ack()?;

    reset_signal_handlers()?;

    for iface in &env.autoconf_ifaces {
        wait_autoconf(
            iface,
            std::time::Duration::from_secs(env.autoconf_timeout_s.max(1)),
        )?;
    }

    exec_task(env, sock, image)
}

fn exec_task(env: &TaskEnv, sock: &ControlSocket, image: &ExecImage) -> Result<Never> {
    if env.meta {
        let fd = env.portoinit_fd.as_ref().ok_or_else(|| {
            Error::new(ErrorKind::InvalidState, "meta container without portoinit")
        })?;
        let err = fexecve(fd.as_raw_fd(), &image.init_argv, &image.envp)
            .map_err(|e| Error::from_kernel(e as i32, "fexecve(portoinit)"))
            .unwrap_err();
        return Err(err);
    }

    let mut keep = vec![0, 1, 2, sock.stream().as_raw_fd()];
    if let Some(fd) = env.portoinit_fd.as_ref() {
        keep.push(fd.as_raw_fd());
    }
    close_extra_fds(&keep);

    let err = execvpe(&image.argv[0], &image.argv, &image.envp)
        .map_err(|e| match e {
            nix::errno::Errno::ENOMEM => Error::with_errno(
                ErrorKind::ResourceNotAvailable,
                libc::ENOMEM,
                "execvpe failed",
            ),
            other => Error::from_kernel(other as i32, "execvpe"),
        })
        .unwrap_err();
    Err(err)
}

/// The meta-container branch keeps running toward `fexecve`; the user
/// command continues in a fresh session of the forked child.
fn quadro_fork(env: &TaskEnv, image: &ExecImage) -> Result<()> {
    let fd = env.portoinit_fd.as_ref().ok_or_else(|| {
        Error::new(ErrorKind::InvalidState, "quadro fork without portoinit")
    })?;
    match unsafe { fork() }.map_err(|e| Error::from_kernel(e as i32, "fork"))? {
        ForkResult::Parent { child } => {
            let wait_arg = CString::new(format!("{}", child.as_raw())).unwrap();
            let argv = [
                CString::new("portoinit").unwrap(),
                CString::new("--wait").unwrap(),
                wait_arg,
            ];
            let e = fexecve(fd.as_raw_fd(), &argv, &image.envp)
                .map_err(|e| Error::from_kernel(e as i32, "fexecve(portoinit)"))
                .unwrap_err();
            Err(e)
        }
        ForkResult::Child => {
            setsid().map_err(|e| Error::from_kernel(e as i32, "setsid"))?;
            Ok(())
        }
    }
}

fn apply_mounts(env: &TaskEnv) -> Result<()> {
    for m in &env.mounts {
        mount(
            m.source.as_deref(),
            m.target.as_path(),
            m.fstype.as_deref(),
            m.flags,
            m.data.as_deref(),
        )
        .map_err(|e| {
            Error::from_kernel(e as i32, &format!("mount({})", m.target.display()))
        })?;
    }
    Ok(())
}

fn apply_sysctls(env: &TaskEnv) -> Result<()> {
    for (key, value) in &env.sysctls {
        let path = format!("/proc/sys/{}", key.replace('.', "/"));
        std::fs::write(&path, value).map_err(|e| {
            Error::with_errno(
                ErrorKind::InvalidValue,
                e.raw_os_error().unwrap_or(0),
                format!("sysctl {} = {}: {}", key, value, e),
            )
        })?;
    }
    Ok(())
}

/// Read-only bind mounts over the writable kernel knobs in `/proc`.
fn protect_proc() -> Result<()> {
    for path in ["/proc/sys", "/proc/sysrq-trigger", "/proc/irq", "/proc/bus"] {
        let p = Path::new(path);
        if !p.exists() {
            continue;
        }
        mount(
            Some(p),
            p,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| Error::from_kernel(e as i32, &format!("bind {}", path)))?;
        mount(
            None::<&str>,
            p,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| Error::from_kernel(e as i32, &format!("remount ro {}", path)))?;
    }
    Ok(())
}

fn make_devices(devices: &[DeviceSpec]) -> Result<()> {
    for dev in devices {
        let kind = if dev.block { SFlag::S_IFBLK } else { SFlag::S_IFCHR };
        mknod(
            dev.path.as_path(),
            kind,
            Mode::from_bits_truncate(dev.mode),
            makedev(dev.major, dev.minor),
        )
        .map_err(|e| {
            Error::from_kernel(e as i32, &format!("mknod({})", dev.path.display()))
        })?;
    }
    Ok(())
}

fn write_etc(env: &TaskEnv) -> Result<()> {
    if let Some(resolv) = &env.resolv_conf {
        std::fs::write("/etc/resolv.conf", resolv).map_err(Error::from)?;
    }
    if let Some(hostname) = &env.hostname {
        std::fs::write("/etc/hostname", format!("{}\n", hostname)).map_err(Error::from)?;
    }
    Ok(())
}

fn write_loginuid(env: &TaskEnv) -> Result<()> {
    if let Some(loginuid) = env.credentials.loginuid {
        // Absent audit support is tolerated.
        let _ = std::fs::write("/proc/self/loginuid", format!("{}", loginuid));
    }
    Ok(())
}

fn apply_credentials(env: &TaskEnv) -> Result<()> {
    let creds = &env.credentials;
    if !creds.groups.is_empty() {
        nix::unistd::setgroups(&creds.groups)
            .map_err(|e| Error::from_kernel(e as i32, "setgroups"))?;
    }
    if creds.gid != Gid::current() || creds.uid != Uid::current() {
        if !env.capabilities.effective.is_empty() {
            // Keep permitted caps across the uid switch.
            unsafe { libc::prctl(libc::PR_SET_KEEPCAPS, 1, 0, 0, 0) };
        }
        nix::unistd::setgid(creds.gid).map_err(|e| Error::from_kernel(e as i32, "setgid"))?;
        nix::unistd::setuid(creds.uid).map_err(|e| Error::from_kernel(e as i32, "setuid"))?;
    }
    Ok(())
}

/// Ambient first, then the bounding drops, then (for non-root tasks) the
/// effective set. Any failure here is fatal for the launch.
fn apply_capabilities(env: &TaskEnv) -> Result<()> {
    let spec = &env.capabilities;

    for cap in &spec.ambient {
        caps::raise(None, CapSet::Inheritable, *cap)
            .and_then(|_| caps::raise(None, CapSet::Ambient, *cap))
            .map_err(|e| {
                Error::new(
                    ErrorKind::Permission,
                    format!("ambient capability {:?}: {}", cap, e),
                )
            })?;
    }

    if !spec.bounding.is_empty() {
        for cap in caps::all() {
            if spec.bounding.contains(&cap) {
                continue;
            }
            caps::drop(None, CapSet::Bounding, cap).map_err(|e| {
                Error::new(
                    ErrorKind::Permission,
                    format!("bounding capability {:?}: {}", cap, e),
                )
            })?;
        }
    }

    if !spec.effective.is_empty() && !env.credentials.uid.is_root() {
        let set = spec.effective.iter().copied().collect();
        caps::set(None, CapSet::Effective, &set).map_err(|e| {
            Error::new(
                ErrorKind::Permission,
                format!("effective capabilities: {}", e),
            )
        })?;
    }
    Ok(())
}

fn open_stdio(stdio: &StdioSpec) -> Result<()> {
    redirect(stdio.stdin.as_deref(), 0, false)?;
    redirect(stdio.stdout.as_deref(), 1, true)?;
    redirect(stdio.stderr.as_deref(), 2, true)?;
    Ok(())
}

fn redirect(path: Option<&Path>, fd: RawFd, write: bool) -> Result<()> {
    let Some(path) = path else { return Ok(()) };
    let file = if write {
        OpenOptions::new()
            .create(true)
            .write(true)
            .append(true)
            .open(path)
    } else {
        OpenOptions::new().read(true).open(path)
    }
    .map_err(|e| {
        Error::with_errno(
            ErrorKind::InvalidValue,
            e.raw_os_error().unwrap_or(0),
            format!("open stdio {}: {}", path.display(), e),
        )
    })?;
    dup2(file.as_raw_fd(), fd).map_err(|e| Error::from_kernel(e as i32, "dup2"))?;
    Ok(())
}

/// Restore default dispositions for every catchable signal.
fn reset_signal_handlers() -> Result<()> {
    for sig in Signal::iterator() {
        if sig == Signal::SIGKILL || sig == Signal::SIGSTOP {
            continue;
        }
        unsafe {
            let _ = signal(sig, SigHandler::SigDfl);
        }
    }
    Ok(())
}

/// Close every descriptor except the given ones before exec.
pub fn close_extra_fds(keep: &[RawFd]) {
    let Ok(entries) = std::fs::read_dir("/proc/self/fd") else {
        return;
    };
    let mut to_close = Vec::new();
    for entry in entries.flatten() {
        if let Some(fd) = entry
            .file_name()
            .to_str()
            .and_then(|s| s.parse::<RawFd>().ok())
        {
            if !keep.contains(&fd) {
                to_close.push(fd);
            }
        }
    }
    for fd in to_close {
        unsafe { libc::close(fd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn splits_plain_words() {
        let words = expand_command("/bin/echo hello   world", &[]).unwrap();
        assert_eq!(words, vec!["/bin/echo", "hello", "world"]);
    }

    #[test]
    fn quotes_group_words() {
        let words = expand_command("sh -c 'echo a b'  \"c  d\"", &[]).unwrap();
        assert_eq!(words, vec!["sh", "-c", "echo a b", "c  d"]);
    }

    #[test]
    fn expands_variables() {
        let e = env(&[("HOME", "/home/ct"), ("NAME", "web")]);
        let words = expand_command("ls $HOME ${NAME}1 \"$HOME/x\"", &e).unwrap();
        assert_eq!(words, vec!["ls", "/home/ct", "web1", "/home/ct/x"]);
    }

    #[test]
    fn undefined_variable_is_invalid_value() {
        let err = expand_command("echo $MISSING", &[]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidValue);
    }

    #[test]
    fn command_substitution_rejected() {
        assert!(expand_command("echo `id`", &[]).is_err());
        assert!(expand_command("echo $(id)", &[]).is_err());
        assert!(expand_command("echo \"`id`\"", &[]).is_err());
    }

    #[test]
    fn unterminated_quotes_rejected() {
        assert!(expand_command("echo 'abc", &[]).is_err());
        assert!(expand_command("echo \"abc", &[]).is_err());
        assert!(expand_command("echo abc\\", &[]).is_err());
    }

    #[test]
    fn escapes_work() {
        let words = expand_command("echo a\\ b \"\\\"x\\\"\"", &[]).unwrap();
        assert_eq!(words, vec!["echo", "a b", "\"x\""]);
    }

    #[test]
    fn lone_dollar_is_literal() {
        let words = expand_command("echo $ end", &[]).unwrap();
        assert_eq!(words, vec!["echo", "$", "end"]);
    }

    #[test]
    fn exec_image_requires_command() {
        let env = TaskEnv::default();
        assert!(ExecImage::build(&env).is_err());

        let env = TaskEnv {
            command: "/bin/true".to_string(),
            ..Default::default()
        };
        let image = ExecImage::build(&env).unwrap();
        assert_eq!(image.argv.len(), 1);
        assert_eq!(image.argv[0].to_str().unwrap(), "/bin/true");
    }

    #[test]
    fn exec_image_expands_env() {
        let env = TaskEnv {
            command: "$SHELL -c hi".to_string(),
            env: vec![("SHELL".to_string(), "/bin/sh".to_string())],
            ..Default::default()
        };
        let image = ExecImage::build(&env).unwrap();
        assert_eq!(image.argv[0].to_str().unwrap(), "/bin/sh");
        assert_eq!(image.envp.len(), 1);
        assert_eq!(image.envp[0].to_str().unwrap(), "SHELL=/bin/sh");
    }
}
