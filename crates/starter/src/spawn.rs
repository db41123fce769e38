//! Starting a job process: fork, then in the child drop to the job's
//! identity, rearrange descriptors and exec.
//!
//! Everything the child touches is built before `fork()`; the child itself
//! only makes async-signal-safe calls and never returns.

use std::ffi::CString;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::ptr;

use ckpt_signals::SignalSet;
use libc::c_char;
use nix::errno::Errno;
use nix::unistd::Pid;
use tracing::debug;

use crate::error::{StarterError, StarterResult};
use crate::exit::JOB_EXEC_FAILED;
use crate::priv_state::{Identity, PrivGuard};

/// Where a channel-using job finds its remote-syscall socket.
pub const RSC_SOCK: RawFd = 3;
/// Where the checkpoint runtime writes its log.
pub const CLIENT_LOG: RawFd = 4;
/// Read end of the startup command pipe.
pub const CMD_PIPE_FD: RawFd = 14;
/// Exit code of a child that would have run the job as root.
pub const REFUSED_ROOT_EXIT: i32 = 4;

/// Sources are parked at or above this while targets are filled, so a
/// source can never be clobbered by an earlier target.
const PARK_BASE: RawFd = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdAction {
    /// Make `to` a copy of `from` in the child.
    Dup { from: RawFd, to: RawFd },
    Close(RawFd),
}

/// Everything the child needs to become the job.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: PathBuf,
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
    pub identity: Identity,
    pub fd_actions: Vec<FdAction>,
    /// Signal mask the job starts with.
    pub blocked: SignalSet,
    pub nice: i32,
    /// Core size limit in bytes.
    pub core_limit: Option<u64>,
    pub allow_root: bool,
}

fn cstring(bytes: impl Into<Vec<u8>>, what: &str) -> StarterResult<CString> {
    CString::new(bytes).map_err(|_| StarterError::JobAd(format!("{what} contains a NUL byte")))
}

fn null_terminated(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

/// The spec flattened into C strings, plus scratch space for the child.
struct Prepared {
    program: CString,
    cwd: CString,
    // Own the strings the pointer arrays point into.
    _argv: Vec<CString>,
    _envp: Vec<CString>,
    argv_ptrs: Vec<*const c_char>,
    envp_ptrs: Vec<*const c_char>,
    parked: Vec<RawFd>,
    limit: Option<libc::rlimit>,
}

impl Prepared {
    fn new(spec: &SpawnSpec) -> StarterResult<Self> {
        let argv = spec
            .argv
            .iter()
            .map(|a| cstring(a.as_str(), "argument"))
            .collect::<StarterResult<Vec<_>>>()?;
        let envp = spec
            .env
            .iter()
            .map(|(k, v)| cstring(format!("{k}={v}"), "environment entry"))
            .collect::<StarterResult<Vec<_>>>()?;
        let limit = spec.core_limit.map(|bytes| {
            let bytes = bytes as libc::rlim_t;
            libc::rlimit {
                rlim_cur: bytes,
                rlim_max: bytes,
            }
        });
        Ok(Self {
            program: cstring(spec.program.as_os_str().as_bytes(), "program path")?,
            cwd: cstring(spec.cwd.as_os_str().as_bytes(), "working directory")?,
            argv_ptrs: null_terminated(&argv),
            envp_ptrs: null_terminated(&envp),
            _argv: argv,
            _envp: envp,
            parked: vec![-1; spec.fd_actions.len()],
            limit,
        })
    }
}

fn child_fail(what: &str) -> ! {
    let errno = Errno::last() as i32;
    safe_fmt::die(
        2,
        JOB_EXEC_FAILED,
        "starter: %s failed in job child: errno %d\n",
        &[what.into(), errno.into()],
    )
}

/// Runs in the forked child.
fn exec_child(spec: &SpawnSpec, p: &mut Prepared) -> ! {
    // SAFETY: every call below is async-signal-safe and works on memory
    // prepared before the fork; the child ends in execve or _exit.
    unsafe {
        libc::sigprocmask(libc::SIG_SETMASK, spec.blocked.as_raw(), ptr::null_mut());
        if spec.nice != 0 {
            libc::nice(spec.nice);
        }
        if let Some(limit) = &p.limit {
            libc::setrlimit(libc::RLIMIT_CORE, limit);
        }
        if libc::chdir(p.cwd.as_ptr()) != 0 {
            child_fail("chdir");
        }

        let gid = spec.identity.gid as libc::gid_t;
        if libc::geteuid() == 0 && libc::setgroups(1, &gid) != 0 {
            child_fail("setgroups");
        }
        if libc::setgid(gid) != 0 {
            child_fail("setgid");
        }
        if libc::setuid(spec.identity.uid as libc::uid_t) != 0 {
            child_fail("setuid");
        }
        if !spec.allow_root && (libc::getuid() == 0 || libc::geteuid() == 0) {
            safe_fmt::die(
                2,
                REFUSED_ROOT_EXIT,
                "starter: refusing to run job as root\n",
                &[],
            );
        }

        for (action, slot) in spec.fd_actions.iter().zip(p.parked.iter_mut()) {
            if let FdAction::Dup { from, .. } = action {
                *slot = libc::fcntl(*from, libc::F_DUPFD_CLOEXEC, PARK_BASE);
                if *slot < 0 {
                    libc::_exit(JOB_EXEC_FAILED);
                }
            }
        }
        for action in &spec.fd_actions {
            if let FdAction::Close(fd) = action {
                libc::close(*fd);
            }
        }
        for (action, parked) in spec.fd_actions.iter().zip(p.parked.iter()) {
            if let FdAction::Dup { to, .. } = action
                && libc::dup2(*parked, *to) < 0
            {
                libc::_exit(JOB_EXEC_FAILED);
            }
        }

        libc::execve(p.program.as_ptr(), p.argv_ptrs.as_ptr(), p.envp_ptrs.as_ptr());
        libc::_exit(JOB_EXEC_FAILED)
    }
}

/// Fork and exec the job described by `spec`. Setup failures in the child
/// show up as its exit status: [`JOB_EXEC_FAILED`], or [`REFUSED_ROOT_EXIT`].
pub fn spawn_dropping_privilege(spec: &SpawnSpec) -> StarterResult<Pid> {
    let mut prepared = Prepared::new(spec)?;
    // The child needs root as its effective user to change ids.
    let _root = PrivGuard::root().map_err(StarterError::os("seteuid"))?;

    // SAFETY: the child branch only runs exec_child, which is restricted to
    // async-signal-safe calls.
    let pid = unsafe { libc::fork() };
    match pid {
        -1 => Err(StarterError::Os {
            op: "fork",
            errno: Errno::last(),
        }),
        0 => exec_child(spec, &mut prepared),
        pid => {
            debug!(pid, program = %spec.program.display(), "job process forked");
            Ok(Pid::from_raw(pid))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Read;
    use std::os::fd::AsRawFd;

    use nix::fcntl::OFlag;
    use nix::sys::wait::{WaitStatus, waitpid};

    use super::*;

    fn pipe() -> nix::Result<(std::os::fd::OwnedFd, std::os::fd::OwnedFd)> {
        nix::unistd::pipe2(OFlag::O_CLOEXEC)
    }

    fn spec(program: &str, argv: &[&str]) -> SpawnSpec {
        SpawnSpec {
            program: program.into(),
            argv: argv.iter().map(|s| s.to_string()).collect(),
            env: vec![("PATH".into(), "/bin:/usr/bin".into())],
            cwd: "/".into(),
            identity: Identity::current(),
            fd_actions: Vec::new(),
            blocked: SignalSet::empty(),
            nice: 0,
            core_limit: None,
            allow_root: true,
        }
    }

    fn exit_code(pid: Pid) -> i32 {
        match waitpid(pid, None).unwrap() {
            WaitStatus::Exited(_, code) => code,
            other => panic!("unexpected wait status {other:?}"),
        }
    }

    /// Run `spec` with stdout on a pipe; returns (exit code, output).
    fn run_captured(mut spec: SpawnSpec) -> (i32, String) {
        let (r, w) = pipe().unwrap();
        spec.fd_actions.push(FdAction::Dup {
            from: w.as_raw_fd(),
            to: 1,
        });
        let pid = spawn_dropping_privilege(&spec).unwrap();
        drop(w);
        let mut out = String::new();
        File::from(r).read_to_string(&mut out).unwrap();
        (exit_code(pid), out)
    }

    #[test]
    fn exit_code_reaches_parent() {
        let pid = spawn_dropping_privilege(&spec("/bin/sh", &["sh", "-c", "exit 7"])).unwrap();
        assert_eq!(exit_code(pid), 7);
    }

    #[test]
    fn exec_failure_uses_reserved_code() {
        let pid = spawn_dropping_privilege(&spec("/nonexistent/job", &["job"])).unwrap();
        assert_eq!(exit_code(pid), JOB_EXEC_FAILED);
    }

    #[test]
    fn bad_cwd_uses_reserved_code() {
        let mut s = spec("/bin/sh", &["sh", "-c", "exit 0"]);
        s.cwd = "/nonexistent/dir".into();
        let pid = spawn_dropping_privilege(&s).unwrap();
        assert_eq!(exit_code(pid), JOB_EXEC_FAILED);
    }

    #[test]
    fn root_job_refused_unless_allowed() {
        if !Identity::current().is_root() {
            return;
        }
        let mut s = spec("/bin/sh", &["sh", "-c", "exit 0"]);
        s.allow_root = false;
        let pid = spawn_dropping_privilege(&s).unwrap();
        assert_eq!(exit_code(pid), REFUSED_ROOT_EXIT);
    }

    #[test]
    fn argv_env_cwd_and_stdout_remap() {
        let mut s = spec(
            "/bin/sh",
            &["job.0.1", "-c", r#"echo "$0 $1 $FOO $(pwd)""#, "arg1"],
        );
        s.env.push(("FOO".into(), "bar".into()));
        s.cwd = "/tmp".into();
        let (code, out) = run_captured(s);
        assert_eq!(code, 0);
        let want_cwd = std::fs::canonicalize("/tmp").unwrap();
        assert_eq!(out, format!("job.0.1 arg1 bar {}\n", want_cwd.display()));
    }

    #[test]
    fn job_starts_with_requested_mask() {
        let mut s = spec("/bin/cat", &["cat", "/proc/self/status"]);
        s.blocked = SignalSet::from_signals(&ckpt_signals::RESTART_SIGNALS);
        let (code, out) = run_captured(s);
        assert_eq!(code, 0);
        let blk = out
            .lines()
            .find_map(|l| l.strip_prefix("SigBlk:"))
            .unwrap()
            .trim();
        let mask = u64::from_str_radix(blk, 16).unwrap();
        let bit = |sig: i32| 1u64 << (sig - 1);
        assert_eq!(mask, bit(libc::SIGUSR1) | bit(libc::SIGUSR2) | bit(libc::SIGTSTP));
    }

    #[test]
    fn close_and_high_dup() {
        let (r, w) = pipe().unwrap();
        let mut s = spec("/bin/sh", &["sh", "-c", "echo hi >&9; echo gone >&3 || true"]);
        s.fd_actions = vec![
            FdAction::Dup {
                from: w.as_raw_fd(),
                to: 9,
            },
            FdAction::Close(RSC_SOCK),
        ];
        let pid = spawn_dropping_privilege(&s).unwrap();
        drop(w);
        let mut out = String::new();
        File::from(r).read_to_string(&mut out).unwrap();
        assert_eq!(exit_code(pid), 0);
        assert_eq!(out, "hi\n");
    }

    #[test]
    fn nul_in_argument_is_rejected() {
        let s = spec("/bin/sh", &["sh", "a\0b"]);
        assert!(matches!(
            spawn_dropping_privilege(&s),
            Err(StarterError::JobAd(_))
        ));
    }
}
