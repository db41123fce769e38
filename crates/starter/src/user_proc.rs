//! One job process on this machine, from fetching its executable to
//! cleaning up after it.

use std::fmt;
use std::fs::{self, DirBuilder, File, OpenOptions, Permissions};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt, symlink};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use ckpt_signals::{RESTART_SIGNALS, SignalSet};
use libc::c_int;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::resource::{UsageWho, getrusage};
use nix::sys::signal::{Signal, kill};
use nix::sys::time::TimeValLike;
use nix::unistd::{Pid, pipe2};
use rsc_client::{RemoteError, RemoteSyscalls};
use rsc_proto::{Record, attr};
use tracing::{debug, info, warn};

use crate::ckpt::{CkptEstimate, DiskProbe, ImageUpdater};
use crate::config::StarterConfig;
use crate::error::{StarterError, StarterResult};
use crate::exec_name::{self, ExecLocation};
use crate::exit::{self, JOB_EXEC_FAILED, Termination};
use crate::job::{JobClass, JobInfo, ProcState};
use crate::link_check::{self, LinkVerdict};
use crate::priv_state::PrivGuard;
use crate::spawn::{CLIENT_LOG, CMD_PIPE_FD, FdAction, RSC_SOCK, SpawnSpec, spawn_dropping_privilege};

static DIR_SEQ: AtomicU32 = AtomicU32::new(0);

const UNLINK_ATTEMPTS: u32 = 5;
const UNLINK_RETRY_DELAY: Duration = Duration::from_millis(200);

/// CPU time in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub user_usec: u64,
    pub sys_usec: u64,
}

impl CpuTimes {
    fn add(&mut self, other: CpuTimes) {
        self.user_usec = self.user_usec.saturating_add(other.user_usec);
        self.sys_usec = self.sys_usec.saturating_add(other.sys_usec);
    }

    fn since(self, earlier: CpuTimes) -> CpuTimes {
        CpuTimes {
            user_usec: self.user_usec.saturating_sub(earlier.user_usec),
            sys_usec: self.sys_usec.saturating_sub(earlier.sys_usec),
        }
    }

    pub fn user_secs(&self) -> f64 {
        self.user_usec as f64 / 1e6
    }

    pub fn sys_secs(&self) -> f64 {
        self.sys_usec as f64 / 1e6
    }

    /// Totals over all waited-for children of this process.
    fn children() -> CpuTimes {
        match getrusage(UsageWho::RUSAGE_CHILDREN) {
            Ok(usage) => CpuTimes {
                user_usec: u64::try_from(usage.user_time().num_microseconds()).unwrap_or(0),
                sys_usec: u64::try_from(usage.system_time().num_microseconds()).unwrap_or(0),
            },
            Err(errno) => {
                warn!(%errno, "getrusage failed");
                CpuTimes::default()
            }
        }
    }
}

/// Separates failures that end the conversation with the authority from
/// those that only affect the job.
fn job_level<T>(result: Result<T, RemoteError>) -> StarterResult<Result<T, Errno>> {
    match result {
        Ok(v) => Ok(Ok(v)),
        Err(e @ RemoteError::Protocol(_)) => Err(e.into()),
        Err(e) => Ok(Err(e.errno().unwrap_or(Errno::EIO))),
    }
}

fn errno_of(e: &io::Error) -> Errno {
    e.raw_os_error().map_or(Errno::EIO, Errno::from_raw)
}

/// Remove `path`, waiting out a busy executable. A missing file is fine.
fn unlink_retrying(path: &Path) -> io::Result<()> {
    for _ in 1..UNLINK_ATTEMPTS {
        match fs::remove_file(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) => {
                std::thread::sleep(UNLINK_RETRY_DELAY);
            }
            Err(e) => return Err(e),
        }
    }
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn set_env(env: &mut Vec<(String, String)>, name: &str, value: impl Into<String>) {
    env.retain(|(k, _)| k != name);
    env.push((name.to_string(), value.into()));
}

/// Open the file behind a `local:<path>` or `append:<path>` name for
/// standard descriptor `fd`.
fn open_std_file(fd: RawFd, url: &str) -> io::Result<File> {
    let append = url.starts_with("append:");
    let path = url.rsplit_once(':').map_or(url, |(_, p)| p);
    if fd == 0 {
        return File::open(path);
    }
    let mut opts = OpenOptions::new();
    opts.write(true).create(true).mode(0o664);
    if append {
        opts.append(true);
    } else {
        opts.truncate(true);
    }
    match opts.open(path) {
        Err(e) if !append => {
            debug!(path, error = %e, "open with truncate failed, retrying without");
            OpenOptions::new().write(true).create(true).mode(0o664).open(path)
        }
        other => other,
    }
}

pub struct UserProc {
    info: JobInfo,
    state: ProcState,
    pid: Option<Pid>,
    restart: bool,
    local_dir: PathBuf,
    cur_ckpt: PathBuf,
    tmp_ckpt: PathBuf,
    core_name: Option<PathBuf>,
    env: Vec<(String, String)>,
    /// Raw wait status of the last run.
    exit_status: c_int,
    /// Why the executable could not be fetched.
    fetch_errno: Option<Errno>,
    termination: Option<Termination>,
    exit_requested: bool,
    core_transferred: bool,
    new_ckpt_created: bool,
    ckpt_transferred: bool,
    image_size_kb: u64,
    total_cpu: CpuTimes,
    /// CPU time not yet covered by a stored checkpoint or a clean exit.
    pending_cpu: CpuTimes,
    guaranteed_cpu: CpuTimes,
    children_seen: CpuTimes,
}

impl UserProc {
    /// Set up the private directory and environment for `info`.
    pub fn new(info: JobInfo, config: &StarterConfig) -> StarterResult<Self> {
        let seq = DIR_SEQ.fetch_add(1, Ordering::Relaxed);
        let local_dir = config
            .execute_dir
            .join(format!("dir_{}_{seq}", std::process::id()));
        DirBuilder::new().mode(0o777).create(&local_dir)?;
        // The job owner writes here; umask must not narrow it.
        fs::set_permissions(&local_dir, Permissions::from_mode(0o777))?;

        let base = format!("condor_exec.{}.{}", info.cluster, info.proc_id);
        let cur_ckpt = local_dir.join(&base);
        let tmp_ckpt = local_dir.join(format!("{base}.tmp"));

        let mut env = info.env.clone();
        set_env(&mut env, "CONDOR_SCRATCH_DIR", local_dir.display().to_string());
        if let Some(range) = config.network.port_range {
            set_env(&mut env, "_condor_LOWPORT", range.low.to_string());
            set_env(&mut env, "_condor_HIGHPORT", range.high.to_string());
        }
        let bind_all = if config.network.bind_all_interfaces { "TRUE" } else { "FALSE" };
        set_env(&mut env, "_condor_BIND_ALL_INTERFACES", bind_all);

        info!(
            cluster = info.cluster,
            proc = info.proc_id,
            class = ?info.class,
            owner = %info.owner,
            dir = %local_dir.display(),
            "job process created"
        );
        Ok(Self {
            restart: info.is_restart,
            info,
            state: ProcState::New,
            pid: None,
            local_dir,
            cur_ckpt,
            tmp_ckpt,
            core_name: None,
            env,
            exit_status: 0,
            fetch_errno: None,
            termination: None,
            exit_requested: false,
            core_transferred: false,
            new_ckpt_created: false,
            ckpt_transferred: false,
            image_size_kb: 0,
            total_cpu: CpuTimes::default(),
            pending_cpu: CpuTimes::default(),
            guaranteed_cpu: CpuTimes::default(),
            children_seen: CpuTimes::children(),
        })
    }

    pub fn info(&self) -> &JobInfo {
        &self.info
    }

    pub fn state(&self) -> ProcState {
        self.state
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn local_dir(&self) -> &Path {
        &self.local_dir
    }

    pub fn cur_ckpt(&self) -> &Path {
        &self.cur_ckpt
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn termination(&self) -> Option<Termination> {
        self.termination
    }

    pub fn image_size_kb(&self) -> u64 {
        self.image_size_kb
    }

    pub fn total_cpu(&self) -> CpuTimes {
        self.total_cpu
    }

    pub fn guaranteed_cpu(&self) -> CpuTimes {
        self.guaranteed_cpu
    }

    pub fn is_restart(&self) -> bool {
        self.restart
    }

    pub fn core_created(&self) -> bool {
        self.core_name.is_some()
    }

    pub fn core_transferred(&self) -> bool {
        self.core_transferred
    }

    pub fn new_ckpt_created(&self) -> bool {
        self.new_ckpt_created
    }

    pub fn ckpt_transferred(&self) -> bool {
        self.ckpt_transferred
    }

    fn expect_state(&self, op: &'static str, allowed: &[ProcState]) -> StarterResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(StarterError::State {
                op,
                state: self.state,
            })
        }
    }

    fn short_name(&self) -> String {
        format!("condor_exec.{}.{}", self.info.cluster, self.info.proc_id)
    }

    fn cant_fetch(&mut self, errno: Errno) {
        warn!(%errno, "cannot fetch executable");
        self.fetch_errno = Some(errno);
        self.state = ProcState::CantFetch;
    }

    // -----------------------------------------------------------------------
    // Startup
    // -----------------------------------------------------------------------

    /// Put the executable at `cur_ckpt` and check it. Ends in `Runnable`,
    /// `CantFetch`, `BadMagic` or `BadLink`.
    pub fn fetch_ckpt<T: Read + Write>(
        &mut self,
        rsc: &mut RemoteSyscalls<T>,
        config: &StarterConfig,
    ) -> StarterResult<()> {
        self.expect_state("fetch_ckpt", &[ProcState::New])?;
        let name = match job_level(rsc.get_a_out_name())? {
            Ok(name) => name,
            Err(errno) => {
                self.cant_fetch(errno);
                return Ok(());
            }
        };
        let location = match exec_name::resolve(&name, config) {
            Ok(l) => l,
            Err(e) => {
                warn!(name, error = %e, "cannot resolve executable name");
                self.cant_fetch(Errno::EINVAL);
                return Ok(());
            }
        };

        let fetched = match &location {
            ExecLocation::Local(path) => {
                debug!(path = %path.display(), "linking local executable");
                symlink(path, &self.cur_ckpt).map_err(|e| errno_of(&e))
            }
            ExecLocation::Remote(path) => {
                self.transfer_executable(rsc, path, config.job.exec_transfer_attempts)?
            }
        };
        if let Err(errno) = fetched {
            self.cant_fetch(errno);
            return Ok(());
        }
        self.link_check(config)
    }

    fn transfer_executable<T: Read + Write>(
        &mut self,
        rsc: &mut RemoteSyscalls<T>,
        remote: &str,
        attempts: u32,
    ) -> StarterResult<Result<(), Errno>> {
        let _user = PrivGuard::user(self.info.identity).map_err(StarterError::os("seteuid"))?;
        let mut last = Errno::EIO;
        for attempt in 1..=attempts {
            match job_level(rsc.fetch_file(remote, &self.cur_ckpt, 0o755))? {
                Ok(bytes) => {
                    info!(remote, bytes, attempt, "executable fetched");
                    return Ok(Ok(()));
                }
                Err(errno) => {
                    warn!(remote, attempt, %errno, "executable transfer failed");
                    last = errno;
                }
            }
        }
        Ok(Err(last))
    }

    /// Check the fetched executable. Vanilla and PVM daemon jobs are taken
    /// as they are; others must be ELF, and fresh Standard and Pipe jobs must
    /// carry the checkpoint runtime.
    pub fn link_check(&mut self, config: &StarterConfig) -> StarterResult<()> {
        self.expect_state("link_check", &[ProcState::New])?;
        let class = self.info.class;
        let verdict = if config.link_check_disabled()
            || matches!(class, JobClass::Vanilla | JobClass::PvmDaemon)
        {
            LinkVerdict::Ok
        } else {
            let needs_runtime = class.needs_runtime_link() && !self.restart;
            match link_check::verify(&self.cur_ckpt, needs_runtime) {
                Ok(v) => v,
                Err(e) => {
                    self.cant_fetch(errno_of(&e));
                    return Ok(());
                }
            }
        };
        self.state = match verdict {
            LinkVerdict::Ok => ProcState::Runnable,
            LinkVerdict::BadMagic => ProcState::BadMagic,
            LinkVerdict::BadLink => ProcState::BadLink,
        };
        if self.state != ProcState::Runnable {
            warn!(state = %self.state, path = %self.cur_ckpt.display(), "executable rejected");
        }
        Ok(())
    }

    /// argv for the job's class: Standard and Pipe jobs get their
    /// standard file names ahead of their own arguments, PVM jobs a task
    /// id placeholder before those.
    pub fn argv(&self) -> Vec<String> {
        let i = &self.info;
        let mut argv = vec![self.short_name()];
        let std_names = [i.std_in.clone(), i.std_out.clone(), i.std_err.clone()];
        match i.class {
            JobClass::Standard | JobClass::Pipe => argv.extend(std_names),
            JobClass::Pvm => {
                argv.push("-1".to_string());
                argv.extend(std_names);
            }
            JobClass::Vanilla | JobClass::PvmDaemon => {}
        }
        argv.extend(i.args.iter().cloned());
        argv
    }

    /// Files for descriptors 0, 1 and 2 of a Vanilla job, opened as the job
    /// owner from the authority's file names.
    fn open_std_files<T: Read + Write>(
        &mut self,
        rsc: &mut RemoteSyscalls<T>,
    ) -> StarterResult<Result<Vec<File>, Errno>> {
        let mut names = Vec::with_capacity(3);
        for fd in 0..3 {
            let logical = match job_level(rsc.get_std_file_info(fd))? {
                Ok(l) => l,
                Err(errno) => return Ok(Err(errno)),
            };
            match job_level(rsc.get_file_info_new(&logical))? {
                Ok(url) => names.push((fd, url)),
                Err(errno) => return Ok(Err(errno)),
            }
        }

        let _user = PrivGuard::user(self.info.identity).map_err(StarterError::os("seteuid"))?;
        let mut files = Vec::with_capacity(3);
        for (fd, url) in names {
            match open_std_file(fd, &url) {
                Ok(f) => files.push(f),
                Err(e) => {
                    warn!(fd, url, error = %e, "cannot open standard file");
                    return Ok(Err(errno_of(&e)));
                }
            }
        }
        Ok(Ok(files))
    }

    /// The job ended before exec could happen.
    fn not_started(&mut self) {
        self.termination = Some(Termination::Exited(JOB_EXEC_FAILED));
        self.exit_status = JOB_EXEC_FAILED << 8;
        self.state = ProcState::NonRunnable;
    }

    /// Start the job. `channel` is the remote-syscall socket handed to jobs
    /// that use one.
    pub fn execute<T: Read + Write>(
        &mut self,
        rsc: &mut RemoteSyscalls<T>,
        config: &StarterConfig,
        channel: Option<BorrowedFd<'_>>,
    ) -> StarterResult<()> {
        self.expect_state("execute", &[ProcState::Runnable])?;
        let class = self.info.class;
        let mut fd_actions = Vec::new();

        match channel {
            Some(fd) if class.uses_channel() => fd_actions.push(FdAction::Dup {
                from: fd.as_raw_fd(),
                to: RSC_SOCK,
            }),
            _ => {
                fd_actions.push(FdAction::Close(RSC_SOCK));
                fd_actions.push(FdAction::Close(CLIENT_LOG));
            }
        }

        let cmd_pipe = if class.uses_command_pipe() {
            let (r, w) = pipe2(OFlag::O_CLOEXEC).map_err(StarterError::os("pipe"))?;
            fd_actions.push(FdAction::Dup {
                from: r.as_raw_fd(),
                to: CMD_PIPE_FD,
            });
            Some((r, w))
        } else {
            None
        };

        let (std_files, cwd) = if class == JobClass::Vanilla {
            let files = match self.open_std_files(rsc)? {
                Ok(files) => files,
                Err(errno) => {
                    warn!(%errno, "job not started");
                    self.not_started();
                    return Ok(());
                }
            };
            let iwd = match job_level(rsc.get_iwd())? {
                Ok(iwd) => PathBuf::from(iwd),
                Err(errno) => {
                    warn!(%errno, "no initial working directory");
                    self.not_started();
                    return Ok(());
                }
            };
            (files, iwd)
        } else {
            (Vec::new(), self.local_dir.clone())
        };
        for (fd, file) in (0..).zip(&std_files) {
            fd_actions.push(FdAction::Dup {
                from: file.as_raw_fd(),
                to: fd,
            });
        }

        let spec = SpawnSpec {
            program: self.cur_ckpt.clone(),
            argv: self.argv(),
            env: self.env.clone(),
            cwd,
            identity: self.info.identity,
            fd_actions,
            blocked: SignalSet::from_signals(&RESTART_SIGNALS),
            nice: config.job.renice_increment,
            core_limit: self.info.core_limit,
            allow_root: config.job.allow_root,
        };
        let pid = spawn_dropping_privilege(&spec)?;
        drop(std_files);

        if let Some((r, w)) = cmd_pipe {
            drop(r);
            let commands = if self.restart { "restart\nend\n" } else { "end\n" };
            if let Err(e) = File::from(w).write_all(commands.as_bytes()) {
                warn!(error = %e, "cannot write startup commands");
            }
        }

        self.pid = Some(pid);
        self.state = ProcState::Executing;
        self.exit_requested = false;
        self.termination = None;
        info!(pid = pid.as_raw(), restart = self.restart, argv = ?spec.argv, "job started");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Running
    // -----------------------------------------------------------------------

    /// Block until the job process ends; returns its raw wait status.
    pub fn wait(&mut self) -> StarterResult<c_int> {
        let pid = self.pid.ok_or(StarterError::State {
            op: "wait",
            state: self.state,
        })?;
        loop {
            let mut status: c_int = 0;
            // SAFETY: status is a live local the kernel writes through.
            let r = unsafe { libc::waitpid(pid.as_raw(), &mut status, 0) };
            if r == pid.as_raw() {
                return Ok(status);
            }
            match Errno::last() {
                Errno::EINTR => continue,
                errno => return Err(StarterError::Os { op: "waitpid", errno }),
            }
        }
    }

    /// Record how the job ended and move to the matching state.
    pub fn handle_termination(&mut self, status: c_int) -> StarterResult<()> {
        self.expect_state(
            "handle_termination",
            &[ProcState::Executing, ProcState::Suspended],
        )?;
        let Some(termination) = Termination::from_wait_status(status) else {
            debug!(status, "not a termination, ignoring");
            return Ok(());
        };
        let pid = self.pid.take();
        self.accumulate_cpu_time();
        self.exit_status = status;
        self.termination = Some(termination);

        let class = exit::classify(termination, self.info.class, self.exit_requested);
        if class.commit_cpu {
            self.commit_cpu_time();
        }
        if class.ckpt_transferred {
            self.ckpt_transferred = true;
        }
        self.state = class.state;

        self.core_name = pid.and_then(|pid| self.find_core(pid));
        if let Some(core) = &self.core_name
            && !class.expects_core()
        {
            debug!(core = %core.display(), "removing unexpected core");
            if let Err(e) = unlink_retrying(core) {
                warn!(core = %core.display(), error = %e, "cannot remove core");
            }
            self.core_name = None;
        }

        info!(
            ?termination,
            state = %self.state,
            core = self.core_name.is_some(),
            "job process ended"
        );
        Ok(())
    }

    fn find_core(&self, pid: Pid) -> Option<PathBuf> {
        let candidates = [
            self.local_dir.join(format!("core.{pid}")),
            self.local_dir.join("core"),
        ];
        candidates
            .into_iter()
            .find(|p| match fs::symlink_metadata(p) {
                Ok(m) if m.file_type().is_symlink() => {
                    warn!(path = %p.display(), "ignoring symlinked core");
                    false
                }
                Ok(m) => m.is_file(),
                Err(_) => false,
            })
    }

    /// Signal the job. SIGCONT goes first so a stopped job sees the signal;
    /// a job that is already gone is not an error.
    pub fn send_sig(&self, sig: Signal) -> StarterResult<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        let _root = PrivGuard::root().map_err(StarterError::os("seteuid"))?;
        if sig != Signal::SIGCONT {
            deliver(pid, Signal::SIGCONT)?;
        }
        debug!(pid = pid.as_raw(), %sig, "signalling job");
        deliver(pid, sig)
    }

    pub fn suspend(&mut self) -> StarterResult<()> {
        self.expect_state("suspend", &[ProcState::Executing])?;
        self.send_sig(Signal::SIGSTOP)?;
        self.state = ProcState::Suspended;
        Ok(())
    }

    pub fn resume(&mut self) -> StarterResult<()> {
        self.expect_state("resume", &[ProcState::Suspended])?;
        self.send_sig(Signal::SIGCONT)?;
        self.state = ProcState::Executing;
        Ok(())
    }

    /// Ask the job to checkpoint and leave.
    pub fn request_ckpt(&self) -> StarterResult<()> {
        self.send_sig(Signal::SIGTSTP)
    }

    /// Ask the job to checkpoint and carry on.
    pub fn request_periodic_ckpt(&self) -> StarterResult<()> {
        self.send_sig(Signal::SIGUSR2)
    }

    /// Ask the job to exit with its own kill signal.
    pub fn request_exit(&mut self) -> StarterResult<()> {
        self.exit_requested = true;
        self.send_sig(self.info.kill_sig)
    }

    pub fn kill_forcibly(&self) -> StarterResult<()> {
        self.send_sig(Signal::SIGKILL)
    }

    /// A checkpointed job may run again from its new image.
    pub fn make_runnable(&mut self) -> StarterResult<()> {
        self.expect_state("make_runnable", &[ProcState::Checkpointing])?;
        self.restart = true;
        self.ckpt_transferred = false;
        self.state = ProcState::Runnable;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // CPU accounting
    // -----------------------------------------------------------------------

    /// Fold the CPU used by children waited for since the last call into the
    /// job's totals.
    pub fn accumulate_cpu_time(&mut self) {
        let now = CpuTimes::children();
        let used = now.since(self.children_seen);
        self.children_seen = now;
        self.total_cpu.add(used);
        self.pending_cpu.add(used);
    }

    /// CPU used so far can no longer be lost.
    pub fn commit_cpu_time(&mut self) {
        self.guaranteed_cpu.add(self.pending_cpu);
        self.pending_cpu = CpuTimes::default();
    }

    // -----------------------------------------------------------------------
    // Checkpoint and core
    // -----------------------------------------------------------------------

    /// Fold the core of a checkpointing job into a new image at `tmp_ckpt`,
    /// if the job wants checkpoints and there is room. Returns whether a
    /// new image was written. The core is removed either way.
    pub fn update_ckpt(
        &mut self,
        disk: &dyn DiskProbe,
        updater: &dyn ImageUpdater,
        config: &StarterConfig,
    ) -> StarterResult<bool> {
        self.expect_state("update_ckpt", &[ProcState::Checkpointing])?;
        std::thread::sleep(Duration::from_millis(config.checkpoint.settle_delay_ms));
        let free_kb = disk.free_kb(&self.local_dir)?;
        let Some(core) = self.core_name.take() else {
            self.image_size_kb = free_kb;
            return Ok(false);
        };
        let result = if self.info.want_checkpoint {
            self.update_from_core(&core, free_kb, disk, updater, config)
        } else {
            info!("job declined checkpointing, discarding core");
            self.image_size_kb = free_kb;
            Ok(false)
        };
        if let Err(e) = unlink_retrying(&core) {
            warn!(core = %core.display(), error = %e, "cannot remove core");
        }
        result
    }

    fn update_from_core(
        &mut self,
        core: &Path,
        free_kb: u64,
        disk: &dyn DiskProbe,
        updater: &dyn ImageUpdater,
        config: &StarterConfig,
    ) -> StarterResult<bool> {
        let estimate = CkptEstimate {
            header_kb: disk.header_kb(&self.cur_ckpt)?,
            text_kb: disk.text_kb(&self.cur_ckpt)?,
            core_kb: disk.file_kb(core)?,
            slop_kb: config.checkpoint.slop_kb,
        };

        if !estimate.fits(free_kb) {
            info!(
                free_kb,
                estimate_kb = estimate.total_kb(),
                "not enough disk for a new image, skipping update"
            );
            self.image_size_kb = free_kb;
            return Ok(false);
        }
        if let Err(e) = updater.update(&self.cur_ckpt, core, &self.tmp_ckpt) {
            warn!(error = %e, "image update failed");
            self.image_size_kb = free_kb;
            return Ok(false);
        }
        self.image_size_kb = disk.file_kb(&self.tmp_ckpt)?;
        self.new_ckpt_created = true;
        info!(image_kb = self.image_size_kb, "new image written");
        Ok(true)
    }

    /// Make a new image the current one.
    pub fn commit_ckpt(&mut self) -> StarterResult<()> {
        if !self.new_ckpt_created {
            return Ok(());
        }
        unlink_retrying(&self.cur_ckpt)?;
        fs::rename(&self.tmp_ckpt, &self.cur_ckpt)?;
        Ok(())
    }

    /// Send a new image to the checkpoint target through a temporary name.
    pub fn store_ckpt<T: Read + Write>(&mut self, rsc: &mut RemoteSyscalls<T>) -> StarterResult<()> {
        if !self.new_ckpt_created {
            debug!("no new image to store");
            return Ok(());
        }
        self.new_ckpt_created = false;
        let target = self.info.ckpt_target.clone();
        let tmp = format!("{target}.tmp");

        let outcome = match job_level(rsc.send_file(&self.cur_ckpt, &tmp, 0o644))? {
            Ok(_) => job_level(rsc.rename(&tmp, &target))?,
            Err(errno) => Err(errno),
        };
        match outcome {
            Ok(()) => {
                self.commit_cpu_time();
                self.ckpt_transferred = true;
                info!(target, "checkpoint stored");
            }
            Err(errno) => {
                warn!(target, %errno, "checkpoint transfer failed");
                if let Err(errno) = job_level(rsc.unlink(&tmp))? {
                    debug!(tmp, %errno, "cannot remove partial checkpoint");
                }
                self.ckpt_transferred = false;
            }
        }
        Ok(())
    }

    /// Send the job's core to its working directory when within the job's
    /// core limit and the remote side has room.
    pub fn store_core<T: Read + Write>(&mut self, rsc: &mut RemoteSyscalls<T>) -> StarterResult<()> {
        let Some(core) = self.core_name.clone() else {
            return Ok(());
        };
        let size = fs::metadata(&core)?.len();
        if let Some(limit) = self.info.core_limit
            && size > limit
        {
            info!(size, limit, "core over the job's limit, not sent");
            return Ok(());
        }
        let vwd = match job_level(rsc.getwd_special())? {
            Ok(vwd) => vwd,
            Err(errno) => {
                warn!(%errno, "no remote working directory for core");
                return Ok(());
            }
        };
        let free_kb = match job_level(rsc.free_fs_blocks(&vwd))? {
            Ok(kb) => u64::try_from(kb).unwrap_or(0),
            Err(errno) => {
                warn!(%errno, vwd, "cannot check remote space for core");
                return Ok(());
            }
        };
        if free_kb.saturating_mul(1024) <= size {
            warn!(size, free_kb, "no room for core");
            return Ok(());
        }
        let target = format!("{vwd}/core.{}.{}", self.info.cluster, self.info.proc_id);
        match job_level(rsc.send_file(&core, &target, 0o644))? {
            Ok(bytes) => {
                self.core_transferred = true;
                info!(target, bytes, "core stored");
            }
            Err(errno) => warn!(target, %errno, "core transfer failed"),
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Exit
    // -----------------------------------------------------------------------

    /// Status reported with the exit: the raw wait status, or the errno of
    /// a failed fetch.
    pub fn exit_status(&self) -> i32 {
        match (self.state, self.fetch_errno) {
            (ProcState::CantFetch, Some(errno)) => errno as i32,
            _ => self.exit_status,
        }
    }

    pub fn exit_reason(&self) -> i32 {
        exit::exit_reason(
            self.state,
            self.termination,
            self.ckpt_transferred,
            self.core_transferred,
        )
    }

    /// Attributes the authority merges into the job ad at exit.
    pub fn exit_ad(&self) -> Record {
        let mut ad = Record::new()
            .with(attr::IMAGE_SIZE, i64::try_from(self.image_size_kb).unwrap_or(i64::MAX))
            .with(attr::REMOTE_USER_CPU, self.total_cpu.user_secs())
            .with(attr::REMOTE_SYS_CPU, self.total_cpu.sys_secs())
            .with(attr::GUARANTEED_USER_CPU, self.guaranteed_cpu.user_secs())
            .with(attr::GUARANTEED_SYS_CPU, self.guaranteed_cpu.sys_secs())
            .with(attr::CHECKPOINT_TRANSFERRED, self.ckpt_transferred)
            .with(attr::CORE_TRANSFERRED, self.core_transferred);
        if let Some(t) = self.termination {
            ad.insert(attr::EXIT_STATUS, t.code());
        }
        ad
    }

    /// Remove everything this process left on local disk.
    pub fn delete_files(&mut self) -> StarterResult<()> {
        let _root = PrivGuard::root().map_err(StarterError::os("seteuid"))?;
        let mut files = vec![self.cur_ckpt.clone(), self.tmp_ckpt.clone()];
        files.extend(self.core_name.take());
        for f in &files {
            if let Err(e) = unlink_retrying(f) {
                warn!(path = %f.display(), error = %e, "cannot remove");
            }
        }
        match fs::remove_dir_all(&self.local_dir) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => {
                debug!(dir = %self.local_dir.display(), "private directory removed");
                Ok(())
            }
        }
    }
}

fn deliver(pid: Pid, sig: Signal) -> StarterResult<()> {
    match kill(pid, sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(StarterError::Os { op: "kill", errno }),
    }
}

impl fmt::Display for UserProc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "job {}.{} ({:?}) state {}",
            self.info.cluster, self.info.proc_id, self.info.class, self.state
        )?;
        if let Some(pid) = self.pid {
            write!(f, " pid {pid}")?;
        }
        if let Some(t) = self.termination {
            write!(f, " ended {t:?}")?;
        }
        write!(
            f,
            " restart={} image={}KB ckpt_sent={} core_sent={} cpu={:.3}s/{:.3}s guaranteed={:.3}s/{:.3}s",
            self.restart,
            self.image_size_kb,
            self.ckpt_transferred,
            self.core_transferred,
            self.total_cpu.user_secs(),
            self.total_cpu.sys_secs(),
            self.guaranteed_cpu.user_secs(),
            self.guaranteed_cpu.sys_secs(),
        )
    }
}
