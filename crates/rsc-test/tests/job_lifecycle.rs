#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::unreachable
)]

//! Whole jobs: a starter driving real processes against an authority
//! thread.

use std::fs;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rsc_authority::{JobExit, Session, ShadowState, UserInfo};
use rsc_client::RemoteSyscalls;
use rsc_proto::{MachineInfo, Record, SyscallNumber, attr};
use starter::ckpt::{AppendCore, LocalDisk};
use starter::exit::{JOB_CKPTED, JOB_EXITED, JOB_KILLED, JOB_NOT_CKPTED, JOB_NOT_STARTED};
use starter::{Driver, JobInfo, ProcState, StarterConfig, UserProc};
use tempfile::TempDir;

struct Harness {
    submit: TempDir,
    execute: TempDir,
    config: StarterConfig,
}

impl Harness {
    fn new() -> Self {
        let submit = tempfile::tempdir().unwrap();
        let execute = tempfile::tempdir().unwrap();
        let mut config = StarterConfig::new(execute.path());
        config.this_host = Some("exec1".into());
        config.initiating_host = Some("submit1".into());
        config.job.allow_root = true;
        config.checkpoint.settle_delay_ms = 0;
        Self {
            submit,
            execute,
            config,
        }
    }

    fn iwd(&self) -> &Path {
        self.submit.path()
    }

    fn job_ad(&self, universe: i64, cmd: &str) -> Record {
        Record::new()
            .with(attr::CLUSTER_ID, 12)
            .with(attr::PROC_ID, 0)
            .with(attr::JOB_UNIVERSE, universe)
            .with(attr::CMD, cmd)
            .with(attr::IWD, self.iwd().display().to_string())
            .with(attr::CORE_SIZE, 0)
    }

    /// Authority for `job_ad` serving in a thread until the job exits.
    fn authority(
        &self,
        job_ad: Record,
    ) -> (
        RemoteSyscalls<UnixStream>,
        JoinHandle<(JobExit, ShadowState)>,
    ) {
        let (job, authority) = UnixStream::pair().unwrap();
        let state = ShadowState::new(job_ad, UserInfo::current()).unwrap();
        let handle = thread::spawn(move || {
            let mut session = Session::new(authority, state);
            let exit = session.serve().unwrap();
            (exit, session.into_state())
        });
        (RemoteSyscalls::new(job), handle)
    }

    fn machine() -> MachineInfo {
        MachineInfo {
            uid_domain: "test".into(),
            fs_domain: "test".into(),
            starter_addr: "<exec1:0>".into(),
            full_hostname: "exec1".into(),
            key: 7,
        }
    }

    fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.iwd().join(name);
        fs::write(&path, body).unwrap();
        path
    }

    fn execute_dir_is_empty(&self) -> bool {
        fs::read_dir(self.execute.path()).unwrap().next().is_none()
    }
}

#[test]
fn vanilla_job_runs_in_iwd_and_reports_exit() {
    let h = Harness::new();
    let ad = h
        .job_ad(5, "exec1:/bin/sh")
        .with(attr::ARGS, "-c 'echo hello from $0; exit 3'")
        .with(attr::OUT, "out.txt")
        .with(attr::ERR, "err.txt");
    let (rsc, authority) = h.authority(ad);

    let outcome = Driver::new(&h.config)
        .run_job(rsc, &Harness::machine())
        .unwrap();
    let (exit, state) = authority.join().unwrap();

    assert_eq!(outcome.state, ProcState::NormalExit);
    assert_eq!(outcome.reason, JOB_EXITED);
    assert_eq!(outcome.status, 3 << 8);
    assert_eq!(outcome.update.get_int(attr::EXIT_STATUS), Some(3));
    assert_eq!((exit.status, exit.reason), (outcome.status, outcome.reason));
    assert_eq!(exit.update, outcome.update);

    assert_eq!(
        fs::read_to_string(h.iwd().join("out.txt")).unwrap(),
        "hello from condor_exec.12.0\n"
    );
    assert!(state.is_executing());
    assert_eq!(state.machine_info().unwrap().key, 7);
    assert_eq!(
        state.starter_ad().unwrap().get_str(attr::STARTER_HOST),
        Some("exec1")
    );
    assert_eq!(state.job_ad().get_int(attr::EXIT_STATUS), Some(3));
    assert!(h.execute_dir_is_empty());
}

#[test]
fn missing_executable_cannot_be_fetched() {
    let h = Harness::new();
    let (rsc, authority) = h.authority(h.job_ad(1, "/nonexistent/a.out"));

    let outcome = Driver::new(&h.config)
        .run_job(rsc, &Harness::machine())
        .unwrap();
    let (exit, state) = authority.join().unwrap();

    assert_eq!(outcome.state, ProcState::CantFetch);
    assert_eq!(outcome.reason, JOB_NOT_STARTED);
    assert_eq!(exit.status, libc::ENOENT);
    assert!(!state.is_executing());
    assert_eq!(
        state.report().call_count(SyscallNumber::GetFile),
        u64::from(h.config.job.exec_transfer_attempts)
    );
    assert!(h.execute_dir_is_empty());
}

#[test]
fn fetched_script_fails_magic_check() {
    let h = Harness::new();
    h.script("job.sh", "#!/bin/sh\nexit 0\n");
    let (rsc, authority) = h.authority(h.job_ad(1, "job.sh"));

    let outcome = Driver::new(&h.config)
        .run_job(rsc, &Harness::machine())
        .unwrap();
    authority.join().unwrap();

    assert_eq!(outcome.state, ProcState::BadMagic);
    assert_eq!(outcome.reason, JOB_NOT_STARTED);
}

#[test]
fn standard_job_without_runtime_fails_link_check() {
    let h = Harness::new();
    // A bare path is fetched through the channel.
    let (rsc, authority) = h.authority(h.job_ad(1, "/bin/sh"));

    let outcome = Driver::new(&h.config)
        .run_job(rsc, &Harness::machine())
        .unwrap();
    let (exit, state) = authority.join().unwrap();

    assert_eq!(outcome.state, ProcState::BadLink);
    assert_eq!(exit.reason, JOB_NOT_STARTED);
    assert!(state.report().call_count(SyscallNumber::GetFile) >= 1);
    assert!(!state.is_executing());
}

#[test]
fn job_killed_outright_is_not_checkpointed() {
    let mut h = Harness::new();
    h.config.job.skip_link_check = true;
    let script = h.script("killself.sh", "kill -KILL $$\n");
    let ad = h
        .job_ad(1, "exec1:/bin/sh")
        .with(attr::IN, script.display().to_string());
    let (rsc, authority) = h.authority(ad);

    let outcome = Driver::new(&h.config)
        .run_job(rsc, &Harness::machine())
        .unwrap();
    let (_, state) = authority.join().unwrap();

    assert_eq!(outcome.state, ProcState::NonRunnable);
    assert_eq!(outcome.reason, JOB_KILLED);
    assert_eq!(outcome.update.get_bool(attr::CHECKPOINT_TRANSFERRED), Some(false));
    assert_eq!(state.report().call_count(SyscallNumber::PutFile), 0);
    assert!(h.execute_dir_is_empty());
}

#[test]
fn job_that_quits_after_sending_its_image_is_checkpointed() {
    let mut h = Harness::new();
    h.config.job.skip_link_check = true;
    let script = h.script("quit.sh", "kill -QUIT $$\n");
    let ad = h
        .job_ad(1, "exec1:/bin/sh")
        .with(attr::IN, script.display().to_string());
    let (rsc, authority) = h.authority(ad);

    let outcome = Driver::new(&h.config)
        .run_job(rsc, &Harness::machine())
        .unwrap();
    let (_, state) = authority.join().unwrap();

    assert_eq!(outcome.state, ProcState::Checkpointing);
    assert_eq!(outcome.reason, JOB_CKPTED);
    assert_eq!(outcome.update.get_bool(attr::CHECKPOINT_TRANSFERRED), Some(true));
    // The starter itself sent nothing.
    assert_eq!(state.report().call_count(SyscallNumber::PutFile), 0);
}

/// Process state letter from `/proc/<pid>/stat`.
fn proc_state(pid: i32) -> Option<char> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let after_comm = stat.rsplit_once(')')?.1;
    after_comm.trim_start().chars().next()
}

fn wait_for_state(pid: i32, want: &[char]) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if proc_state(pid).is_some_and(|s| want.contains(&s)) {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

#[test]
fn suspend_resume_and_requested_exit() {
    let h = Harness::new();
    let ad = h
        .job_ad(5, "exec1:/bin/sh")
        .with(attr::ARGS, "-c 'exec /bin/sleep 30'")
        .with(attr::KILL_SIG, "TERM");
    let (mut rsc, authority) = h.authority(ad);

    let info = JobInfo::from_ads(&rsc.get_job_info().unwrap(), &rsc.get_user_info().unwrap())
        .unwrap();
    let mut proc = UserProc::new(info, &h.config).unwrap();
    proc.fetch_ckpt(&mut rsc, &h.config).unwrap();
    assert_eq!(proc.state(), ProcState::Runnable);
    proc.execute(&mut rsc, &h.config, None).unwrap();
    assert_eq!(proc.state(), ProcState::Executing);
    let pid = proc.pid().unwrap().as_raw();

    proc.suspend().unwrap();
    assert_eq!(proc.state(), ProcState::Suspended);
    assert_eq!(proc.pid().map(|p| p.as_raw()), Some(pid));
    assert!(wait_for_state(pid, &['T', 't']));

    proc.resume().unwrap();
    assert_eq!(proc.state(), ProcState::Executing);
    assert!(wait_for_state(pid, &['S', 'R']));

    proc.request_exit().unwrap();
    let status = proc.wait().unwrap();
    proc.handle_termination(status).unwrap();
    assert_eq!(proc.state(), ProcState::NonRunnable);
    assert_eq!(proc.exit_reason(), JOB_KILLED);

    rsc.job_exit(proc.exit_status(), proc.exit_reason(), &proc.exit_ad())
        .unwrap();
    let (exit, _) = authority.join().unwrap();
    assert_eq!(exit.reason, JOB_KILLED);
    proc.delete_files().unwrap();
    assert!(h.execute_dir_is_empty());
}

/// A standard job that ran to completion and is then treated as having
/// ended on the periodic checkpoint signal with a core in its directory.
fn checkpointing_proc(h: &Harness, rsc: &mut RemoteSyscalls<UnixStream>) -> UserProc {
    let info = JobInfo::from_ads(&rsc.get_job_info().unwrap(), &rsc.get_user_info().unwrap())
        .unwrap();
    let mut proc = UserProc::new(info, &h.config).unwrap();
    proc.fetch_ckpt(rsc, &h.config).unwrap();
    proc.execute(rsc, &h.config, None).unwrap();
    assert_eq!(proc.state(), ProcState::Executing);
    proc.wait().unwrap();

    fs::write(proc.local_dir().join("core"), vec![5u8; 4096]).unwrap();
    proc.handle_termination(libc::SIGUSR2).unwrap();
    assert_eq!(proc.state(), ProcState::Checkpointing);
    assert!(proc.core_created());

    assert!(proc.update_ckpt(&LocalDisk, &AppendCore, &h.config).unwrap());
    assert!(!proc.local_dir().join("core").exists());
    proc.commit_ckpt().unwrap();
    proc
}

fn checkpoint_ad(h: &Harness) -> Record {
    let script = h.script("done.sh", "exit 0\n");
    h.job_ad(1, "exec1:/bin/sh")
        .with(attr::IN, script.display().to_string())
}

#[test]
fn new_image_is_stored_under_its_target_name() {
    let mut h = Harness::new();
    h.config.job.skip_link_check = true;
    let (mut rsc, authority) = h.authority(checkpoint_ad(&h));

    let mut proc = checkpointing_proc(&h, &mut rsc);
    let image_len = fs::metadata(proc.cur_ckpt()).unwrap().len();
    proc.store_ckpt(&mut rsc).unwrap();

    let target = h.iwd().join("cluster12.proc0.subproc0");
    assert!(proc.ckpt_transferred());
    assert!(!proc.new_ckpt_created());
    assert_eq!(proc.exit_reason(), JOB_CKPTED);
    assert_eq!(fs::metadata(&target).unwrap().len(), image_len);
    assert!(!h.iwd().join("cluster12.proc0.subproc0.tmp").exists());

    proc.make_runnable().unwrap();
    assert_eq!(proc.state(), ProcState::Runnable);
    assert!(proc.is_restart());

    rsc.job_exit(proc.exit_status(), JOB_CKPTED, &proc.exit_ad())
        .unwrap();
    let (_, state) = authority.join().unwrap();
    assert!(state.report().call_count(SyscallNumber::PutFile) >= 1);
    proc.delete_files().unwrap();
    assert!(h.execute_dir_is_empty());
}

#[test]
fn failed_store_leaves_no_partial_image() {
    let mut h = Harness::new();
    h.config.job.skip_link_check = true;
    let target = h.iwd().join("missing").join("ckpt");
    let ad = checkpoint_ad(&h).with(attr::CHECKPOINT_FILE, target.display().to_string());
    let (mut rsc, authority) = h.authority(ad);

    let mut proc = checkpointing_proc(&h, &mut rsc);
    proc.store_ckpt(&mut rsc).unwrap();

    assert!(!proc.ckpt_transferred());
    assert_eq!(proc.exit_reason(), JOB_NOT_CKPTED);
    assert!(!target.exists());
    assert!(!h.iwd().join("missing").join("ckpt.tmp").exists());
    assert_eq!(proc.exit_ad().get_bool(attr::CHECKPOINT_TRANSFERRED), Some(false));

    rsc.job_exit(proc.exit_status(), proc.exit_reason(), &proc.exit_ad())
        .unwrap();
    let (exit, _) = authority.join().unwrap();
    assert_eq!(exit.reason, JOB_NOT_CKPTED);
    proc.delete_files().unwrap();
    assert!(h.execute_dir_is_empty());
}
