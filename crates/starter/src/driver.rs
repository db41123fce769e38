//! One job from registration to exit report.

use std::io::{Read, Write};
use std::os::fd::BorrowedFd;

use rsc_client::RemoteSyscalls;
use rsc_proto::{MachineInfo, Record, attr};
use tracing::{info, warn};

use crate::ckpt::{AppendCore, DiskProbe, ImageUpdater, LocalDisk};
use crate::config::StarterConfig;
use crate::error::StarterResult;
use crate::exit::Termination;
use crate::job::{JobInfo, ProcState};
use crate::user_proc::UserProc;

/// What was reported to the authority for the job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub state: ProcState,
    pub status: i32,
    pub reason: i32,
    pub update: Record,
}

pub struct Driver<'a> {
    config: &'a StarterConfig,
    disk: &'a dyn DiskProbe,
    updater: &'a dyn ImageUpdater,
    channel: Option<BorrowedFd<'a>>,
}

impl<'a> Driver<'a> {
    pub fn new(config: &'a StarterConfig) -> Self {
        Self {
            config,
            disk: &LocalDisk,
            updater: &AppendCore,
            channel: None,
        }
    }

    pub fn with_disk(mut self, disk: &'a dyn DiskProbe) -> Self {
        self.disk = disk;
        self
    }

    pub fn with_updater(mut self, updater: &'a dyn ImageUpdater) -> Self {
        self.updater = updater;
        self
    }

    /// Socket handed to channel-using jobs as their remote-syscall channel.
    pub fn with_channel(mut self, channel: BorrowedFd<'a>) -> Self {
        self.channel = Some(channel);
        self
    }

    fn starter_ad(&self) -> Record {
        Record::new()
            .with(attr::STARTER_PID, std::process::id())
            .with(attr::STARTER_HOST, self.config.this_host())
            .with(attr::EXECUTE_DIR, self.config.execute_dir.display().to_string())
    }

    /// Run the authority's job to completion and report its exit.
    pub fn run_job<T: Read + Write>(
        &self,
        mut rsc: RemoteSyscalls<T>,
        machine: &MachineInfo,
    ) -> StarterResult<JobOutcome> {
        rsc.register_machine_info(machine)?;
        let job_ad = rsc.get_job_info()?;
        let user_ad = rsc.get_user_info()?;
        rsc.register_starter_info(&self.starter_ad())?;
        let info = JobInfo::from_ads(&job_ad, &user_ad)?;
        let mut proc = UserProc::new(info, self.config)?;

        if let Err(e) = self.drive(&mut proc, &mut rsc) {
            warn!(error = %e, %proc, "job aborted");
            if proc.state().is_running() {
                let _ = proc.kill_forcibly();
                let _ = proc.wait();
            }
            if let Err(e) = proc.delete_files() {
                warn!(error = %e, "cleanup failed");
            }
            return Err(e);
        }

        let outcome = JobOutcome {
            state: proc.state(),
            status: proc.exit_status(),
            reason: proc.exit_reason(),
            update: proc.exit_ad(),
        };
        info!(%proc, reason = outcome.reason, "reporting job exit");
        rsc.job_exit(outcome.status, outcome.reason, &outcome.update)?;
        if let Err(e) = proc.delete_files() {
            warn!(error = %e, "cleanup failed");
        }
        Ok(outcome)
    }

    fn drive<T: Read + Write>(
        &self,
        proc: &mut UserProc,
        rsc: &mut RemoteSyscalls<T>,
    ) -> StarterResult<()> {
        proc.fetch_ckpt(rsc, self.config)?;
        let mut began = false;

        while proc.state() == ProcState::Runnable {
            proc.execute(rsc, self.config, self.channel)?;
            if proc.state() != ProcState::Executing {
                break;
            }
            if !began {
                rsc.begin_execution()?;
                began = true;
            }
            let status = proc.wait()?;
            proc.handle_termination(status)?;

            match proc.state() {
                ProcState::Checkpointing => {
                    // A job that exits on SIGQUIT has already sent its image.
                    if !proc.ckpt_transferred() {
                        proc.update_ckpt(self.disk, self.updater, self.config)?;
                        proc.commit_ckpt()?;
                        proc.store_ckpt(rsc)?;
                    }
                    let periodic = matches!(
                        proc.termination(),
                        Some(Termination::Signaled {
                            signal: libc::SIGUSR2,
                            ..
                        })
                    );
                    if periodic {
                        proc.make_runnable()?;
                    }
                }
                ProcState::AbnormalExit => proc.store_core(rsc)?,
                _ => {}
            }
        }
        Ok(())
    }
}
