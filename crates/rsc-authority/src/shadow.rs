use std::path::{Path, PathBuf};

use job_report::JobReport;
use nix::errno::Errno;
use nix::unistd::{Gid, Uid, User};
use rsc_proto::{MachineInfo, Record, attr};

use crate::AuthorityError;
use crate::fds::FdTable;

/// Identity of the job's owner, reported by `get_user_info` and the id
/// calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub owner: String,
    pub uid: u32,
    pub gid: u32,
}

impl UserInfo {
    /// The user this authority runs as.
    pub fn current() -> Self {
        let uid = Uid::current();
        let owner = User::from_uid(uid)
            .ok()
            .flatten()
            .map_or_else(|| uid.to_string(), |u| u.name);
        Self {
            owner,
            uid: uid.as_raw(),
            gid: Gid::current().as_raw(),
        }
    }

    pub fn to_record(&self) -> Record {
        Record::new()
            .with(attr::OWNER, self.owner.as_str())
            .with(attr::UID, i64::from(self.uid))
            .with(attr::GID, i64::from(self.gid))
    }
}

/// Final report from the job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobExit {
    pub status: i32,
    pub reason: i32,
    pub update: Record,
}

/// Everything the authority knows about the job it serves.
#[derive(Debug)]
pub struct ShadowState {
    pub(crate) job_ad: Record,
    pub(crate) user: UserInfo,
    pub(crate) iwd: PathBuf,
    pub(crate) cwd: PathBuf,
    pub(crate) machine: Option<MachineInfo>,
    pub(crate) starter_ad: Option<Record>,
    pub(crate) executing: bool,
    pub(crate) fds: FdTable,
    pub(crate) report: JobReport,
    pub(crate) exit: Option<JobExit>,
}

impl ShadowState {
    /// The job ad must name the executable (`Cmd`) and the initial working
    /// directory (`Iwd`).
    pub fn new(job_ad: Record, user: UserInfo) -> Result<Self, AuthorityError> {
        if job_ad.get_str(attr::CMD).is_none() {
            return Err(AuthorityError::MissingAttribute(attr::CMD));
        }
        let iwd = job_ad
            .get_str(attr::IWD)
            .map(PathBuf::from)
            .ok_or(AuthorityError::MissingAttribute(attr::IWD))?;
        Ok(Self {
            job_ad,
            user,
            cwd: iwd.clone(),
            iwd,
            machine: None,
            starter_ad: None,
            executing: false,
            fds: FdTable::default(),
            report: JobReport::new(),
            exit: None,
        })
    }

    pub fn job_ad(&self) -> &Record {
        &self.job_ad
    }

    pub fn user(&self) -> &UserInfo {
        &self.user
    }

    pub fn iwd(&self) -> &Path {
        &self.iwd
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn machine_info(&self) -> Option<&MachineInfo> {
        self.machine.as_ref()
    }

    pub fn starter_ad(&self) -> Option<&Record> {
        self.starter_ad.as_ref()
    }

    /// Whether the job reported `begin_execution`.
    pub fn is_executing(&self) -> bool {
        self.executing
    }

    pub fn report(&self) -> &JobReport {
        &self.report
    }

    pub fn exit(&self) -> Option<&JobExit> {
        self.exit.as_ref()
    }

    pub fn open_files(&self) -> usize {
        self.fds.open_count()
    }

    /// Job path to local path: relative paths are taken from the job's
    /// current directory.
    pub(crate) fn resolve(&self, path: &str) -> Result<PathBuf, Errno> {
        if path.is_empty() {
            return Err(Errno::ENOENT);
        }
        let p = Path::new(path);
        Ok(if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.cwd.join(p)
        })
    }

    /// Names from the comma or space separated `AppendFiles` attribute.
    pub(crate) fn is_append_file(&self, name: &str) -> bool {
        self.job_ad
            .get_str(attr::APPEND_FILES)
            .is_some_and(|list| {
                list.split(|c: char| c == ',' || c.is_whitespace())
                    .any(|f| !f.is_empty() && f == name)
            })
    }
}
