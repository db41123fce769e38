//! What the starter knows about the job it runs, decoded from the job and
//! user records the authority hands out.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use nix::sys::signal::Signal;
use rsc_proto::{AttrValue, Record, attr};

use crate::error::{StarterError, StarterResult};
use crate::priv_state::Identity;

/// Execution class: decides argv shape, channel wiring, link checking and
/// checkpoint support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobClass {
    Standard,
    Pipe,
    Pvm,
    Vanilla,
    PvmDaemon,
}

impl JobClass {
    /// Decode the job ad's universe number.
    pub fn from_universe(universe: i64) -> Option<Self> {
        match universe {
            1 => Some(JobClass::Standard),
            2 => Some(JobClass::Pipe),
            4 => Some(JobClass::Pvm),
            5 => Some(JobClass::Vanilla),
            6 => Some(JobClass::PvmDaemon),
            _ => None,
        }
    }

    pub fn universe(self) -> i64 {
        match self {
            JobClass::Standard => 1,
            JobClass::Pipe => 2,
            JobClass::Pvm => 4,
            JobClass::Vanilla => 5,
            JobClass::PvmDaemon => 6,
        }
    }

    /// Jobs that talk back over the remote-syscall channel on fd 3.
    pub fn uses_channel(self) -> bool {
        matches!(self, JobClass::Standard | JobClass::Pipe | JobClass::Pvm)
    }

    /// Jobs whose executable must carry the checkpoint runtime.
    pub fn needs_runtime_link(self) -> bool {
        matches!(self, JobClass::Standard | JobClass::Pipe)
    }

    /// Jobs that read startup commands from the command pipe.
    pub fn uses_command_pipe(self) -> bool {
        !matches!(self, JobClass::Vanilla | JobClass::PvmDaemon)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    New,
    Runnable,
    BadMagic,
    BadLink,
    CantFetch,
    Executing,
    Checkpointing,
    Suspended,
    NormalExit,
    AbnormalExit,
    NonRunnable,
}

impl ProcState {
    /// States with a live process behind them.
    pub fn is_running(self) -> bool {
        matches!(self, ProcState::Executing | ProcState::Suspended)
    }
}

impl fmt::Display for ProcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The job as decoded from the authority's records.
#[derive(Debug, Clone, PartialEq)]
pub struct JobInfo {
    pub cluster: i64,
    pub proc_id: i64,
    pub class: JobClass,
    pub cmd: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub std_in: String,
    pub std_out: String,
    pub std_err: String,
    pub iwd: PathBuf,
    pub kill_sig: Signal,
    /// Largest core file worth sending back, in bytes. `None` is unlimited.
    pub core_limit: Option<u64>,
    pub want_checkpoint: bool,
    pub is_restart: bool,
    /// Where checkpoint images are stored on the submit side.
    pub ckpt_target: String,
    pub owner: String,
    pub identity: Identity,
}

fn required_int(ad: &Record, name: &'static str) -> StarterResult<i64> {
    ad.get_int(name)
        .ok_or_else(|| StarterError::JobAd(format!("missing integer attribute {name}")))
}

fn required_str<'a>(ad: &'a Record, name: &'static str) -> StarterResult<&'a str> {
    ad.get_str(name)
        .ok_or_else(|| StarterError::JobAd(format!("missing string attribute {name}")))
}

fn std_name(ad: &Record, name: &str) -> String {
    ad.get_str(name).unwrap_or("/dev/null").to_string()
}

impl JobInfo {
    pub fn from_ads(job_ad: &Record, user_ad: &Record) -> StarterResult<Self> {
        let cluster = required_int(job_ad, attr::CLUSTER_ID)?;
        let proc_id = required_int(job_ad, attr::PROC_ID)?;
        let universe = job_ad.get_int(attr::JOB_UNIVERSE).unwrap_or(1);
        let class = JobClass::from_universe(universe)
            .ok_or_else(|| StarterError::JobAd(format!("unsupported universe {universe}")))?;
        let iwd = required_str(job_ad, attr::IWD)?;

        let kill_sig = match job_ad.get(attr::KILL_SIG) {
            None => Signal::SIGTERM,
            Some(value) => parse_signal(value)?,
        };
        let core_limit = match job_ad.get_int(attr::CORE_SIZE) {
            Some(n) if n >= 0 => Some(n as u64),
            _ => None,
        };
        let ckpt_target = match job_ad.get_str(attr::CHECKPOINT_FILE) {
            Some(f) => f.to_string(),
            None => format!("{iwd}/cluster{cluster}.proc{proc_id}.subproc0"),
        };

        let uid = required_int(user_ad, attr::UID)?;
        let gid = required_int(user_ad, attr::GID)?;
        let identity = Identity {
            uid: u32::try_from(uid).map_err(|_| StarterError::JobAd(format!("bad uid {uid}")))?,
            gid: u32::try_from(gid).map_err(|_| StarterError::JobAd(format!("bad gid {gid}")))?,
        };

        Ok(Self {
            cluster,
            proc_id,
            class,
            cmd: required_str(job_ad, attr::CMD)?.to_string(),
            args: split_args(job_ad.get_str(attr::ARGS).unwrap_or_default())?,
            env: parse_env(job_ad.get_str(attr::ENV).unwrap_or_default())?,
            std_in: std_name(job_ad, attr::IN),
            std_out: std_name(job_ad, attr::OUT),
            std_err: std_name(job_ad, attr::ERR),
            iwd: PathBuf::from(iwd),
            kill_sig,
            core_limit,
            want_checkpoint: job_ad.get_bool(attr::WANT_CHECKPOINT).unwrap_or(true),
            is_restart: job_ad.get_bool(attr::IS_RESTART).unwrap_or(false),
            ckpt_target,
            owner: user_ad.get_str(attr::OWNER).unwrap_or_default().to_string(),
            identity,
        })
    }
}

/// `KillSig` may be a number or a name, with or without the `SIG` prefix.
fn parse_signal(value: &AttrValue) -> StarterResult<Signal> {
    let bad = || StarterError::JobAd(format!("bad {}: {value}", attr::KILL_SIG));
    match value {
        AttrValue::Int(n) => i32::try_from(*n)
            .ok()
            .and_then(|n| Signal::try_from(n).ok())
            .ok_or_else(bad),
        AttrValue::Str(name) => {
            let name = name.trim().to_ascii_uppercase();
            let full = if name.starts_with("SIG") {
                name
            } else {
                format!("SIG{name}")
            };
            Signal::from_str(&full).map_err(|_| bad())
        }
        _ => Err(bad()),
    }
}

/// Split an argument string on whitespace. Single quotes group words; a
/// doubled quote inside a quoted run is a literal quote.
pub fn split_args(s: &str) -> StarterResult<Vec<String>> {
    let mut args = Vec::new();
    let mut cur = String::new();
    let mut in_word = false;
    let mut quoted = false;
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' if quoted => {
                if chars.peek() == Some(&'\'') {
                    chars.next();
                    cur.push('\'');
                } else {
                    quoted = false;
                }
            }
            '\'' => {
                quoted = true;
                in_word = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_word {
                    args.push(std::mem::take(&mut cur));
                    in_word = false;
                }
            }
            c => {
                cur.push(c);
                in_word = true;
            }
        }
    }
    if quoted {
        return Err(StarterError::JobAd(format!("unterminated quote in arguments: {s}")));
    }
    if in_word {
        args.push(cur);
    }
    Ok(args)
}

/// Parse `NAME=value` entries separated by `;`. Empty entries are skipped.
pub fn parse_env(s: &str) -> StarterResult<Vec<(String, String)>> {
    s.split(';')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
            _ => Err(StarterError::JobAd(format!("bad environment entry: {entry}"))),
        })
        .collect()
}
