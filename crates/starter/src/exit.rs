//! Exit reason codes reported to the authority, and the classification of
//! a wait status into the next process state.

use libc::c_int;

use crate::job::{JobClass, ProcState};

pub const JOB_EXITED: i32 = 100;
pub const JOB_CKPTED: i32 = 101;
pub const JOB_KILLED: i32 = 102;
pub const JOB_COREDUMPED: i32 = 103;
pub const JOB_EXCEPTION: i32 = 104;
pub const JOB_NOT_CKPTED: i32 = 107;
pub const JOB_NOT_STARTED: i32 = 108;
/// Exit code of a child whose exec failed. Reserved: a job exiting with it
/// is taken as never having started.
pub const JOB_EXEC_FAILED: i32 = 110;

/// How a job process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled { signal: i32, core_dumped: bool },
}

impl Termination {
    /// Decode a raw wait status. `None` for stop/continue reports.
    pub fn from_wait_status(status: c_int) -> Option<Self> {
        if libc::WIFEXITED(status) {
            Some(Termination::Exited(libc::WEXITSTATUS(status)))
        } else if libc::WIFSIGNALED(status) {
            Some(Termination::Signaled {
                signal: libc::WTERMSIG(status),
                core_dumped: libc::WCOREDUMP(status),
            })
        } else {
            None
        }
    }

    /// Exit code, or the signal number for a signaled process.
    pub fn code(self) -> i32 {
        match self {
            Termination::Exited(code) => code,
            Termination::Signaled { signal, .. } => signal,
        }
    }
}

/// Outcome of classifying a termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitClass {
    pub state: ProcState,
    /// The run's CPU time counts as guaranteed.
    pub commit_cpu: bool,
    /// The process already shipped its own checkpoint.
    pub ckpt_transferred: bool,
}

impl ExitClass {
    fn new(state: ProcState, commit_cpu: bool) -> Self {
        Self {
            state,
            commit_cpu,
            ckpt_transferred: false,
        }
    }

    /// Whether a core file may legitimately be left behind.
    pub fn expects_core(&self) -> bool {
        matches!(self.state, ProcState::Checkpointing | ProcState::AbnormalExit)
    }
}

/// Next state for a process that ended with `t`.
///
/// | termination                      | state         | commit cpu |
/// |----------------------------------|---------------|------------|
/// | Vanilla after an exit request    | NonRunnable   | no         |
/// | exit with [`JOB_EXEC_FAILED`]    | NonRunnable   | no         |
/// | any other exit                   | NormalExit    | yes        |
/// | SIGUSR2 (periodic checkpoint)    | Checkpointing | yes        |
/// | SIGQUIT (checkpoint sent by job) | Checkpointing | no         |
/// | SIGUSR1, SIGKILL                 | NonRunnable   | no         |
/// | any other signal                 | AbnormalExit  | yes        |
pub fn classify(t: Termination, class: JobClass, exit_requested: bool) -> ExitClass {
    if class == JobClass::Vanilla && exit_requested {
        return ExitClass::new(ProcState::NonRunnable, false);
    }
    match t {
        Termination::Exited(JOB_EXEC_FAILED) => ExitClass::new(ProcState::NonRunnable, false),
        Termination::Exited(_) => ExitClass::new(ProcState::NormalExit, true),
        Termination::Signaled { signal, .. } => match signal {
            libc::SIGUSR2 => ExitClass::new(ProcState::Checkpointing, true),
            libc::SIGQUIT => ExitClass {
                ckpt_transferred: true,
                ..ExitClass::new(ProcState::Checkpointing, false)
            },
            libc::SIGUSR1 | libc::SIGKILL => ExitClass::new(ProcState::NonRunnable, false),
            _ => ExitClass::new(ProcState::AbnormalExit, true),
        },
    }
}

/// Reason code reported with the job's exit.
pub fn exit_reason(
    state: ProcState,
    termination: Option<Termination>,
    ckpt_transferred: bool,
    core_transferred: bool,
) -> i32 {
    match state {
        ProcState::NormalExit => JOB_EXITED,
        ProcState::Checkpointing if ckpt_transferred => JOB_CKPTED,
        ProcState::Checkpointing => JOB_NOT_CKPTED,
        ProcState::AbnormalExit if core_transferred => JOB_COREDUMPED,
        ProcState::AbnormalExit => JOB_KILLED,
        ProcState::NonRunnable => match termination {
            Some(Termination::Exited(JOB_EXEC_FAILED)) => JOB_NOT_STARTED,
            _ => JOB_KILLED,
        },
        ProcState::CantFetch | ProcState::BadMagic | ProcState::BadLink => JOB_NOT_STARTED,
        ProcState::New | ProcState::Runnable => JOB_NOT_STARTED,
        ProcState::Executing | ProcState::Suspended => JOB_EXCEPTION,
    }
}
