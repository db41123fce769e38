//! Signal environment of a checkpointing job.
//!
//! Six signals belong to the checkpoint/migration control channel and are
//! never handed to job code: [`CONTROL_SIGNALS`]. Everything here enforces
//! that through two primitives, [`is_control_signal`] and
//! [`strip_control_signals`]:
//!
//! - [`SignalSnapshot`] captures blocked mask, pending set, dispositions and
//!   the alternate stack at a checkpoint and replays them at restart, leaving
//!   control signals untouched.
//! - [`Interposer`] wraps the signal entry points job code calls and refuses
//!   or filters anything that would touch a control signal.
//! - [`CheckpointRuntime`] ties both to one [`SignalOs`] for the job process.

mod interpose;
mod os;
mod runtime;
mod set;
mod snapshot;

use libc::c_int;
use nix::errno::Errno;

pub use interpose::Interposer;
pub use os::{AltStack, Disposition, HostSignals, MaskHow, SignalOs};
pub use runtime::{CheckpointRuntime, install_checkpoint_handlers};
pub use set::SignalSet;
pub use snapshot::{SignalSnapshot, SnapshotState, probe_signal_count};

/// Compiled-in size of the per-signal tables (index 0 unused).
pub const MAX_SIGNALS: usize = 65;

/// Signals reserved for the control channel.
pub const CONTROL_SIGNALS: [c_int; 6] = [
    libc::SIGUSR1,
    libc::SIGUSR2,
    libc::SIGTSTP,
    libc::SIGKILL,
    libc::SIGSTOP,
    libc::SIGCONT,
];

/// Signals a freshly spawned job starts with blocked, so that a checkpoint
/// or vacate request cannot interrupt its restart sequence.
pub const RESTART_SIGNALS: [c_int; 3] = [libc::SIGUSR1, libc::SIGUSR2, libc::SIGTSTP];

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("signal call failed: {0}")]
    Os(#[from] Errno),
    #[error("platform has {0} signals, table holds {MAX_SIGNALS}")]
    TooManySignals(usize),
    #[error("restore without a captured snapshot (state {0:?})")]
    NotCaptured(SnapshotState),
}

pub fn is_control_signal(sig: c_int) -> bool {
    CONTROL_SIGNALS.contains(&sig)
}

/// Copy of `set` with every control signal removed.
pub fn strip_control_signals(set: &SignalSet) -> SignalSet {
    let mut out = *set;
    for sig in CONTROL_SIGNALS {
        out.remove(sig);
    }
    out
}
