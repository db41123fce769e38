use std::cell::OnceCell;

use libc::c_int;
use nix::errno::Errno;

use crate::os::{AltStack, Disposition, MaskHow, SignalOs};
use crate::{MAX_SIGNALS, SignalError, SignalSet, is_control_signal, strip_control_signals};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    Unsnapshotted,
    Captured,
    Restoring,
    Restored,
}

/// Find the platform's signal count by asking for dispositions of 1, 2, ...
/// until the OS rejects one with `EINVAL`. The first rejected number is the
/// count.
pub fn probe_signal_count<O: SignalOs>(os: &O) -> Result<usize, SignalError> {
    for sig in 1..=MAX_SIGNALS {
        match os.disposition(sig as c_int) {
            Ok(_) => {}
            Err(Errno::EINVAL) => return Ok(sig),
            Err(e) => return Err(SignalError::Os(e)),
        }
    }
    Err(SignalError::TooManySignals(MAX_SIGNALS + 1))
}

/// Captured signal state of one process.
///
/// Owned by the job's checkpoint runtime; nothing here is global.
#[derive(Debug)]
pub struct SignalSnapshot {
    nsig: OnceCell<usize>,
    state: SnapshotState,
    blocked: SignalSet,
    pending: SignalSet,
    dispositions: [Option<Disposition>; MAX_SIGNALS],
    alt_stack: Option<AltStack>,
}

impl Default for SignalSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalSnapshot {
    pub fn new() -> Self {
        Self {
            nsig: OnceCell::new(),
            state: SnapshotState::Unsnapshotted,
            blocked: SignalSet::empty(),
            pending: SignalSet::empty(),
            dispositions: [None; MAX_SIGNALS],
            alt_stack: None,
        }
    }

    /// Signal count, probed once. A platform whose count exceeds the table is
    /// unusable for checkpointing, so that aborts.
    fn nsig<O: SignalOs>(&self, os: &O) -> usize {
        *self.nsig.get_or_init(|| match probe_signal_count(os) {
            Ok(n) => n,
            Err(SignalError::TooManySignals(n)) => safe_fmt::abort_with(
                2,
                "ckpt-signals: %d signals exceed table size %d\n",
                &[safe_fmt::Arg::from(n), safe_fmt::Arg::from(MAX_SIGNALS)],
            ),
            Err(e) => {
                let errno = match e {
                    SignalError::Os(errno) => errno as i32,
                    _ => 0,
                };
                safe_fmt::abort_with(
                    2,
                    "ckpt-signals: signal count probe failed, errno %d\n",
                    &[safe_fmt::Arg::from(errno)],
                )
            }
        })
    }

    /// Record blocked mask, pending set, every disposition and the
    /// alternate stack.
    pub fn capture<O: SignalOs>(&mut self, os: &O) -> Result<(), SignalError> {
        let nsig = self.nsig(os);
        self.blocked = os.blocked()?;
        self.pending = os.pending()?;
        for (sig, slot) in self.dispositions.iter_mut().enumerate() {
            *slot = if sig == 0 || sig >= nsig {
                None
            } else {
                Some(os.disposition(sig as c_int)?)
            };
        }
        self.alt_stack = Some(os.alt_stack()?);
        self.state = SnapshotState::Captured;
        Ok(())
    }

    /// Reinstate the captured state.
    ///
    /// Control signals keep whatever disposition they have now, come out
    /// unblocked, and are never raised. Pending signals are re-raised in
    /// increasing numeric order after the mask is in place, so those still
    /// blocked stay pending and the rest are delivered.
    pub fn restore<O: SignalOs>(&mut self, os: &mut O) -> Result<(), SignalError> {
        if self.state != SnapshotState::Captured {
            return Err(SignalError::NotCaptured(self.state));
        }
        self.state = SnapshotState::Restoring;

        for (sig, disp) in self.dispositions.iter().enumerate() {
            let Some(disp) = disp else { continue };
            let sig = sig as c_int;
            if is_control_signal(sig) {
                continue;
            }
            let disp = Disposition {
                mask: strip_control_signals(&disp.mask),
                ..*disp
            };
            os.set_disposition(sig, &disp)?;
        }

        if let Some(stack) = self.alt_stack {
            let stack = AltStack {
                flags: stack.flags & !libc::SS_ONSTACK,
                ..stack
            };
            os.set_alt_stack(&stack)?;
        }

        os.set_mask(MaskHow::SetMask, &strip_control_signals(&self.blocked))?;

        for sig in self.pending.signals() {
            if !is_control_signal(sig) {
                os.raise(sig)?;
            }
        }

        self.state = SnapshotState::Restored;
        Ok(())
    }

    pub fn state(&self) -> SnapshotState {
        self.state
    }

    pub fn blocked(&self) -> &SignalSet {
        &self.blocked
    }

    pub fn pending(&self) -> &SignalSet {
        &self.pending
    }

    pub fn disposition(&self, sig: c_int) -> Option<&Disposition> {
        usize::try_from(sig)
            .ok()
            .and_then(|i| self.dispositions.get(i))
            .and_then(Option::as_ref)
    }

    pub fn alt_stack(&self) -> Option<&AltStack> {
        self.alt_stack.as_ref()
    }
}
