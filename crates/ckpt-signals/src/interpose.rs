use libc::c_int;
use nix::errno::Errno;

use crate::os::{Disposition, MaskHow, SignalOs};
use crate::{SignalSet, is_control_signal, strip_control_signals};

/// Signal entry points as seen by job code.
///
/// While mapped (ordinary job code running), calls naming a control signal
/// fail with `EINVAL` and every signal set passed through has the control
/// signals removed. Unmapped, calls go straight to the OS; checkpoint logic
/// unmaps around its own signal work.
#[derive(Debug)]
pub struct Interposer<O> {
    os: O,
    mapped: bool,
}

impl<O: SignalOs> Interposer<O> {
    pub fn new(os: O) -> Self {
        Self { os, mapped: true }
    }

    /// Returns the previous setting.
    pub fn set_mapped(&mut self, mapped: bool) -> bool {
        std::mem::replace(&mut self.mapped, mapped)
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    pub fn os(&self) -> &O {
        &self.os
    }

    pub fn os_mut(&mut self) -> &mut O {
        &mut self.os
    }

    pub fn into_inner(self) -> O {
        self.os
    }

    fn check_signal(&self, sig: c_int) -> Result<(), Errno> {
        if self.mapped && is_control_signal(sig) {
            return Err(Errno::EINVAL);
        }
        Ok(())
    }

    fn filter(&self, set: &SignalSet) -> SignalSet {
        if self.mapped {
            strip_control_signals(set)
        } else {
            *set
        }
    }

    /// `sigaction(sig, new, &old)`. With `new == None` only queries.
    pub fn sigaction(
        &mut self,
        sig: c_int,
        new: Option<&Disposition>,
    ) -> Result<Disposition, Errno> {
        self.check_signal(sig)?;
        match new {
            None => self.os.disposition(sig),
            Some(new) => {
                let new = Disposition {
                    mask: self.filter(&new.mask),
                    ..*new
                };
                self.os.set_disposition(sig, &new)
            }
        }
    }

    /// BSD `signal()`: install `handler` with an empty mask and
    /// `SA_RESTART`, returning the previous handler.
    pub fn signal(
        &mut self,
        sig: c_int,
        handler: libc::sighandler_t,
    ) -> Result<libc::sighandler_t, Errno> {
        let new = Disposition {
            handler,
            mask: SignalSet::empty(),
            flags: libc::SA_RESTART,
        };
        self.sigaction(sig, Some(&new)).map(|old| old.handler)
    }

    /// `sigprocmask(how, set, &old)`. With `set == None` only queries.
    pub fn sigprocmask(&mut self, how: MaskHow, set: Option<&SignalSet>) -> Result<SignalSet, Errno> {
        match set {
            None => self.os.blocked(),
            Some(set) => {
                let set = self.filter(set);
                self.os.set_mask(how, &set)
            }
        }
    }

    /// `sigsuspend(mask)`. Always returns an errno, normally `EINTR`.
    pub fn sigsuspend(&mut self, mask: &SignalSet) -> Errno {
        let mask = self.filter(mask);
        self.os.suspend(&mask)
    }

    /// `sigblock(mask)`: add a legacy bitmask, returning the old one.
    pub fn sigblock(&mut self, mask: c_int) -> Result<c_int, Errno> {
        let set = SignalSet::from_legacy_mask(mask);
        self.sigprocmask(MaskHow::Block, Some(&set))
            .map(|old| old.to_legacy_mask())
    }

    /// `sigsetmask(mask)`: replace with a legacy bitmask, returning the old
    /// one.
    pub fn sigsetmask(&mut self, mask: c_int) -> Result<c_int, Errno> {
        let set = SignalSet::from_legacy_mask(mask);
        self.sigprocmask(MaskHow::SetMask, Some(&set))
            .map(|old| old.to_legacy_mask())
    }

    /// `sigpause(mask)`: suspend with a legacy bitmask.
    pub fn sigpause(&mut self, mask: c_int) -> Errno {
        self.sigsuspend(&SignalSet::from_legacy_mask(mask))
    }

    pub fn sighold(&mut self, sig: c_int) -> Result<(), Errno> {
        self.check_signal(sig)?;
        self.os
            .set_mask(MaskHow::Block, &SignalSet::from_signals(&[sig]))
            .map(drop)
    }

    pub fn sigrelse(&mut self, sig: c_int) -> Result<(), Errno> {
        self.check_signal(sig)?;
        self.os
            .set_mask(MaskHow::Unblock, &SignalSet::from_signals(&[sig]))
            .map(drop)
    }

    pub fn sigignore(&mut self, sig: c_int) -> Result<(), Errno> {
        self.sigaction(sig, Some(&Disposition::ignore())).map(drop)
    }
}
