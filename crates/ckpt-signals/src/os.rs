use libc::c_int;
use nix::errno::Errno;
use nix::sys::signal::{SigSet, SigmaskHow, sigprocmask};

use crate::SignalSet;

/// One signal's disposition: handler address (or `SIG_DFL`/`SIG_IGN`),
/// the mask applied while it runs, and `SA_*` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disposition {
    pub handler: libc::sighandler_t,
    pub mask: SignalSet,
    pub flags: c_int,
}

impl Disposition {
    pub fn default_action() -> Self {
        Self {
            handler: libc::SIG_DFL,
            mask: SignalSet::empty(),
            flags: 0,
        }
    }

    pub fn ignore() -> Self {
        Self {
            handler: libc::SIG_IGN,
            ..Self::default_action()
        }
    }

    fn from_raw(raw: &libc::sigaction) -> Self {
        Self {
            handler: raw.sa_sigaction,
            mask: SignalSet::from_raw(raw.sa_mask),
            flags: raw.sa_flags,
        }
    }

    fn to_raw(self) -> libc::sigaction {
        // SAFETY: all-zero is a valid sigaction; every field we rely on is
        // set below.
        let mut raw: libc::sigaction = unsafe { std::mem::zeroed() };
        raw.sa_sigaction = self.handler;
        raw.sa_mask = *self.mask.as_raw();
        raw.sa_flags = self.flags;
        raw
    }
}

/// Alternate signal-delivery stack descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AltStack {
    pub sp: usize,
    pub flags: c_int,
    pub size: usize,
}

impl AltStack {
    pub fn disabled() -> Self {
        Self {
            sp: 0,
            flags: libc::SS_DISABLE,
            size: 0,
        }
    }
}

/// `how` argument of `sigprocmask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskHow {
    Block,
    Unblock,
    SetMask,
}

impl MaskHow {
    fn to_nix(self) -> SigmaskHow {
        match self {
            MaskHow::Block => SigmaskHow::SIG_BLOCK,
            MaskHow::Unblock => SigmaskHow::SIG_UNBLOCK,
            MaskHow::SetMask => SigmaskHow::SIG_SETMASK,
        }
    }
}

/// The OS signal entry points, one method per call.
///
/// [`HostSignals`] forwards to the host; tests substitute a recording fake.
pub trait SignalOs {
    /// Current disposition of `sig`; `EINVAL` if `sig` is not a signal.
    fn disposition(&self, sig: c_int) -> Result<Disposition, Errno>;
    /// Install `new`, returning the previous disposition.
    fn set_disposition(&mut self, sig: c_int, new: &Disposition) -> Result<Disposition, Errno>;
    fn blocked(&self) -> Result<SignalSet, Errno>;
    /// `sigprocmask(how, set)`, returning the previous mask.
    fn set_mask(&mut self, how: MaskHow, set: &SignalSet) -> Result<SignalSet, Errno>;
    fn pending(&self) -> Result<SignalSet, Errno>;
    fn alt_stack(&self) -> Result<AltStack, Errno>;
    fn set_alt_stack(&mut self, stack: &AltStack) -> Result<(), Errno>;
    fn raise(&mut self, sig: c_int) -> Result<(), Errno>;
    /// `sigsuspend(mask)`; returns the errno it always fails with.
    fn suspend(&mut self, mask: &SignalSet) -> Errno;
}

/// The calling process's real signal state.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostSignals;

impl SignalOs for HostSignals {
    fn disposition(&self, sig: c_int) -> Result<Disposition, Errno> {
        // SAFETY: zeroed sigaction is valid output storage.
        let mut old: libc::sigaction = unsafe { std::mem::zeroed() };
        // SAFETY: act is null (query only), oldact points to live storage.
        let ret = unsafe { libc::sigaction(sig, std::ptr::null(), &mut old) };
        Errno::result(ret)?;
        Ok(Disposition::from_raw(&old))
    }

    fn set_disposition(&mut self, sig: c_int, new: &Disposition) -> Result<Disposition, Errno> {
        let act = new.to_raw();
        // SAFETY: zeroed sigaction is valid output storage.
        let mut old: libc::sigaction = unsafe { std::mem::zeroed() };
        // SAFETY: both pointers reference live sigaction structs.
        let ret = unsafe { libc::sigaction(sig, &act, &mut old) };
        Errno::result(ret)?;
        Ok(Disposition::from_raw(&old))
    }

    fn blocked(&self) -> Result<SignalSet, Errno> {
        let mut old = SigSet::empty();
        sigprocmask(SigmaskHow::SIG_BLOCK, None, Some(&mut old))?;
        Ok(old.into())
    }

    fn set_mask(&mut self, how: MaskHow, set: &SignalSet) -> Result<SignalSet, Errno> {
        let mut old = SigSet::empty();
        sigprocmask(how.to_nix(), Some(set.as_sigset()), Some(&mut old))?;
        Ok(old.into())
    }

    fn pending(&self) -> Result<SignalSet, Errno> {
        let mut set = *SignalSet::empty().as_raw();
        // SAFETY: set is initialised sigset_t storage.
        let ret = unsafe { libc::sigpending(&mut set) };
        Errno::result(ret)?;
        Ok(SignalSet::from_raw(set))
    }

    fn alt_stack(&self) -> Result<AltStack, Errno> {
        // SAFETY: zeroed stack_t is valid output storage.
        let mut old: libc::stack_t = unsafe { std::mem::zeroed() };
        // SAFETY: ss is null (query only).
        let ret = unsafe { libc::sigaltstack(std::ptr::null(), &mut old) };
        Errno::result(ret)?;
        Ok(AltStack {
            sp: old.ss_sp as usize,
            flags: old.ss_flags,
            size: old.ss_size,
        })
    }

    fn set_alt_stack(&mut self, stack: &AltStack) -> Result<(), Errno> {
        // SAFETY: zeroed stack_t is valid; fields set below.
        let mut ss: libc::stack_t = unsafe { std::mem::zeroed() };
        ss.ss_sp = stack.sp as *mut libc::c_void;
        ss.ss_flags = stack.flags;
        ss.ss_size = stack.size;
        // SAFETY: ss is a live stack_t; the old value is not requested.
        let ret = unsafe { libc::sigaltstack(&ss, std::ptr::null_mut()) };
        Errno::result(ret).map(drop)
    }

    fn raise(&mut self, sig: c_int) -> Result<(), Errno> {
        // SAFETY: raise has no memory-safety preconditions.
        let ret = unsafe { libc::raise(sig) };
        Errno::result(ret).map(drop)
    }

    fn suspend(&mut self, mask: &SignalSet) -> Errno {
        // SAFETY: mask references an initialised sigset_t.
        unsafe { libc::sigsuspend(mask.as_raw()) };
        Errno::last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Masks are per thread.
    #[test]
    fn host_mask_block_then_restore() {
        let mut os = HostSignals;
        let rt = libc::SIGRTMIN() + 1;
        let extra = SignalSet::from_signals(&[libc::SIGUSR1, rt]);

        let saved = os.set_mask(MaskHow::Block, &extra).unwrap();
        let blocked = os.blocked().unwrap();
        assert!(blocked.contains(libc::SIGUSR1));
        assert!(blocked.contains(rt));

        let during = os.set_mask(MaskHow::SetMask, &saved).unwrap();
        assert_eq!(during, blocked);
        assert_eq!(os.blocked().unwrap(), saved);
    }
}
