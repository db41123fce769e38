use std::fmt;

use libc::{c_int, sigset_t};
use nix::sys::signal::{SigSet, Signal};

use crate::MAX_SIGNALS;

/// A signal set with value semantics.
///
/// Named signals go through [`SigSet`]; real-time signals have no
/// [`Signal`] variant and are edited on the raw `sigset_t`.
#[derive(Clone, Copy)]
pub struct SignalSet(SigSet);

impl SignalSet {
    pub fn empty() -> Self {
        Self(SigSet::empty())
    }

    pub fn full() -> Self {
        Self(SigSet::all())
    }

    pub fn from_signals(sigs: &[c_int]) -> Self {
        let mut set = Self::empty();
        for &sig in sigs {
            set.add(sig);
        }
        set
    }

    /// Wrap a set filled in by libc or the kernel.
    pub fn from_raw(raw: sigset_t) -> Self {
        // SAFETY: callers pass sets that sigemptyset, sigprocmask,
        // sigpending or sigaction initialised.
        Self(unsafe { SigSet::from_sigset_t_unchecked(raw) })
    }

    pub fn as_raw(&self) -> &sigset_t {
        self.0.as_ref()
    }

    pub fn as_sigset(&self) -> &SigSet {
        &self.0
    }

    fn edit_raw(&mut self, edit: impl FnOnce(&mut sigset_t)) {
        let mut raw = *self.as_raw();
        edit(&mut raw);
        *self = Self::from_raw(raw);
    }

    /// Add `sig`. Invalid numbers are ignored.
    pub fn add(&mut self, sig: c_int) {
        match Signal::try_from(sig) {
            Ok(named) => self.0.add(named),
            // SAFETY: raw is an initialised copy of this set.
            Err(_) => self.edit_raw(|raw| unsafe {
                libc::sigaddset(raw, sig);
            }),
        }
    }

    /// Remove `sig`. Invalid numbers are ignored.
    pub fn remove(&mut self, sig: c_int) {
        match Signal::try_from(sig) {
            Ok(named) => self.0.remove(named),
            // SAFETY: raw is an initialised copy of this set.
            Err(_) => self.edit_raw(|raw| unsafe {
                libc::sigdelset(raw, sig);
            }),
        }
    }

    pub fn contains(&self, sig: c_int) -> bool {
        match Signal::try_from(sig) {
            Ok(named) => self.0.contains(named),
            // SAFETY: as_raw points at an initialised sigset_t.
            Err(_) => unsafe { libc::sigismember(self.as_raw(), sig) == 1 },
        }
    }

    /// Members in increasing order.
    pub fn signals(&self) -> impl Iterator<Item = c_int> + '_ {
        (1..MAX_SIGNALS as c_int).filter(|&sig| self.contains(sig))
    }

    pub fn is_empty(&self) -> bool {
        self.signals().next().is_none()
    }

    /// BSD `sigmask()` encoding: bit `sig - 1` for signals 1..=32.
    pub fn from_legacy_mask(mask: c_int) -> Self {
        let bits = mask as u32;
        let mut set = Self::empty();
        for sig in 1..=32 {
            if bits & (1u32 << (sig - 1)) != 0 {
                set.add(sig);
            }
        }
        set
    }

    pub fn to_legacy_mask(&self) -> c_int {
        let mut bits = 0u32;
        for sig in self.signals().take_while(|&s| s <= 32) {
            bits |= 1u32 << (sig - 1);
        }
        bits as c_int
    }
}

impl From<SigSet> for SignalSet {
    fn from(set: SigSet) -> Self {
        Self(set)
    }
}

impl Default for SignalSet {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for SignalSet {
    fn eq(&self, other: &Self) -> bool {
        (1..MAX_SIGNALS as c_int).all(|sig| self.contains(sig) == other.contains(sig))
    }
}

impl Eq for SignalSet {}

impl fmt::Debug for SignalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.signals()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_remove_contains() {
        let mut set = SignalSet::empty();
        assert!(set.is_empty());
        set.add(libc::SIGHUP);
        set.add(libc::SIGTERM);
        assert!(set.contains(libc::SIGHUP));
        assert!(!set.contains(libc::SIGINT));
        set.remove(libc::SIGHUP);
        assert!(!set.contains(libc::SIGHUP));
        assert_eq!(set.signals().collect::<Vec<_>>(), vec![libc::SIGTERM]);
    }

    #[test]
    fn invalid_numbers_ignored() {
        let mut set = SignalSet::empty();
        set.add(0);
        set.add(10_000);
        assert!(set.is_empty());
        assert!(!set.contains(-3));
    }

    #[test]
    fn signals_iterate_in_increasing_order() {
        let set = SignalSet::from_signals(&[12, 3, 7]);
        assert_eq!(set.signals().collect::<Vec<_>>(), vec![3, 7, 12]);
    }

    #[test]
    fn legacy_mask_bits() {
        let set = SignalSet::from_legacy_mask((1 << 0) | (1 << 14));
        assert_eq!(set.signals().collect::<Vec<_>>(), vec![1, 15]);
        assert_eq!(set.to_legacy_mask(), (1 << 0) | (1 << 14));
    }

    #[test]
    fn realtime_signals_alongside_named_ones() {
        let rt = libc::SIGRTMIN() + 2;
        let mut set = SignalSet::from_signals(&[libc::SIGINT, rt]);
        assert!(set.contains(rt));
        assert!(set.as_sigset().contains(Signal::SIGINT));
        assert_eq!(set.signals().collect::<Vec<_>>(), vec![libc::SIGINT, rt]);
        set.remove(rt);
        assert!(!set.contains(rt));
        assert!(set.contains(libc::SIGINT));
    }

    #[test]
    fn equality_is_by_membership() {
        let a = SignalSet::from_signals(&[libc::SIGINT, libc::SIGQUIT]);
        let b = SignalSet::from_signals(&[libc::SIGQUIT, libc::SIGINT]);
        assert_eq!(a, b);
        assert_ne!(a, SignalSet::empty());
    }
}
