use nix::errno::Errno;

use crate::os::{Disposition, MaskHow, SignalOs};
use crate::{Interposer, SignalError, SignalSet, SignalSnapshot, SnapshotState};

/// Install the job-side checkpoint handler on `SIGTSTP` (vacate) and
/// `SIGUSR2` (periodic checkpoint). Each handler blocks the other signal
/// while it runs so the two requests cannot nest.
pub fn install_checkpoint_handlers<O: SignalOs>(
    os: &mut O,
    handler: libc::sighandler_t,
) -> Result<(), Errno> {
    for (sig, other) in [(libc::SIGTSTP, libc::SIGUSR2), (libc::SIGUSR2, libc::SIGTSTP)] {
        let disp = Disposition {
            handler,
            mask: SignalSet::from_signals(&[other]),
            flags: 0,
        };
        os.set_disposition(sig, &disp)?;
    }
    Ok(())
}

/// Signal side of a checkpointing job: the interposed entry points plus the
/// snapshot taken at the last checkpoint.
#[derive(Debug)]
pub struct CheckpointRuntime<O> {
    interposer: Interposer<O>,
    snapshot: SignalSnapshot,
}

impl<O: SignalOs> CheckpointRuntime<O> {
    pub fn new(os: O) -> Self {
        Self {
            interposer: Interposer::new(os),
            snapshot: SignalSnapshot::new(),
        }
    }

    /// Entry points for job code.
    pub fn interposer_mut(&mut self) -> &mut Interposer<O> {
        &mut self.interposer
    }

    pub fn snapshot(&self) -> &SignalSnapshot {
        &self.snapshot
    }

    /// Capture signal state ahead of writing the image.
    pub fn checkpoint(&mut self) -> Result<(), SignalError> {
        let was = self.interposer.set_mapped(false);
        let res = self.snapshot.capture(self.interposer.os());
        self.interposer.set_mapped(was);
        res
    }

    /// Reinstate signal state once the image has been reloaded.
    pub fn restart(&mut self) -> Result<(), SignalError> {
        if self.snapshot.state() != SnapshotState::Captured {
            return Err(SignalError::NotCaptured(self.snapshot.state()));
        }
        let was = self.interposer.set_mapped(false);
        let res = self.snapshot.restore(self.interposer.os_mut());
        self.interposer.set_mapped(was);
        res
    }

    /// Block the checkpoint request signals around a critical section,
    /// returning the mask to hand back to
    /// [`enable_checkpoint_signals`](Self::enable_checkpoint_signals).
    pub fn disable_checkpoint_signals(&mut self) -> Result<SignalSet, Errno> {
        let set = SignalSet::from_signals(&[libc::SIGTSTP, libc::SIGUSR2]);
        self.interposer.os_mut().set_mask(MaskHow::Block, &set)
    }

    pub fn enable_checkpoint_signals(&mut self, saved: &SignalSet) -> Result<(), Errno> {
        self.interposer
            .os_mut()
            .set_mask(MaskHow::SetMask, saved)
            .map(drop)
    }

    pub fn into_inner(self) -> O {
        self.interposer.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::fake::FakeOs;

    const HANDLER: libc::sighandler_t = 0x9000;

    #[test]
    fn checkpoint_handlers_block_each_other() {
        let mut os = FakeOs::new(32);
        install_checkpoint_handlers(&mut os, HANDLER).unwrap();

        let tstp = os.dispositions[libc::SIGTSTP as usize];
        assert_eq!(tstp.handler, HANDLER);
        assert_eq!(tstp.flags, 0);
        assert_eq!(tstp.mask, SignalSet::from_signals(&[libc::SIGUSR2]));
        let usr2 = os.dispositions[libc::SIGUSR2 as usize];
        assert_eq!(usr2.mask, SignalSet::from_signals(&[libc::SIGTSTP]));
    }

    #[test]
    fn checkpoint_then_restart_keeps_mapping() {
        let mut os = FakeOs::new(32);
        os.pending = SignalSet::from_signals(&[libc::SIGHUP]);
        os.blocked = SignalSet::from_signals(&[libc::SIGHUP]);
        let mut rt = CheckpointRuntime::new(os);

        rt.checkpoint().unwrap();
        assert!(rt.interposer_mut().is_mapped());
        assert_eq!(rt.snapshot().state(), SnapshotState::Captured);

        rt.restart().unwrap();
        assert!(rt.interposer_mut().is_mapped());
        assert_eq!(rt.snapshot().state(), SnapshotState::Restored);

        let os = rt.into_inner();
        assert_eq!(os.raised, vec![libc::SIGHUP]);
    }

    #[test]
    fn restart_without_checkpoint_fails() {
        let mut rt = CheckpointRuntime::new(FakeOs::new(32));
        assert!(matches!(
            rt.restart(),
            Err(SignalError::NotCaptured(SnapshotState::Unsnapshotted))
        ));
    }

    #[test]
    fn disable_enable_round_trip() {
        let mut os = FakeOs::new(32);
        os.blocked = SignalSet::from_signals(&[libc::SIGALRM]);
        let mut rt = CheckpointRuntime::new(os);

        let saved = rt.disable_checkpoint_signals().unwrap();
        let blocked = rt.interposer_mut().os().blocked;
        assert!(blocked.contains(libc::SIGTSTP));
        assert!(blocked.contains(libc::SIGUSR2));

        rt.enable_checkpoint_signals(&saved).unwrap();
        assert_eq!(
            rt.interposer_mut().os().blocked,
            SignalSet::from_signals(&[libc::SIGALRM])
        );
    }
}
