//! Capture/restore against the real process signal state.
//!
//! Kept to a single test: signal masks are per thread but dispositions are
//! per process, so parallel tests in this binary would race.

use ckpt_signals::{
    Disposition, HostSignals, MaskHow, SignalOs, SignalSet, SignalSnapshot, probe_signal_count,
};

extern "C" fn noop(_sig: libc::c_int) {}

#[test]
fn host_capture_restore_keeps_pending_blocked_signal() {
    let mut os = HostSignals;

    let nsig = probe_signal_count(&os).unwrap();
    assert!(nsig > libc::SIGTERM as usize);

    let handler = Disposition {
        handler: noop as *const () as libc::sighandler_t,
        mask: SignalSet::empty(),
        flags: 0,
    };
    let old_hup = os.set_disposition(libc::SIGHUP, &handler).unwrap();
    let hup = SignalSet::from_signals(&[libc::SIGHUP]);
    let old_mask = os.set_mask(MaskHow::Block, &hup).unwrap();
    os.raise(libc::SIGHUP).unwrap();

    let mut snap = SignalSnapshot::new();
    snap.capture(&os).unwrap();
    assert!(snap.pending().contains(libc::SIGHUP));
    assert!(snap.blocked().contains(libc::SIGHUP));
    assert_eq!(snap.disposition(libc::SIGHUP).unwrap().handler, noop as *const () as libc::sighandler_t);

    snap.restore(&mut os).unwrap();
    assert!(os.pending().unwrap().contains(libc::SIGHUP));
    assert!(os.blocked().unwrap().contains(libc::SIGHUP));

    let mut again = SignalSnapshot::new();
    again.capture(&os).unwrap();
    assert_eq!(again.blocked(), snap.blocked());
    for sig in 1..nsig as libc::c_int {
        if ckpt_signals::is_control_signal(sig) {
            continue;
        }
        assert_eq!(again.disposition(sig), snap.disposition(sig), "signal {sig}");
    }

    // Delivers the pending SIGHUP to the no-op handler.
    os.set_mask(MaskHow::SetMask, &old_mask).unwrap();
    os.set_disposition(libc::SIGHUP, &old_hup).unwrap();
}
