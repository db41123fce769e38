#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::unreachable
)]

//! Client and authority talking over a real socket pair.

use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::{self, JoinHandle};

use nix::errno::Errno;
use rsc_authority::{JobExit, Session, ShadowState, UserInfo};
use rsc_client::{RemoteError, RemoteSyscalls};
use rsc_proto::{ProtocolError, Record, Stream, SyscallNumber, attr};

fn job_ad(iwd: &Path) -> Record {
    Record::new()
        .with(attr::CLUSTER_ID, 4)
        .with(attr::PROC_ID, 1)
        .with(attr::CMD, "a.out")
        .with(attr::IWD, iwd.display().to_string())
}

/// Authority serving one connection in a thread until the job exits.
fn start_authority(
    iwd: &Path,
) -> (
    RemoteSyscalls<UnixStream>,
    JoinHandle<(JobExit, ShadowState)>,
) {
    let (job, authority) = UnixStream::pair().unwrap();
    let state = ShadowState::new(job_ad(iwd), UserInfo::current()).unwrap();
    let handle = thread::spawn(move || {
        let mut session = Session::new(authority, state);
        let exit = session.serve().unwrap();
        (exit, session.into_state())
    });
    (RemoteSyscalls::new(job), handle)
}

#[test]
fn file_calls_round_trip_through_authority() {
    let dir = tempfile::tempdir().unwrap();
    let (mut rsc, authority) = start_authority(dir.path());

    rsc.mkdir("work", 0o755).unwrap();
    rsc.chdir("work").unwrap();
    assert_eq!(
        rsc.getcwd().unwrap(),
        dir.path().join("work").display().to_string()
    );

    let fd = rsc
        .open("data", libc::O_CREAT | libc::O_RDWR | libc::O_TRUNC, 0o640)
        .unwrap();
    assert_eq!(rsc.write(fd, b"0123456789").unwrap(), 10);
    assert_eq!(rsc.lseek(fd, 2, libc::SEEK_SET).unwrap(), 2);
    assert_eq!(rsc.read(fd, 3).unwrap(), b"234");
    assert_eq!(rsc.fstat(fd).unwrap().size, 10);
    rsc.close(fd).unwrap();

    rsc.rename("data", "renamed").unwrap();
    assert_eq!(rsc.stat("renamed").unwrap().size, 10);
    let err = rsc.stat("data").unwrap_err();
    assert_eq!(err.errno(), Some(Errno::ENOENT));
    rsc.unlink("renamed").unwrap();
    rsc.chdir("..").unwrap();
    rsc.rmdir("work").unwrap();
    assert!(!dir.path().join("work").exists());

    rsc.job_exit(0, 100, &Record::new()).unwrap();
    let (exit, state) = authority.join().unwrap();
    assert_eq!((exit.status, exit.reason), (0, 100));

    let report = state.report();
    assert_eq!(report.call_count(SyscallNumber::Open), 1);
    assert_eq!(report.call_count(SyscallNumber::Stat), 2);
    let file = report.file("data").unwrap();
    assert_eq!(file.write_bytes, 10);
    assert_eq!(file.read_bytes, 3);
    assert_eq!(report.errors().len(), 1);
    assert_eq!(state.open_files(), 0);
}

#[test]
fn transfer_moves_whole_file_both_ways() {
    let dir = tempfile::tempdir().unwrap();
    let local = tempfile::tempdir().unwrap();
    // Larger than one transfer chunk.
    let payload: Vec<u8> = (0..(rsc_proto::FILE_CHUNK_SIZE + 123))
        .map(|i| (i % 251) as u8)
        .collect();
    std::fs::write(local.path().join("image"), &payload).unwrap();

    let (mut rsc, authority) = start_authority(dir.path());
    let sent = rsc
        .send_file(&local.path().join("image"), "ckpt", 0o600)
        .unwrap();
    assert_eq!(sent, payload.len() as u64);
    let fetched = rsc
        .fetch_file("ckpt", &local.path().join("back"), 0o755)
        .unwrap();
    assert_eq!(fetched, payload.len() as u64);
    rsc.job_exit(0, 100, &Record::new()).unwrap();
    let (_, state) = authority.join().unwrap();

    assert_eq!(std::fs::read(dir.path().join("ckpt")).unwrap(), payload);
    assert_eq!(std::fs::read(local.path().join("back")).unwrap(), payload);
    assert!(state.report().call_count(SyscallNumber::PutFile) >= 2);
    assert!(state.report().call_count(SyscallNumber::GetFile) >= 2);
}

#[test]
fn second_request_before_reply_is_out_of_turn() {
    let (job, _authority) = UnixStream::pair().unwrap();
    let mut rsc = RemoteSyscalls::new(job);
    let s = rsc.stream_mut();
    s.encode().unwrap();
    s.put_i32(SyscallNumber::Getuid.number()).unwrap();
    s.end_of_message().unwrap();

    // The getuid reply was never read.
    let err = rsc.getgid().unwrap_err();
    assert!(matches!(
        err,
        RemoteError::Protocol(ProtocolError::OutOfTurn(_))
    ));
}

#[test]
fn server_cannot_reply_before_a_request() {
    let (_job, authority) = UnixStream::pair().unwrap();
    let mut s = Stream::server(authority);
    assert!(matches!(s.encode(), Err(ProtocolError::OutOfTurn(_))));
    assert!(matches!(
        s.end_of_message(),
        Err(ProtocolError::WrongMode(_))
    ));
}

#[test]
fn client_cannot_read_before_asking() {
    let (job, _authority) = UnixStream::pair().unwrap();
    let mut s = Stream::client(job);
    assert!(matches!(s.decode(), Err(ProtocolError::OutOfTurn(_))));
}
