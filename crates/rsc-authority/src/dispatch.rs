use std::io::{Read, Write};

use rsc_proto::{ProtocolError, Stream, SyscallNumber};

use crate::{Outcome, ShadowState, posix, pseudo};

/// One call's handler: decodes exactly its arguments, ends the request
/// message, performs the call. The reply is encoded by the session.
pub type Handler<T> = fn(&mut Stream<T>, &mut ShadowState) -> Result<Outcome, ProtocolError>;

/// Call number to handler, indexed by `num - SyscallNumber::MIN`.
pub struct DispatchTable<T> {
    handlers: Vec<Option<Handler<T>>>,
}

impl<T: Read + Write> Default for DispatchTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Read + Write> DispatchTable<T> {
    /// Table with every known call.
    pub fn new() -> Self {
        use SyscallNumber as N;
        let entries: [(SyscallNumber, Handler<T>); 47] = [
            (N::RegisterMachineInfo, pseudo::register_machine_info),
            (N::RegisterStarterInfo, pseudo::register_starter_info),
            (N::RegisterJobInfo, pseudo::register_job_info),
            (N::BeginExecution, pseudo::begin_execution),
            (N::GetJobInfo, pseudo::get_job_info),
            (N::GetUserInfo, pseudo::get_user_info),
            (N::JobExit, pseudo::job_exit),
            (N::GetAOutName, pseudo::get_a_out_name),
            (N::GetIwd, pseudo::get_iwd),
            (N::GetwdSpecial, pseudo::getwd_special),
            (N::FreeFsBlocks, pseudo::free_fs_blocks),
            (N::GetStdFileInfo, pseudo::get_std_file_info),
            (N::GetFileInfoNew, pseudo::get_file_info_new),
            (N::ReportError, pseudo::report_error),
            (N::GetJobAttr, pseudo::get_job_attr),
            (N::SetJobAttr, pseudo::set_job_attr),
            (N::GetFile, pseudo::get_file),
            (N::PutFile, pseudo::put_file),
            (N::Open, posix::open),
            (N::Close, posix::close),
            (N::Read, posix::read),
            (N::Write, posix::write),
            (N::Lseek, posix::lseek),
            (N::Pread, posix::pread),
            (N::Pwrite, posix::pwrite),
            (N::Fsync, posix::fsync),
            (N::Ftruncate, posix::ftruncate),
            (N::Fstat, posix::fstat),
            (N::Unlink, posix::unlink),
            (N::Rename, posix::rename),
            (N::Mkdir, posix::mkdir),
            (N::Rmdir, posix::rmdir),
            (N::Chdir, posix::chdir),
            (N::Getcwd, posix::getcwd),
            (N::Access, posix::access),
            (N::Chmod, posix::chmod),
            (N::Truncate, posix::truncate),
            (N::Stat, posix::stat),
            (N::Lstat, posix::lstat),
            (N::Symlink, posix::symlink),
            (N::Readlink, posix::readlink),
            (N::Link, posix::link),
            (N::Getuid, posix::getuid),
            (N::Getgid, posix::getgid),
            // The job runs as its owner, so effective ids are the real ones.
            (N::Geteuid, posix::getuid),
            (N::Getegid, posix::getgid),
            (N::Utime, posix::utime),
        ];
        let mut table = Self {
            handlers: vec![None; SyscallNumber::TABLE_SIZE],
        };
        for (num, handler) in entries {
            table.set(num, handler);
        }
        table
    }

    /// Install or replace the handler for `num`.
    pub fn set(&mut self, num: SyscallNumber, handler: Handler<T>) {
        if let Some(slot) = self.handlers.get_mut(num.index()) {
            *slot = Some(handler);
        }
    }

    /// Handler for a raw call number. Numbers outside the call range, or
    /// with no handler, are a protocol error: there is no soft "unsupported"
    /// reply.
    pub fn lookup(&self, raw: i32) -> Result<(SyscallNumber, Handler<T>), ProtocolError> {
        let num = SyscallNumber::try_from(raw)?;
        self.handlers
            .get(num.index())
            .copied()
            .flatten()
            .map(|h| (num, h))
            .ok_or(ProtocolError::UnknownSyscall(raw))
    }
}
