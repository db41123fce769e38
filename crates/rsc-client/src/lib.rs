//! Job side of the remote syscall channel.
//!
//! Every call has the same shape on the wire:
//!
//! ```text
//! request:  [call number: int][args ...]                         end_of_message
//! reply:    [rval: int] [errno: int]       (rval <  0)           end_of_message
//!           [rval: int] [payload ...]      (rval >= 0)
//! ```
//!
//! A negative `rval` becomes [`RemoteError::Errno`]; anything that breaks the
//! framing becomes [`RemoteError::Protocol`], after which the connection is
//! unusable.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use nix::errno::Errno;
use rsc_proto::{
    FILE_CHUNK_SIZE, FileStat, MachineInfo, ProtocolError, Record, Stream, SyscallNumber,
};
use tracing::{debug, trace};

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("remote call failed: {0}")]
    Errno(Errno),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("local file: {0}")]
    Io(#[from] io::Error),
}

impl RemoteError {
    /// The OS error behind this failure, if there is one.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            RemoteError::Errno(e) => Some(*e),
            RemoteError::Io(e) => e.raw_os_error().map(Errno::from_raw),
            RemoteError::Protocol(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;

fn no_args<T>(_: &mut Stream<T>) -> std::result::Result<(), ProtocolError> {
    Ok(())
}

fn rval_only<T>(_: &mut Stream<T>, rval: i64) -> std::result::Result<i64, ProtocolError> {
    Ok(rval)
}

fn to_u32(rval: i64, what: &'static str) -> Result<u32> {
    u32::try_from(rval).map_err(|_| ProtocolError::InvalidPayload(what).into())
}

/// Typed remote calls over one client [`Stream`].
pub struct RemoteSyscalls<T> {
    stream: Stream<T>,
}

impl<T: Read + Write> RemoteSyscalls<T> {
    pub fn new(io: T) -> Self {
        Self {
            stream: Stream::client(io),
        }
    }

    pub fn into_inner(self) -> T {
        self.stream.into_inner()
    }

    pub fn stream_mut(&mut self) -> &mut Stream<T> {
        &mut self.stream
    }

    /// One request/reply round trip.
    fn call<R>(
        &mut self,
        num: SyscallNumber,
        args: impl FnOnce(&mut Stream<T>) -> std::result::Result<(), ProtocolError>,
        reply: impl FnOnce(&mut Stream<T>, i64) -> std::result::Result<R, ProtocolError>,
    ) -> Result<R> {
        trace!(call = num.name(), "remote call");
        let s = &mut self.stream;
        s.encode()?;
        s.put_i32(num.number())?;
        args(s)?;
        s.end_of_message()?;

        s.decode()?;
        let rval = s.get_i64()?;
        if rval < 0 {
            let errno = s.get_i32()?;
            s.end_of_message()?;
            let errno = Errno::from_raw(errno);
            debug!(call = num.name(), %errno, "remote call failed");
            return Err(RemoteError::Errno(errno));
        }
        let out = reply(s, rval)?;
        s.end_of_message()?;
        Ok(out)
    }

    fn call_unit(
        &mut self,
        num: SyscallNumber,
        args: impl FnOnce(&mut Stream<T>) -> std::result::Result<(), ProtocolError>,
    ) -> Result<()> {
        self.call(num, args, |_, _| Ok(()))
    }

    fn call_str(
        &mut self,
        num: SyscallNumber,
        args: impl FnOnce(&mut Stream<T>) -> std::result::Result<(), ProtocolError>,
    ) -> Result<String> {
        self.call(num, args, |s, _| s.get_str())
    }

    fn call_stat(
        &mut self,
        num: SyscallNumber,
        args: impl FnOnce(&mut Stream<T>) -> std::result::Result<(), ProtocolError>,
    ) -> Result<FileStat> {
        self.call(num, args, |s, _| s.get::<FileStat>())
    }

    // -----------------------------------------------------------------------
    // Pseudo calls
    // -----------------------------------------------------------------------

    pub fn register_machine_info(&mut self, info: &MachineInfo) -> Result<()> {
        self.call_unit(SyscallNumber::RegisterMachineInfo, |s| s.put(info))
    }

    pub fn register_starter_info(&mut self, ad: &Record) -> Result<()> {
        self.call_unit(SyscallNumber::RegisterStarterInfo, |s| s.put(ad))
    }

    pub fn register_job_info(&mut self, ad: &Record) -> Result<()> {
        self.call_unit(SyscallNumber::RegisterJobInfo, |s| s.put(ad))
    }

    pub fn begin_execution(&mut self) -> Result<()> {
        self.call_unit(SyscallNumber::BeginExecution, no_args)
    }

    pub fn get_job_info(&mut self) -> Result<Record> {
        self.call(SyscallNumber::GetJobInfo, no_args, |s, _| s.get::<Record>())
    }

    pub fn get_user_info(&mut self) -> Result<Record> {
        self.call(SyscallNumber::GetUserInfo, no_args, |s, _| s.get::<Record>())
    }

    pub fn get_a_out_name(&mut self) -> Result<String> {
        self.call_str(SyscallNumber::GetAOutName, no_args)
    }

    pub fn get_iwd(&mut self) -> Result<String> {
        self.call_str(SyscallNumber::GetIwd, no_args)
    }

    /// Working directory on the submit side, for files sent back there.
    pub fn getwd_special(&mut self) -> Result<String> {
        self.call_str(SyscallNumber::GetwdSpecial, no_args)
    }

    /// Free space in KiB on the filesystem holding `path`.
    pub fn free_fs_blocks(&mut self, path: &str) -> Result<i64> {
        self.call(SyscallNumber::FreeFsBlocks, |s| s.put_str(path), rval_only)
    }

    /// Logical name (`In`, `Out`, `Err`) for a standard descriptor.
    pub fn get_std_file_info(&mut self, fd: i32) -> Result<String> {
        self.call_str(SyscallNumber::GetStdFileInfo, |s| s.put_i32(fd))
    }

    /// Access URL (`local:/path`, `append:/path`, `remote:/path`) for a
    /// logical file name.
    pub fn get_file_info_new(&mut self, logical: &str) -> Result<String> {
        self.call_str(SyscallNumber::GetFileInfoNew, |s| s.put_str(logical))
    }

    pub fn report_error(&mut self, message: &str) -> Result<()> {
        self.call_unit(SyscallNumber::ReportError, |s| s.put_str(message))
    }

    /// Attribute `name` of the job ad, as expression text.
    pub fn get_job_attr(&mut self, name: &str) -> Result<String> {
        self.call_str(SyscallNumber::GetJobAttr, |s| s.put_str(name))
    }

    pub fn set_job_attr(&mut self, name: &str, expr: &str) -> Result<()> {
        self.call_unit(SyscallNumber::SetJobAttr, |s| {
            s.put_str(name)?;
            s.put_str(expr)
        })
    }

    /// Up to `len` bytes of `path` starting at `offset`. Short or empty at EOF.
    pub fn get_file(&mut self, path: &str, offset: i64, len: usize) -> Result<Vec<u8>> {
        self.call(
            SyscallNumber::GetFile,
            |s| {
                s.put_str(path)?;
                s.put_i64(offset)?;
                s.put_i64(len as i64)
            },
            |s, _| s.get_bytes(),
        )
    }

    /// Write `data` into `path` at `offset`. Offset 0 creates or truncates
    /// the file with `mode`.
    pub fn put_file(&mut self, path: &str, offset: i64, data: &[u8], mode: u32) -> Result<usize> {
        self.call(
            SyscallNumber::PutFile,
            |s| {
                s.put_str(path)?;
                s.put_i64(offset)?;
                s.put_bytes(data)?;
                s.put_word(u64::from(mode))
            },
            |_, rval| Ok(rval as usize),
        )
    }

    /// Report the job's end. The authority stops serving this job after
    /// replying, so the client is consumed.
    pub fn job_exit(mut self, status: i32, reason: i32, update: &Record) -> Result<()> {
        self.call_unit(SyscallNumber::JobExit, |s| {
            s.put_i32(status)?;
            s.put_i32(reason)?;
            s.put(update)
        })
    }

    // -----------------------------------------------------------------------
    // File transfer
    // -----------------------------------------------------------------------

    /// Copy remote `remote` to local `local` (created with `mode`), one
    /// chunk per call. Returns the byte count.
    pub fn fetch_file(&mut self, remote: &str, local: &Path, mode: u32) -> Result<u64> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(local)?;
        let mut offset = 0u64;
        loop {
            let chunk = self.get_file(remote, offset as i64, FILE_CHUNK_SIZE)?;
            if chunk.is_empty() {
                break;
            }
            file.write_all(&chunk)?;
            offset += chunk.len() as u64;
            if chunk.len() < FILE_CHUNK_SIZE {
                break;
            }
        }
        file.set_permissions(std::fs::Permissions::from_mode(mode))?;
        debug!(remote, local = %local.display(), bytes = offset, "fetched file");
        Ok(offset)
    }

    /// Copy local `local` to remote `remote` with `mode`. An empty file still
    /// creates the remote file.
    pub fn send_file(&mut self, local: &Path, remote: &str, mode: u32) -> Result<u64> {
        let mut file = File::open(local)?;
        let mut offset = 0u64;
        loop {
            let mut chunk = Vec::with_capacity(FILE_CHUNK_SIZE);
            (&mut file)
                .take(FILE_CHUNK_SIZE as u64)
                .read_to_end(&mut chunk)?;
            if chunk.is_empty() && offset > 0 {
                break;
            }
            let sent = self.put_file(remote, offset as i64, &chunk, mode)?;
            if sent != chunk.len() {
                return Err(RemoteError::Errno(Errno::EIO));
            }
            offset += chunk.len() as u64;
            if chunk.len() < FILE_CHUNK_SIZE {
                break;
            }
        }
        debug!(local = %local.display(), remote, bytes = offset, "sent file");
        Ok(offset)
    }

    // -----------------------------------------------------------------------
    // POSIX calls
    // -----------------------------------------------------------------------

    pub fn open(&mut self, path: &str, flags: i32, mode: u32) -> Result<i32> {
        self.call(
            SyscallNumber::Open,
            |s| {
                s.put_str(path)?;
                s.put_i32(flags)?;
                s.put_word(u64::from(mode))
            },
            |_, rval| {
                i32::try_from(rval).map_err(|_| ProtocolError::InvalidPayload("fd out of range"))
            },
        )
    }

    pub fn close(&mut self, fd: i32) -> Result<()> {
        self.call_unit(SyscallNumber::Close, |s| s.put_i32(fd))
    }

    pub fn read(&mut self, fd: i32, len: usize) -> Result<Vec<u8>> {
        self.call(
            SyscallNumber::Read,
            |s| {
                s.put_i32(fd)?;
                s.put_i64(len as i64)
            },
            |s, _| s.get_bytes(),
        )
    }

    pub fn write(&mut self, fd: i32, data: &[u8]) -> Result<usize> {
        self.call(
            SyscallNumber::Write,
            |s| {
                s.put_i32(fd)?;
                s.put_bytes(data)
            },
            |_, rval| Ok(rval as usize),
        )
    }

    pub fn lseek(&mut self, fd: i32, offset: i64, whence: i32) -> Result<i64> {
        self.call(
            SyscallNumber::Lseek,
            |s| {
                s.put_i32(fd)?;
                s.put_i64(offset)?;
                s.put_i32(whence)
            },
            rval_only,
        )
    }

    pub fn pread(&mut self, fd: i32, len: usize, offset: i64) -> Result<Vec<u8>> {
        self.call(
            SyscallNumber::Pread,
            |s| {
                s.put_i32(fd)?;
                s.put_i64(len as i64)?;
                s.put_i64(offset)
            },
            |s, _| s.get_bytes(),
        )
    }

    pub fn pwrite(&mut self, fd: i32, data: &[u8], offset: i64) -> Result<usize> {
        self.call(
            SyscallNumber::Pwrite,
            |s| {
                s.put_i32(fd)?;
                s.put_bytes(data)?;
                s.put_i64(offset)
            },
            |_, rval| Ok(rval as usize),
        )
    }

    pub fn fsync(&mut self, fd: i32) -> Result<()> {
        self.call_unit(SyscallNumber::Fsync, |s| s.put_i32(fd))
    }

    pub fn ftruncate(&mut self, fd: i32, len: i64) -> Result<()> {
        self.call_unit(SyscallNumber::Ftruncate, |s| {
            s.put_i32(fd)?;
            s.put_i64(len)
        })
    }

    pub fn fstat(&mut self, fd: i32) -> Result<FileStat> {
        self.call_stat(SyscallNumber::Fstat, |s| s.put_i32(fd))
    }

    pub fn unlink(&mut self, path: &str) -> Result<()> {
        self.call_unit(SyscallNumber::Unlink, |s| s.put_str(path))
    }

    pub fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        self.call_unit(SyscallNumber::Rename, |s| {
            s.put_str(from)?;
            s.put_str(to)
        })
    }

    pub fn mkdir(&mut self, path: &str, mode: u32) -> Result<()> {
        self.call_unit(SyscallNumber::Mkdir, |s| {
            s.put_str(path)?;
            s.put_word(u64::from(mode))
        })
    }

    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        self.call_unit(SyscallNumber::Rmdir, |s| s.put_str(path))
    }

    pub fn chdir(&mut self, path: &str) -> Result<()> {
        self.call_unit(SyscallNumber::Chdir, |s| s.put_str(path))
    }

    pub fn getcwd(&mut self) -> Result<String> {
        self.call_str(SyscallNumber::Getcwd, no_args)
    }

    pub fn access(&mut self, path: &str, mode: i32) -> Result<()> {
        self.call_unit(SyscallNumber::Access, |s| {
            s.put_str(path)?;
            s.put_i32(mode)
        })
    }

    pub fn chmod(&mut self, path: &str, mode: u32) -> Result<()> {
        self.call_unit(SyscallNumber::Chmod, |s| {
            s.put_str(path)?;
            s.put_word(u64::from(mode))
        })
    }

    pub fn truncate(&mut self, path: &str, len: i64) -> Result<()> {
        self.call_unit(SyscallNumber::Truncate, |s| {
            s.put_str(path)?;
            s.put_i64(len)
        })
    }

    pub fn stat(&mut self, path: &str) -> Result<FileStat> {
        self.call_stat(SyscallNumber::Stat, |s| s.put_str(path))
    }

    pub fn lstat(&mut self, path: &str) -> Result<FileStat> {
        self.call_stat(SyscallNumber::Lstat, |s| s.put_str(path))
    }

    pub fn symlink(&mut self, target: &str, link: &str) -> Result<()> {
        self.call_unit(SyscallNumber::Symlink, |s| {
            s.put_str(target)?;
            s.put_str(link)
        })
    }

    pub fn readlink(&mut self, path: &str) -> Result<String> {
        self.call_str(SyscallNumber::Readlink, |s| s.put_str(path))
    }

    pub fn link(&mut self, existing: &str, new: &str) -> Result<()> {
        self.call_unit(SyscallNumber::Link, |s| {
            s.put_str(existing)?;
            s.put_str(new)
        })
    }

    pub fn getuid(&mut self) -> Result<u32> {
        let rval = self.call(SyscallNumber::Getuid, no_args, rval_only)?;
        to_u32(rval, "uid out of range")
    }

    pub fn getgid(&mut self) -> Result<u32> {
        let rval = self.call(SyscallNumber::Getgid, no_args, rval_only)?;
        to_u32(rval, "gid out of range")
    }

    pub fn geteuid(&mut self) -> Result<u32> {
        let rval = self.call(SyscallNumber::Geteuid, no_args, rval_only)?;
        to_u32(rval, "uid out of range")
    }

    pub fn getegid(&mut self) -> Result<u32> {
        let rval = self.call(SyscallNumber::Getegid, no_args, rval_only)?;
        to_u32(rval, "gid out of range")
    }

    /// Set access and modification times, in seconds since the epoch.
    pub fn utime(&mut self, path: &str, atime: i64, mtime: i64) -> Result<()> {
        self.call_unit(SyscallNumber::Utime, |s| {
            s.put_str(path)?;
            s.put_i64(atime)?;
            s.put_i64(mtime)
        })
    }
}
