use std::fs::{self, DirBuilder, File, FileTimes, Metadata, OpenOptions, Permissions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{DirBuilderExt, FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;
use std::time::{Duration, SystemTime};

use nix::errno::Errno;
use nix::unistd::{self, AccessFlags};
use rsc_proto::{FILE_CHUNK_SIZE, FileStat, ProtocolError, Stream};

use crate::fds::OpenFile;
use crate::{Outcome, Reply, ShadowState, errno_of};

type HandlerResult = Result<Outcome, ProtocolError>;

fn os<T>(r: io::Result<T>) -> Result<T, Errno> {
    r.map_err(|e| errno_of(&e))
}

fn unit(r: Result<(), Errno>) -> Outcome {
    r.map(|()| Reply::ok())
}

fn get_mode<T: Read + Write>(s: &mut Stream<T>) -> Result<u32, ProtocolError> {
    u32::try_from(s.get_word()?).map_err(|_| ProtocolError::InvalidPayload("mode out of range"))
}

/// Requested length, capped at one transfer chunk.
fn get_len<T: Read + Write>(s: &mut Stream<T>) -> Result<Result<usize, Errno>, ProtocolError> {
    let len = s.get_i64()?;
    Ok(usize::try_from(len)
        .map(|l| l.min(FILE_CHUNK_SIZE))
        .map_err(|_| Errno::EINVAL))
}

pub(crate) fn stat_of(md: &Metadata) -> FileStat {
    FileStat {
        dev: md.dev(),
        ino: md.ino(),
        mode: md.mode(),
        nlink: md.nlink(),
        uid: md.uid(),
        gid: md.gid(),
        size: md.size() as i64,
        blksize: md.blksize(),
        blocks: md.blocks(),
        atime: md.atime(),
        mtime: md.mtime(),
        ctime: md.ctime(),
    }
}

/// Open with native `O_*` flags.
fn open_local(path: &Path, flags: i32, mode: u32) -> Result<File, Errno> {
    let mut opts = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_RDONLY => opts.read(true),
        libc::O_WRONLY => opts.write(true),
        libc::O_RDWR => opts.read(true).write(true),
        _ => return Err(Errno::EINVAL),
    };
    opts.custom_flags(flags & !libc::O_ACCMODE).mode(mode);
    os(opts.open(path))
}

pub(crate) fn open<T: Read + Write>(s: &mut Stream<T>, st: &mut ShadowState) -> HandlerResult {
    let name = s.get_str()?;
    let flags = s.get_i32()?;
    let mode = get_mode(s)?;
    s.end_of_message()?;
    let file = match st.resolve(&name).and_then(|p| open_local(&p, flags, mode)) {
        Ok(f) => f,
        Err(e) => return Ok(Err(e)),
    };
    st.report.file_opened(&name);
    let fd = st.fds.insert(OpenFile { file, name });
    Ok(Ok(Reply::Value(i64::from(fd))))
}

pub(crate) fn close<T: Read + Write>(s: &mut Stream<T>, st: &mut ShadowState) -> HandlerResult {
    let fd = s.get_i32()?;
    s.end_of_message()?;
    Ok(st.fds.remove(fd).map(|_| Reply::ok()))
}

pub(crate) fn read<T: Read + Write>(s: &mut Stream<T>, st: &mut ShadowState) -> HandlerResult {
    let fd = s.get_i32()?;
    let len = get_len(s)?;
    s.end_of_message()?;
    let res = len.and_then(|len| {
        let of = st.fds.get_mut(fd)?;
        let mut buf = vec![0u8; len];
        let n = os(of.file.read(&mut buf))?;
        buf.truncate(n);
        Ok((of.name.clone(), buf))
    });
    Ok(res.map(|(name, buf)| {
        st.report.file_read(&name, buf.len() as u64);
        Reply::Bytes(buf)
    }))
}

pub(crate) fn write<T: Read + Write>(s: &mut Stream<T>, st: &mut ShadowState) -> HandlerResult {
    let fd = s.get_i32()?;
    let data = s.get_bytes()?;
    s.end_of_message()?;
    let res = st.fds.get_mut(fd).and_then(|of| {
        let n = os(of.file.write(&data))?;
        Ok((of.name.clone(), n))
    });
    Ok(res.map(|(name, n)| {
        st.report.file_written(&name, n as u64);
        Reply::Value(n as i64)
    }))
}

pub(crate) fn lseek<T: Read + Write>(s: &mut Stream<T>, st: &mut ShadowState) -> HandlerResult {
    let fd = s.get_i32()?;
    let offset = s.get_i64()?;
    let whence = s.get_i32()?;
    s.end_of_message()?;
    let pos = match whence {
        libc::SEEK_SET => u64::try_from(offset).map(SeekFrom::Start).map_err(|_| Errno::EINVAL),
        libc::SEEK_CUR => Ok(SeekFrom::Current(offset)),
        libc::SEEK_END => Ok(SeekFrom::End(offset)),
        _ => Err(Errno::EINVAL),
    };
    let res = pos.and_then(|pos| {
        let of = st.fds.get_mut(fd)?;
        let at = os(of.file.seek(pos))?;
        Ok((of.name.clone(), at))
    });
    Ok(res.map(|(name, at)| {
        st.report.file_seeked(&name);
        Reply::Value(at as i64)
    }))
}

pub(crate) fn pread<T: Read + Write>(s: &mut Stream<T>, st: &mut ShadowState) -> HandlerResult {
    let fd = s.get_i32()?;
    let len = get_len(s)?;
    let offset = s.get_i64()?;
    s.end_of_message()?;
    let res = len.and_then(|len| {
        let offset = u64::try_from(offset).map_err(|_| Errno::EINVAL)?;
        let of = st.fds.get_mut(fd)?;
        let mut buf = vec![0u8; len];
        let n = os(of.file.read_at(&mut buf, offset))?;
        buf.truncate(n);
        Ok((of.name.clone(), buf))
    });
    Ok(res.map(|(name, buf)| {
        st.report.file_read(&name, buf.len() as u64);
        Reply::Bytes(buf)
    }))
}

pub(crate) fn pwrite<T: Read + Write>(s: &mut Stream<T>, st: &mut ShadowState) -> HandlerResult {
    let fd = s.get_i32()?;
    let data = s.get_bytes()?;
    let offset = s.get_i64()?;
    s.end_of_message()?;
    let res = u64::try_from(offset)
        .map_err(|_| Errno::EINVAL)
        .and_then(|offset| {
            let of = st.fds.get_mut(fd)?;
            let n = os(of.file.write_at(&data, offset))?;
            Ok((of.name.clone(), n))
        });
    Ok(res.map(|(name, n)| {
        st.report.file_written(&name, n as u64);
        Reply::Value(n as i64)
    }))
}

pub(crate) fn fsync<T: Read + Write>(s: &mut Stream<T>, st: &mut ShadowState) -> HandlerResult {
    let fd = s.get_i32()?;
    s.end_of_message()?;
    Ok(unit(st.fds.get_mut(fd).and_then(|of| os(of.file.sync_all()))))
}

pub(crate) fn ftruncate<T: Read + Write>(s: &mut Stream<T>, st: &mut ShadowState) -> HandlerResult {
    let fd = s.get_i32()?;
    let len = s.get_i64()?;
    s.end_of_message()?;
    Ok(unit(u64::try_from(len).map_err(|_| Errno::EINVAL).and_then(|len| {
        let of = st.fds.get_mut(fd)?;
        os(of.file.set_len(len))
    })))
}

pub(crate) fn fstat<T: Read + Write>(s: &mut Stream<T>, st: &mut ShadowState) -> HandlerResult {
    let fd = s.get_i32()?;
    s.end_of_message()?;
    Ok(st
        .fds
        .get_mut(fd)
        .and_then(|of| os(of.file.metadata()))
        .map(|md| Reply::Stat(stat_of(&md))))
}

/// Decode one path argument, end the message, run `op` on the resolved path.
fn with_path<T, F>(s: &mut Stream<T>, st: &mut ShadowState, op: F) -> HandlerResult
where
    T: Read + Write,
    F: FnOnce(&Path) -> Outcome,
{
    let path = s.get_str()?;
    s.end_of_message()?;
    Ok(st.resolve(&path).and_then(|p| op(&p)))
}

/// Two path arguments.
fn with_paths<T, F>(s: &mut Stream<T>, st: &mut ShadowState, op: F) -> HandlerResult
where
    T: Read + Write,
    F: FnOnce(&Path, &Path) -> Outcome,
{
    let a = s.get_str()?;
    let b = s.get_str()?;
    s.end_of_message()?;
    Ok(st
        .resolve(&a)
        .and_then(|a| st.resolve(&b).and_then(|b| op(&a, &b))))
}

pub(crate) fn unlink<T: Read + Write>(s: &mut Stream<T>, st: &mut ShadowState) -> HandlerResult {
    with_path(s, st, |p| unit(os(fs::remove_file(p))))
}

pub(crate) fn rename<T: Read + Write>(s: &mut Stream<T>, st: &mut ShadowState) -> HandlerResult {
    with_paths(s, st, |from, to| unit(os(fs::rename(from, to))))
}

pub(crate) fn mkdir<T: Read + Write>(s: &mut Stream<T>, st: &mut ShadowState) -> HandlerResult {
    let path = s.get_str()?;
    let mode = get_mode(s)?;
    s.end_of_message()?;
    Ok(unit(st.resolve(&path).and_then(|p| {
        os(DirBuilder::new().mode(mode).create(p))
    })))
}

pub(crate) fn rmdir<T: Read + Write>(s: &mut Stream<T>, st: &mut ShadowState) -> HandlerResult {
    with_path(s, st, |p| unit(os(fs::remove_dir(p))))
}

pub(crate) fn chdir<T: Read + Write>(s: &mut Stream<T>, st: &mut ShadowState) -> HandlerResult {
    let path = s.get_str()?;
    s.end_of_message()?;
    let res = st.resolve(&path).and_then(|p| {
        if os(fs::metadata(&p))?.is_dir() {
            Ok(p)
        } else {
            Err(Errno::ENOTDIR)
        }
    });
    Ok(res.map(|p| {
        st.cwd = p;
        Reply::ok()
    }))
}

pub(crate) fn getcwd<T: Read + Write>(s: &mut Stream<T>, st: &mut ShadowState) -> HandlerResult {
    s.end_of_message()?;
    Ok(Ok(Reply::Str(st.cwd.display().to_string())))
}

pub(crate) fn access<T: Read + Write>(s: &mut Stream<T>, st: &mut ShadowState) -> HandlerResult {
    let path = s.get_str()?;
    let mode = s.get_i32()?;
    s.end_of_message()?;
    Ok(unit(st.resolve(&path).and_then(|p| {
        unistd::access(p.as_path(), AccessFlags::from_bits_truncate(mode))
    })))
}

pub(crate) fn chmod<T: Read + Write>(s: &mut Stream<T>, st: &mut ShadowState) -> HandlerResult {
    let path = s.get_str()?;
    let mode = get_mode(s)?;
    s.end_of_message()?;
    Ok(unit(st.resolve(&path).and_then(|p| {
        os(fs::set_permissions(p, Permissions::from_mode(mode)))
    })))
}

pub(crate) fn truncate<T: Read + Write>(s: &mut Stream<T>, st: &mut ShadowState) -> HandlerResult {
    let path = s.get_str()?;
    let len = s.get_i64()?;
    s.end_of_message()?;
    Ok(unit(st.resolve(&path).and_then(|p| unistd::truncate(p.as_path(), len))))
}

pub(crate) fn stat<T: Read + Write>(s: &mut Stream<T>, st: &mut ShadowState) -> HandlerResult {
    with_path(s, st, |p| os(fs::metadata(p)).map(|md| Reply::Stat(stat_of(&md))))
}

pub(crate) fn lstat<T: Read + Write>(s: &mut Stream<T>, st: &mut ShadowState) -> HandlerResult {
    with_path(s, st, |p| {
        os(fs::symlink_metadata(p)).map(|md| Reply::Stat(stat_of(&md)))
    })
}

/// The link target is stored verbatim; only the link's own path resolves.
pub(crate) fn symlink<T: Read + Write>(s: &mut Stream<T>, st: &mut ShadowState) -> HandlerResult {
    let target = s.get_str()?;
    let link = s.get_str()?;
    s.end_of_message()?;
    Ok(unit(st.resolve(&link).and_then(|l| {
        os(std::os::unix::fs::symlink(&target, l))
    })))
}

pub(crate) fn readlink<T: Read + Write>(s: &mut Stream<T>, st: &mut ShadowState) -> HandlerResult {
    with_path(s, st, |p| {
        os(fs::read_link(p)).map(|t| Reply::Str(t.to_string_lossy().into_owned()))
    })
}

pub(crate) fn link<T: Read + Write>(s: &mut Stream<T>, st: &mut ShadowState) -> HandlerResult {
    with_paths(s, st, |existing, new| unit(os(fs::hard_link(existing, new))))
}

pub(crate) fn getuid<T: Read + Write>(s: &mut Stream<T>, st: &mut ShadowState) -> HandlerResult {
    s.end_of_message()?;
    Ok(Ok(Reply::Value(i64::from(st.user.uid))))
}

pub(crate) fn getgid<T: Read + Write>(s: &mut Stream<T>, st: &mut ShadowState) -> HandlerResult {
    s.end_of_message()?;
    Ok(Ok(Reply::Value(i64::from(st.user.gid))))
}

fn epoch_secs(secs: i64) -> Result<SystemTime, Errno> {
    let secs = u64::try_from(secs).map_err(|_| Errno::EINVAL)?;
    SystemTime::UNIX_EPOCH
        .checked_add(Duration::from_secs(secs))
        .ok_or(Errno::EINVAL)
}

pub(crate) fn utime<T: Read + Write>(s: &mut Stream<T>, st: &mut ShadowState) -> HandlerResult {
    let path = s.get_str()?;
    let atime = s.get_i64()?;
    let mtime = s.get_i64()?;
    s.end_of_message()?;
    Ok(unit(st.resolve(&path).and_then(|p| {
        let times = FileTimes::new()
            .set_accessed(epoch_secs(atime)?)
            .set_modified(epoch_secs(mtime)?);
        os(File::open(p).and_then(|f| f.set_times(times)))
    })))
}
