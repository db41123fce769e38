use std::fs::{File, OpenOptions, Permissions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{FileExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;

use nix::errno::Errno;
use nix::sys::statvfs::statvfs;
use rsc_proto::{AttrValue, FILE_CHUNK_SIZE, MachineInfo, ProtocolError, Record, Stream, attr};
use tracing::{debug, info, warn};

use crate::shadow::JobExit;
use crate::{Outcome, Reply, ShadowState, errno_of};

type HandlerResult = Result<Outcome, ProtocolError>;

pub(crate) fn register_machine_info<T: Read + Write>(
    s: &mut Stream<T>,
    st: &mut ShadowState,
) -> HandlerResult {
    let info: MachineInfo = s.get()?;
    s.end_of_message()?;
    info!(
        host = %info.full_hostname,
        uid_domain = %info.uid_domain,
        fs_domain = %info.fs_domain,
        addr = %info.starter_addr,
        "execute machine registered"
    );
    st.machine = Some(info);
    Ok(Ok(Reply::ok()))
}

pub(crate) fn register_starter_info<T: Read + Write>(
    s: &mut Stream<T>,
    st: &mut ShadowState,
) -> HandlerResult {
    let ad: Record = s.get()?;
    s.end_of_message()?;
    debug!(attrs = ad.len(), "starter info");
    st.starter_ad = Some(ad);
    Ok(Ok(Reply::ok()))
}

pub(crate) fn register_job_info<T: Read + Write>(
    s: &mut Stream<T>,
    st: &mut ShadowState,
) -> HandlerResult {
    let ad: Record = s.get()?;
    s.end_of_message()?;
    st.job_ad.merge(&ad);
    Ok(Ok(Reply::ok()))
}

pub(crate) fn begin_execution<T: Read + Write>(
    s: &mut Stream<T>,
    st: &mut ShadowState,
) -> HandlerResult {
    s.end_of_message()?;
    info!("job began execution");
    st.executing = true;
    Ok(Ok(Reply::ok()))
}

pub(crate) fn get_job_info<T: Read + Write>(
    s: &mut Stream<T>,
    st: &mut ShadowState,
) -> HandlerResult {
    s.end_of_message()?;
    Ok(Ok(Reply::Record(st.job_ad.clone())))
}

pub(crate) fn get_user_info<T: Read + Write>(
    s: &mut Stream<T>,
    st: &mut ShadowState,
) -> HandlerResult {
    s.end_of_message()?;
    Ok(Ok(Reply::Record(st.user.to_record())))
}

pub(crate) fn job_exit<T: Read + Write>(s: &mut Stream<T>, st: &mut ShadowState) -> HandlerResult {
    let status = s.get_i32()?;
    let reason = s.get_i32()?;
    let update: Record = s.get()?;
    s.end_of_message()?;
    info!(status, reason, "job exit reported");
    st.job_ad.merge(&update);
    st.exit = Some(JobExit {
        status,
        reason,
        update,
    });
    Ok(Ok(Reply::ok()))
}

/// The image to run: the checkpoint for a restart, else `Cmd`. Relative
/// names are taken from the initial working directory; `host:path` names
/// pass through for the execute side to resolve.
pub(crate) fn get_a_out_name<T: Read + Write>(
    s: &mut Stream<T>,
    st: &mut ShadowState,
) -> HandlerResult {
    s.end_of_message()?;
    let ad = &st.job_ad;
    let name = match (ad.get_bool(attr::IS_RESTART), ad.get_str(attr::CHECKPOINT_FILE)) {
        (Some(true), Some(ckpt)) => ckpt,
        _ => ad.get_str(attr::CMD).unwrap_or_default(),
    };
    let name = if name.starts_with('/') || name.contains(':') {
        name.to_string()
    } else {
        st.iwd.join(name).display().to_string()
    };
    Ok(Ok(Reply::Str(name)))
}

pub(crate) fn get_iwd<T: Read + Write>(s: &mut Stream<T>, st: &mut ShadowState) -> HandlerResult {
    s.end_of_message()?;
    Ok(Ok(Reply::Str(st.iwd.display().to_string())))
}

pub(crate) fn getwd_special<T: Read + Write>(
    s: &mut Stream<T>,
    st: &mut ShadowState,
) -> HandlerResult {
    s.end_of_message()?;
    Ok(Ok(Reply::Str(st.cwd.display().to_string())))
}

// statvfs field widths differ between targets.
#[allow(clippy::unnecessary_cast)]
fn free_kb(path: &Path) -> Result<i64, Errno> {
    let st = statvfs(path)?;
    let bytes = (st.blocks_available() as u64).saturating_mul(st.fragment_size() as u64);
    Ok(i64::try_from(bytes / 1024).unwrap_or(i64::MAX))
}

pub(crate) fn free_fs_blocks<T: Read + Write>(
    s: &mut Stream<T>,
    st: &mut ShadowState,
) -> HandlerResult {
    let path = s.get_str()?;
    s.end_of_message()?;
    Ok(st
        .resolve(&path)
        .and_then(|p| free_kb(&p))
        .map(Reply::Value))
}

pub(crate) fn get_std_file_info<T: Read + Write>(
    s: &mut Stream<T>,
    _st: &mut ShadowState,
) -> HandlerResult {
    let fd = s.get_i32()?;
    s.end_of_message()?;
    let logical = match fd {
        0 => attr::IN,
        1 => attr::OUT,
        2 => attr::ERR,
        _ => return Ok(Err(Errno::EINVAL)),
    };
    Ok(Ok(Reply::Str(logical.to_string())))
}

/// `local:<path>` or `append:<path>` for a logical name. `In`, `Out` and
/// `Err` map through the job ad (unset means `/dev/null`); other names are
/// file names.
pub(crate) fn get_file_info_new<T: Read + Write>(
    s: &mut Stream<T>,
    st: &mut ShadowState,
) -> HandlerResult {
    let logical = s.get_str()?;
    s.end_of_message()?;
    let name = match logical.as_str() {
        attr::IN | attr::OUT | attr::ERR => {
            st.job_ad.get_str(&logical).unwrap_or("/dev/null").to_string()
        }
        other => other.to_string(),
    };
    let path = match st.resolve(&name) {
        Ok(p) => p,
        Err(e) => return Ok(Err(e)),
    };
    let scheme = if st.is_append_file(&name) { "append" } else { "local" };
    Ok(Ok(Reply::Str(format!("{scheme}:{}", path.display()))))
}

pub(crate) fn report_error<T: Read + Write>(
    s: &mut Stream<T>,
    st: &mut ShadowState,
) -> HandlerResult {
    let message = s.get_str()?;
    s.end_of_message()?;
    warn!(%message, "job reported error");
    st.report.record_error(&message);
    Ok(Ok(Reply::ok()))
}

pub(crate) fn get_job_attr<T: Read + Write>(
    s: &mut Stream<T>,
    st: &mut ShadowState,
) -> HandlerResult {
    let name = s.get_str()?;
    s.end_of_message()?;
    Ok(st
        .job_ad
        .get(&name)
        .map(|v| Reply::Str(v.to_string()))
        .ok_or(Errno::ENOENT))
}

pub(crate) fn set_job_attr<T: Read + Write>(
    s: &mut Stream<T>,
    st: &mut ShadowState,
) -> HandlerResult {
    let name = s.get_str()?;
    let expr = s.get_str()?;
    s.end_of_message()?;
    match AttrValue::parse(&expr) {
        Ok(value) => {
            st.job_ad.insert(&name, value);
            Ok(Ok(Reply::ok()))
        }
        Err(_) => Ok(Err(Errno::EINVAL)),
    }
}

fn read_chunk(path: &Path, offset: i64, len: i64) -> Result<Vec<u8>, Errno> {
    let offset = u64::try_from(offset).map_err(|_| Errno::EINVAL)?;
    let len = usize::try_from(len)
        .map_err(|_| Errno::EINVAL)?
        .min(FILE_CHUNK_SIZE);
    let mut file = File::open(path).map_err(|e| errno_of(&e))?;
    file.seek(SeekFrom::Start(offset)).map_err(|e| errno_of(&e))?;
    let mut buf = Vec::with_capacity(len);
    file.take(len as u64)
        .read_to_end(&mut buf)
        .map_err(|e| errno_of(&e))?;
    Ok(buf)
}

pub(crate) fn get_file<T: Read + Write>(s: &mut Stream<T>, st: &mut ShadowState) -> HandlerResult {
    let name = s.get_str()?;
    let offset = s.get_i64()?;
    let len = s.get_i64()?;
    s.end_of_message()?;
    let outcome = st
        .resolve(&name)
        .and_then(|p| read_chunk(&p, offset, len));
    if let Ok(data) = &outcome {
        st.report.file_read(&name, data.len() as u64);
    }
    Ok(outcome.map(Reply::Bytes))
}

fn write_chunk(path: &Path, offset: i64, data: &[u8], mode: u32) -> Result<i64, Errno> {
    let offset = u64::try_from(offset).map_err(|_| Errno::EINVAL)?;
    let mut opts = OpenOptions::new();
    opts.write(true);
    if offset == 0 {
        opts.create(true).truncate(true).mode(mode);
    }
    let file = opts.open(path).map_err(|e| errno_of(&e))?;
    if offset == 0 {
        file.set_permissions(Permissions::from_mode(mode))
            .map_err(|e| errno_of(&e))?;
    }
    file.write_all_at(data, offset).map_err(|e| errno_of(&e))?;
    Ok(data.len() as i64)
}

pub(crate) fn put_file<T: Read + Write>(s: &mut Stream<T>, st: &mut ShadowState) -> HandlerResult {
    let name = s.get_str()?;
    let offset = s.get_i64()?;
    let data = s.get_bytes()?;
    let mode = u32::try_from(s.get_word()?)
        .map_err(|_| ProtocolError::InvalidPayload("file mode out of range"))?;
    s.end_of_message()?;
    let outcome = st
        .resolve(&name)
        .and_then(|p| write_chunk(&p, offset, &data, mode));
    if outcome.is_ok() {
        st.report.file_written(&name, data.len() as u64);
    }
    Ok(outcome.map(Reply::Value))
}
