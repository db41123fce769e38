//! Authority side of the remote syscall channel.
//!
//! A [`Session`] serves one job: it reads a call number, looks the handler up
//! in the [`DispatchTable`], lets it decode exactly its own arguments, runs
//! the operation locally on behalf of the job and answers with the return
//! value (plus errno on failure). Anything that desynchronizes the stream is
//! a [`ProtocolError`]; [`Session::serve_or_die`] turns that into process
//! exit.
//!
//! ## Handler Layout
//!
//! | module     | calls                                                    |
//! |------------|----------------------------------------------------------|
//! | `pseudo`   | registration, job/user info, file naming, transfer, exit |
//! | `posix`    | open/read/write/... executed against the local fs        |

mod dispatch;
mod fds;
mod posix;
mod pseudo;
mod session;
mod shadow;

pub use dispatch::{DispatchTable, Handler};
pub use session::Session;
pub use shadow::{JobExit, ShadowState, UserInfo};

use nix::errno::Errno;
pub use rsc_proto::ProtocolError;

#[derive(Debug, thiserror::Error)]
pub enum AuthorityError {
    #[error("job ad has no {0} attribute")]
    MissingAttribute(&'static str),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Result of one local operation: a reply, or the errno captured right
/// after the failing call.
pub type Outcome = Result<Reply, Errno>;

/// What goes back to the job after `rval`.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `rval` only.
    Value(i64),
    /// `rval = 0`, then a string.
    Str(String),
    /// `rval = len`, then the bytes.
    Bytes(Vec<u8>),
    /// `rval = 0`, then a stat block.
    Stat(rsc_proto::FileStat),
    /// `rval = 0`, then a record.
    Record(rsc_proto::Record),
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Value(0)
    }
}

/// Errno carried by an I/O error, `EIO` if it has none.
pub(crate) fn errno_of(e: &std::io::Error) -> Errno {
    e.raw_os_error().map_or(Errno::EIO, Errno::from_raw)
}
