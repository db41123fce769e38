use nix::errno::Errno;
use rsc_client::RemoteError;

use crate::job::ProcState;

#[derive(Debug, thiserror::Error)]
pub enum StarterError {
    #[error("config error: {0}")]
    Config(String),

    #[error("job ad: {0}")]
    JobAd(String),

    #[error("{op} not allowed in state {state}")]
    State { op: &'static str, state: ProcState },

    #[error("{op}: {errno}")]
    Os { op: &'static str, errno: Errno },

    #[error("remote: {0}")]
    Remote(#[from] RemoteError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StarterError {
    pub(crate) fn os(op: &'static str) -> impl FnOnce(Errno) -> Self {
        move |errno| StarterError::Os { op, errno }
    }
}

pub type StarterResult<T> = Result<T, StarterError>;
