//! Execute side of a remote job: fetches the job's executable, runs it as
//! its owner, and reports back to the authority how it ended.

pub mod ckpt;
pub mod config;
mod driver;
pub mod error;
pub mod exec_name;
pub mod exit;
pub mod job;
pub mod link_check;
pub mod logging;
pub mod priv_state;
pub mod spawn;
pub mod user_proc;

pub use config::StarterConfig;
pub use driver::{Driver, JobOutcome};
pub use error::{StarterError, StarterResult};
pub use job::{JobClass, JobInfo, ProcState};
pub use priv_state::Identity;
pub use user_proc::UserProc;
