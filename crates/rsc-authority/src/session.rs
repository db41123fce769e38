use std::io::{Read, Write};

use rsc_proto::{ProtocolError, Stream, SyscallNumber};
use tracing::{debug, error, info};

use crate::dispatch::DispatchTable;
use crate::shadow::{JobExit, ShadowState};
use crate::{Outcome, Reply};

/// Serves one job's calls over one connection.
pub struct Session<T> {
    stream: Stream<T>,
    table: DispatchTable<T>,
    state: ShadowState,
}

impl<T: Read + Write> Session<T> {
    pub fn new(io: T, state: ShadowState) -> Self {
        Self {
            stream: Stream::server(io),
            table: DispatchTable::new(),
            state,
        }
    }

    pub fn state(&self) -> &ShadowState {
        &self.state
    }

    pub fn table_mut(&mut self) -> &mut DispatchTable<T> {
        &mut self.table
    }

    pub fn into_state(self) -> ShadowState {
        self.state
    }

    /// Serve one request. Returns the job's exit once `job_exit` has been
    /// answered.
    pub fn step(&mut self) -> Result<Option<JobExit>, ProtocolError> {
        self.stream.decode()?;
        let raw = self.stream.get_i32()?;
        let (num, handler) = self.table.lookup(raw)?;
        self.state.report.record_call(num);

        let outcome = handler(&mut self.stream, &mut self.state)?;
        if let Err(errno) = &outcome {
            debug!(call = num.name(), %errno, "call failed");
            self.state
                .report
                .record_error(&format!("{}: {}", num.name(), errno.desc()));
        }
        self.reply(outcome)?;

        if num == SyscallNumber::JobExit {
            return Ok(self.state.exit.clone());
        }
        Ok(None)
    }

    fn reply(&mut self, outcome: Outcome) -> Result<(), ProtocolError> {
        let s = &mut self.stream;
        s.encode()?;
        match outcome {
            Err(errno) => {
                s.put_i64(-1)?;
                s.put_i32(errno as i32)?;
            }
            Ok(Reply::Value(v)) => s.put_i64(v)?,
            Ok(Reply::Str(v)) => {
                s.put_i64(0)?;
                s.put_str(&v)?;
            }
            Ok(Reply::Bytes(v)) => {
                s.put_i64(v.len() as i64)?;
                s.put_bytes(&v)?;
            }
            Ok(Reply::Stat(v)) => {
                s.put_i64(0)?;
                s.put(&v)?;
            }
            Ok(Reply::Record(v)) => {
                s.put_i64(0)?;
                s.put(&v)?;
            }
        }
        s.end_of_message()
    }

    /// Serve until the job reports its exit.
    ///
    /// The job's part of the protocol ends there; a disconnect before it is a
    /// [`ProtocolError::Disconnected`].
    pub fn serve(&mut self) -> Result<JobExit, ProtocolError> {
        loop {
            if let Some(exit) = self.step()? {
                info!(
                    status = exit.status,
                    reason = exit.reason,
                    calls = self.state.report.total_calls(),
                    "job finished"
                );
                return Ok(exit);
            }
        }
    }

    /// [`serve`](Self::serve), with any protocol error ending the process:
    /// the stream position is unrecoverable.
    pub fn serve_or_die(&mut self) -> JobExit {
        match self.serve() {
            Ok(exit) => exit,
            Err(e) => {
                error!(error = %e, "protocol failure, exiting");
                let text = e.to_string();
                safe_fmt::safe_dprintf!(2, "rsc-authority: fatal protocol error: %s\n", text.as_str());
                self.state.report.log_summary();
                std::process::exit(1)
            }
        }
    }
}
