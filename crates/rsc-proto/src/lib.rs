//! Remote syscall channel: framing and typed marshalling shared by the job
//! side (client) and the authority (server).
//!
//! ## Wire Format
//!
//! ```text
//! [4-byte length][field][field]...
//! ```
//!
//! - **length**: big-endian u32, size of everything after it
//! - **field**: one tag byte followed by a tag-specific body
//!
//! ## Field Tags
//!
//! | Tag  | Name  | Body                         |
//! |------|-------|------------------------------|
//! | 0x01 | int   | `[8B i64]`                   |
//! | 0x02 | word  | `[8B u64]`                   |
//! | 0x03 | bytes | `[4B len][bytes]`            |
//! | 0x04 | str   | `[4B len][utf-8 bytes]`      |
//!
//! All integers are big-endian. A frame is one message; the sender's
//! `end_of_message` writes it and the receiver's `end_of_message` checks that
//! every field was consumed.
//!
//! ## Call shape
//!
//! ```text
//! job  -> authority : [int call number][args...]
//! authority -> job  : [int rval]([int errno] | [payload...])
//! ```
//!
//! `errno` follows only when `rval < 0`; the payload only when `rval >= 0`.

mod record;
mod stream;
mod syscall;
mod types;

pub use record::{AttrValue, Record, attr};
pub use stream::{Direction, Stream};
pub use syscall::SyscallNumber;
pub use types::{Decode, Encode, FileStat, MachineInfo};

/// Header size (4-byte length prefix).
pub const HEADER_SIZE: usize = 4;

/// Maximum message body size (16 MB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Largest chunk moved by one `get_file`/`put_file` call (1 MB).
pub const FILE_CHUNK_SIZE: usize = 1024 * 1024;

// Field tags.
pub const TAG_INT: u8 = 0x01;
pub const TAG_WORD: u8 = 0x02;
pub const TAG_BYTES: u8 = 0x03;
pub const TAG_STR: u8 = 0x04;

/// Protocol error. Every variant means the stream can no longer be trusted.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("message too large: {0}")]
    MessageTooLarge(usize),
    #[error("peer disconnected")]
    Disconnected,
    #[error("out of turn: {0}")]
    OutOfTurn(&'static str),
    #[error("wrong direction: {0}")]
    WrongMode(&'static str),
    #[error("type mismatch: expected {expected}, found tag {found:#04x}")]
    TypeMismatch { expected: &'static str, found: u8 },
    #[error("truncated message: {0}")]
    Truncated(&'static str),
    #[error("{0} unconsumed bytes at end of message")]
    UnconsumedData(usize),
    #[error("invalid payload: {0}")]
    InvalidPayload(&'static str),
    #[error("unknown syscall number {0}")]
    UnknownSyscall(i32),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Read a `u32` from `data` at `offset`. Returns `None` if out of bounds.
fn read_u32_at(data: &[u8], offset: usize) -> Option<u32> {
    let bytes: [u8; 4] = data.get(offset..offset + 4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

/// Read a `u64` from `data` at `offset`. Returns `None` if out of bounds.
fn read_u64_at(data: &[u8], offset: usize) -> Option<u64> {
    let bytes: [u8; 8] = data.get(offset..offset + 8)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

fn tag_name(tag: u8) -> &'static str {
    match tag {
        TAG_INT => "int",
        TAG_WORD => "word",
        TAG_BYTES => "bytes",
        TAG_STR => "str",
        _ => "unknown",
    }
}
