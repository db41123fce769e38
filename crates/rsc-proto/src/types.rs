use std::io::{Read, Write};

use crate::{ProtocolError, Stream};

/// A value sent as an ordered sequence of primitives.
pub trait Encode {
    fn encode<T: Read + Write>(&self, s: &mut Stream<T>) -> Result<(), ProtocolError>;
}

/// A value read back in the same order its [`Encode`] impl wrote it.
pub trait Decode: Sized {
    fn decode<T: Read + Write>(s: &mut Stream<T>) -> Result<Self, ProtocolError>;
}

/// The subset of `struct stat` the job side needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub size: i64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl FileStat {
    pub fn is_dir(&self) -> bool {
        self.mode & 0o170000 == 0o040000
    }
}

impl Encode for FileStat {
    fn encode<T: Read + Write>(&self, s: &mut Stream<T>) -> Result<(), ProtocolError> {
        s.put_word(self.dev)?;
        s.put_word(self.ino)?;
        s.put_word(u64::from(self.mode))?;
        s.put_word(self.nlink)?;
        s.put_word(u64::from(self.uid))?;
        s.put_word(u64::from(self.gid))?;
        s.put_i64(self.size)?;
        s.put_word(self.blksize)?;
        s.put_word(self.blocks)?;
        s.put_i64(self.atime)?;
        s.put_i64(self.mtime)?;
        s.put_i64(self.ctime)
    }
}

fn word_u32<T: Read + Write>(s: &mut Stream<T>, what: &'static str) -> Result<u32, ProtocolError> {
    u32::try_from(s.get_word()?).map_err(|_| ProtocolError::InvalidPayload(what))
}

impl Decode for FileStat {
    fn decode<T: Read + Write>(s: &mut Stream<T>) -> Result<Self, ProtocolError> {
        Ok(Self {
            dev: s.get_word()?,
            ino: s.get_word()?,
            mode: word_u32(s, "stat mode out of range")?,
            nlink: s.get_word()?,
            uid: word_u32(s, "stat uid out of range")?,
            gid: word_u32(s, "stat gid out of range")?,
            size: s.get_i64()?,
            blksize: s.get_word()?,
            blocks: s.get_word()?,
            atime: s.get_i64()?,
            mtime: s.get_i64()?,
            ctime: s.get_i64()?,
        })
    }
}

/// Execution-environment metadata registered by the starter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineInfo {
    pub uid_domain: String,
    pub fs_domain: String,
    pub starter_addr: String,
    pub full_hostname: String,
    pub key: i32,
}

impl Encode for MachineInfo {
    fn encode<T: Read + Write>(&self, s: &mut Stream<T>) -> Result<(), ProtocolError> {
        s.put_str(&self.uid_domain)?;
        s.put_str(&self.fs_domain)?;
        s.put_str(&self.starter_addr)?;
        s.put_str(&self.full_hostname)?;
        s.put_i32(self.key)
    }
}

impl Decode for MachineInfo {
    fn decode<T: Read + Write>(s: &mut Stream<T>) -> Result<Self, ProtocolError> {
        Ok(Self {
            uid_domain: s.get_str()?,
            fs_domain: s.get_str()?,
            starter_addr: s.get_str()?,
            full_hostname: s.get_str()?,
            key: s.get_i32()?,
        })
    }
}
