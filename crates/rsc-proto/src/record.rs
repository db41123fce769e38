use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};

use crate::types::{Decode, Encode};
use crate::{ProtocolError, Stream};

/// Well-known attribute names in job, user and exit records.
pub mod attr {
    pub const CLUSTER_ID: &str = "ClusterId";
    pub const PROC_ID: &str = "ProcId";
    pub const JOB_UNIVERSE: &str = "JobUniverse";
    pub const CMD: &str = "Cmd";
    pub const ARGS: &str = "Args";
    pub const ENV: &str = "Env";
    pub const IN: &str = "In";
    pub const OUT: &str = "Out";
    pub const ERR: &str = "Err";
    pub const IWD: &str = "Iwd";
    pub const ROOT_DIR: &str = "RootDir";
    pub const KILL_SIG: &str = "KillSig";
    pub const CORE_SIZE: &str = "CoreSize";
    pub const WANT_CHECKPOINT: &str = "WantCheckpoint";
    pub const IS_RESTART: &str = "IsRestart";
    pub const CHECKPOINT_FILE: &str = "CheckpointFile";
    pub const APPEND_FILES: &str = "AppendFiles";
    pub const OWNER: &str = "Owner";
    pub const UID: &str = "Uid";
    pub const GID: &str = "Gid";
    pub const IMAGE_SIZE: &str = "ImageSize";
    pub const REMOTE_USER_CPU: &str = "RemoteUserCpu";
    pub const REMOTE_SYS_CPU: &str = "RemoteSysCpu";
    pub const GUARANTEED_USER_CPU: &str = "GuaranteedUserCpu";
    pub const GUARANTEED_SYS_CPU: &str = "GuaranteedSysCpu";
    pub const CHECKPOINT_TRANSFERRED: &str = "CheckpointTransferred";
    pub const CORE_TRANSFERRED: &str = "CoreTransferred";
    pub const EXIT_STATUS: &str = "ExitStatus";
    pub const STARTER_PID: &str = "StarterPid";
    pub const STARTER_HOST: &str = "StarterHost";
    pub const EXECUTE_DIR: &str = "ExecuteDir";
}

/// One attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl AttrValue {
    /// Parse the right-hand side of `Name = value`.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let text = text.trim();
        if let Some(rest) = text.strip_prefix('"') {
            let body = rest
                .strip_suffix('"')
                .ok_or(ProtocolError::InvalidPayload("unterminated string attribute"))?;
            return Ok(AttrValue::Str(unescape(body)));
        }
        if text.eq_ignore_ascii_case("true") {
            return Ok(AttrValue::Bool(true));
        }
        if text.eq_ignore_ascii_case("false") {
            return Ok(AttrValue::Bool(false));
        }
        if let Ok(v) = text.parse::<i64>() {
            return Ok(AttrValue::Int(v));
        }
        text.parse::<f64>()
            .map(AttrValue::Float)
            .map_err(|_| ProtocolError::InvalidPayload("unparseable attribute value"))
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Int(v) => write!(f, "{v}"),
            AttrValue::Float(v) => write!(f, "{v:?}"),
            AttrValue::Bool(true) => f.write_str("TRUE"),
            AttrValue::Bool(false) => f.write_str("FALSE"),
            AttrValue::Str(s) => {
                f.write_str("\"")?;
                for c in s.chars() {
                    if c == '"' || c == '\\' {
                        f.write_str("\\")?;
                    }
                    write!(f, "{c}")?;
                }
                f.write_str("\"")
            }
        }
    }
}

fn unescape(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<i32> for AttrValue {
    fn from(v: i32) -> Self {
        AttrValue::Int(i64::from(v))
    }
}

impl From<u32> for AttrValue {
    fn from(v: u32) -> Self {
        AttrValue::Int(i64::from(v))
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Str(v)
    }
}

/// A structured record (job description, user info, exit update).
///
/// On the wire: `[int count]` then one `str` per attribute holding
/// `Name = value`, in name order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    attrs: BTreeMap<String, AttrValue>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: &str, value: impl Into<AttrValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: impl Into<AttrValue>) {
        self.attrs.insert(name.to_string(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<AttrValue> {
        self.attrs.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.attrs.get(name)? {
            AttrValue::Int(v) => Some(*v),
            AttrValue::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn get_float(&self, name: &str) -> Option<f64> {
        match self.attrs.get(name)? {
            AttrValue::Float(v) => Some(*v),
            AttrValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.attrs.get(name)? {
            AttrValue::Bool(b) => Some(*b),
            AttrValue::Int(v) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.attrs.get(name)? {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Copy every attribute of `other` over this record.
    pub fn merge(&mut self, other: &Record) {
        for (name, value) in &other.attrs {
            self.attrs.insert(name.clone(), value.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Parse one `Name = value` line.
    pub fn parse_line(line: &str) -> Result<(String, AttrValue), ProtocolError> {
        let (name, value) = line
            .split_once('=')
            .ok_or(ProtocolError::InvalidPayload("attribute line without '='"))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ProtocolError::InvalidPayload("attribute line without a name"));
        }
        Ok((name.to_string(), AttrValue::parse(value)?))
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.attrs {
            writeln!(f, "{name} = {value}")?;
        }
        Ok(())
    }
}

impl Encode for Record {
    fn encode<T: Read + Write>(&self, s: &mut Stream<T>) -> Result<(), ProtocolError> {
        s.put_i64(self.attrs.len() as i64)?;
        for (name, value) in &self.attrs {
            s.put_str(&format!("{name} = {value}"))?;
        }
        Ok(())
    }
}

impl Decode for Record {
    fn decode<T: Read + Write>(s: &mut Stream<T>) -> Result<Self, ProtocolError> {
        let count = s.get_i64()?;
        if count < 0 {
            return Err(ProtocolError::InvalidPayload("negative attribute count"));
        }
        let mut record = Record::new();
        for _ in 0..count {
            let (name, value) = Record::parse_line(&s.get_str()?)?;
            record.attrs.insert(name, value);
        }
        Ok(record)
    }
}
