//! Sanity checks on a fetched executable before it is run.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

pub const ELF_MAGIC: &[u8; 4] = b"\x7fELF";

/// Symbol every executable linked with the checkpoint runtime carries.
pub const RUNTIME_MARKER: &[u8] = b"_condor_prestart";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkVerdict {
    Ok,
    BadMagic,
    BadLink,
}

/// Whether the file starts with the ELF magic.
pub fn has_elf_magic(path: &Path) -> io::Result<bool> {
    let mut head = [0u8; 4];
    let mut file = File::open(path)?;
    match file.read_exact(&mut head) {
        Ok(()) => Ok(&head == ELF_MAGIC),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Whether `needle` occurs anywhere in the file. Reads in chunks, carrying
/// enough of each chunk's tail to catch a match across the boundary.
pub fn contains_bytes(path: &Path, needle: &[u8]) -> io::Result<bool> {
    if needle.is_empty() {
        return Ok(true);
    }
    let keep = needle.len() - 1;
    let mut file = File::open(path)?;
    let mut buf: Vec<u8> = Vec::with_capacity(64 * 1024 + keep);
    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut chunk)?;
        if n == 0 {
            return Ok(false);
        }
        buf.extend(chunk.iter().take(n));
        if buf.windows(needle.len()).any(|w| w == needle) {
            return Ok(true);
        }
        let cut = buf.len().saturating_sub(keep);
        buf.drain(..cut);
    }
}

/// Check the image at `path`. `needs_runtime` asks for the checkpoint
/// runtime marker as well as the ELF magic.
pub fn verify(path: &Path, needs_runtime: bool) -> io::Result<LinkVerdict> {
    if !has_elf_magic(path)? {
        return Ok(LinkVerdict::BadMagic);
    }
    if needs_runtime && !contains_bytes(path, RUNTIME_MARKER)? {
        return Ok(LinkVerdict::BadLink);
    }
    Ok(LinkVerdict::Ok)
}
