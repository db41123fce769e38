//! Reentrant, allocation-free text formatting.
//!
//! Used wherever the normal `format!`/`tracing` stack cannot be trusted:
//! signal handlers, the child side of `fork()`, and fatal protocol paths.
//! Output is assembled in a fixed stack buffer and emitted with a single
//! `write(2)`.
//!
//! ## Conversions
//!
//! | Spec | Argument        | Output                              |
//! |------|-----------------|-------------------------------------|
//! | `%c` | `Arg::Char`     | one byte                            |
//! | `%s` | `Arg::Str`      | bytes up to the first NUL           |
//! | `%d` | `Arg::Int`      | signed decimal (`%i` is an alias)   |
//! | `%u` | `Arg::Uint`     | unsigned decimal                    |
//! | `%x` | `Arg::Uint`     | lowercase hex, no leading zeros     |
//! | `%o` | `Arg::Uint`     | octal, no leading zeros             |
//! | `%%` | -               | literal `%`                         |
//!
//! `l` and `h` length modifiers are accepted and ignored. Anything else,
//! including a conversion with no argument left, is copied through verbatim.

use std::os::fd::RawFd;

/// Size of the on-stack output buffer.
pub const BUF_SIZE: usize = 384;

/// Large enough for any `u64` in base 8 plus a sign.
const DIGITS_MAX: usize = 24;

/// One formatting argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arg<'a> {
    Char(u8),
    Str(&'a [u8]),
    Int(i64),
    Uint(u64),
}

impl From<u8> for Arg<'_> {
    fn from(c: u8) -> Self {
        Arg::Char(c)
    }
}

impl From<char> for Arg<'_> {
    fn from(c: char) -> Self {
        Arg::Char(if c.is_ascii() { c as u8 } else { b'?' })
    }
}

impl<'a> From<&'a str> for Arg<'a> {
    fn from(s: &'a str) -> Self {
        Arg::Str(s.as_bytes())
    }
}

impl<'a> From<&'a [u8]> for Arg<'a> {
    fn from(s: &'a [u8]) -> Self {
        Arg::Str(s)
    }
}

impl<'a> From<&'a std::ffi::CStr> for Arg<'a> {
    fn from(s: &'a std::ffi::CStr) -> Self {
        Arg::Str(s.to_bytes())
    }
}

macro_rules! lossless_arg {
    ($variant:ident, $wide:ty, $($t:ty),*) => {
        $(impl From<$t> for Arg<'_> {
            fn from(v: $t) -> Self {
                Arg::$variant(<$wide>::from(v))
            }
        })*
    };
}

lossless_arg!(Int, i64, i8, i16, i32);
lossless_arg!(Uint, u64, u16, u32);

impl From<i64> for Arg<'_> {
    fn from(v: i64) -> Self {
        Arg::Int(v)
    }
}

impl From<u64> for Arg<'_> {
    fn from(v: u64) -> Self {
        Arg::Uint(v)
    }
}

impl From<isize> for Arg<'_> {
    fn from(v: isize) -> Self {
        Arg::Int(v as i64)
    }
}

impl From<usize> for Arg<'_> {
    fn from(v: usize) -> Self {
        Arg::Uint(v as u64)
    }
}

/// Write `value` in `radix` (8, 10 or 16) into `buf`, returning the number
/// of bytes written.
///
/// Decimal digits are produced least-significant first into scratch
/// space; hex and octal walk from the most significant digit and skip
/// leading zeros. If `buf` is too small the most significant digits are
/// kept.
pub fn itoa(value: u64, radix: u32, buf: &mut [u8]) -> usize {
    match radix {
        8 => itoa_pow2(value, 3, buf),
        16 => itoa_pow2(value, 4, buf),
        _ => itoa_decimal(value, buf),
    }
}

/// Signed decimal variant of [`itoa`].
pub fn itoa_signed(value: i64, buf: &mut [u8]) -> usize {
    if value >= 0 {
        return itoa_decimal(value as u64, buf);
    }
    let Some((sign, rest)) = buf.split_first_mut() else {
        return 0;
    };
    *sign = b'-';
    1 + itoa_decimal(value.unsigned_abs(), rest)
}

fn itoa_decimal(mut value: u64, buf: &mut [u8]) -> usize {
    // u64::MAX has 20 decimal digits.
    let mut scratch = [0u8; 20];
    let mut start = scratch.len();
    while let Some(slot) = start.checked_sub(1).and_then(|i| scratch.get_mut(i)) {
        *slot = b'0' + (value % 10) as u8;
        start -= 1;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    let digits = scratch.get(start..).unwrap_or_default();
    let n = digits.len().min(buf.len());
    if let (Some(dst), Some(src)) = (buf.get_mut(..n), digits.get(..n)) {
        dst.copy_from_slice(src);
    }
    n
}

fn itoa_pow2(value: u64, bits: u32, buf: &mut [u8]) -> usize {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mask = (1u64 << bits) - 1;
    let mut shift = 64_u32.div_ceil(bits).saturating_sub(1) * bits;
    let mut started = false;
    let mut n = 0;
    loop {
        let digit = ((value >> shift) & mask) as usize;
        if digit != 0 || started || shift == 0 {
            started = true;
            let (Some(slot), Some(&c)) = (buf.get_mut(n), HEX.get(digit)) else {
                break;
            };
            *slot = c;
            n += 1;
        }
        if shift == 0 {
            break;
        }
        shift -= bits;
    }
    n
}

/// Cursor over a fixed output buffer that silently drops overflow.
struct Out<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl Out<'_> {
    fn push(&mut self, b: u8) {
        if let Some(slot) = self.buf.get_mut(self.len) {
            *slot = b;
            self.len += 1;
        }
    }

    fn extend(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if self.len >= self.buf.len() {
                return;
            }
            self.push(b);
        }
    }
}

/// Format `template` with `args` into `out`, returning the byte count.
pub fn format_into(out: &mut [u8], template: &[u8], args: &[Arg<'_>]) -> usize {
    let mut w = Out { buf: out, len: 0 };
    let mut args = args.iter();
    let mut digits = [0u8; DIGITS_MAX];
    let mut i = 0;

    while let Some(&c) = template.get(i) {
        if c != b'%' {
            w.push(c);
            i += 1;
            continue;
        }

        let start = i;
        i += 1;
        while matches!(template.get(i), Some(b'l' | b'h')) {
            i += 1;
        }
        let Some(&conv) = template.get(i) else {
            w.extend(template.get(start..).unwrap_or_default());
            break;
        };
        i += 1;
        let verbatim = template.get(start..i).unwrap_or_default();

        if conv == b'%' {
            w.push(b'%');
            continue;
        }
        if !matches!(conv, b'c' | b's' | b'd' | b'i' | b'u' | b'x' | b'o') {
            w.extend(verbatim);
            continue;
        }
        let Some(arg) = args.next() else {
            w.extend(verbatim);
            continue;
        };

        match (conv, *arg) {
            (b'c', Arg::Char(ch)) => w.push(ch),
            (b's', Arg::Str(s)) => {
                let end = s.iter().position(|&b| b == 0).unwrap_or(s.len());
                w.extend(s.get(..end).unwrap_or_default());
            }
            (b'd' | b'i', Arg::Int(v)) => {
                let n = itoa_signed(v, &mut digits);
                w.extend(digits.get(..n).unwrap_or_default());
            }
            (b'd' | b'i' | b'u', Arg::Uint(v)) => {
                let n = itoa(v, 10, &mut digits);
                w.extend(digits.get(..n).unwrap_or_default());
            }
            (b'u' | b'x' | b'o', Arg::Int(v)) => {
                let radix = radix_of(conv);
                let n = itoa(v as u64, radix, &mut digits);
                w.extend(digits.get(..n).unwrap_or_default());
            }
            (b'x' | b'o', Arg::Uint(v)) => {
                let n = itoa(v, radix_of(conv), &mut digits);
                w.extend(digits.get(..n).unwrap_or_default());
            }
            _ => w.extend(verbatim),
        }
    }
    w.len
}

fn radix_of(conv: u8) -> u32 {
    match conv {
        b'x' => 16,
        b'o' => 8,
        _ => 10,
    }
}

/// Format and write to `fd` with one `write(2)`. Returns what `write`
/// returned.
pub fn safe_dprintf(fd: RawFd, template: &str, args: &[Arg<'_>]) -> isize {
    let mut buf = [0u8; BUF_SIZE];
    let n = format_into(&mut buf, template.as_bytes(), args);
    // SAFETY: buf is a live stack array and n <= BUF_SIZE.
    unsafe { libc::write(fd, buf.as_ptr().cast(), n) }
}

/// Write a diagnostic to `fd` and terminate with `_exit(status)`.
///
/// Skips atexit handlers and stdio flushing, so it is usable after `fork()`.
pub fn die(fd: RawFd, status: i32, template: &str, args: &[Arg<'_>]) -> ! {
    safe_dprintf(fd, template, args);
    // SAFETY: _exit is async-signal-safe and never returns.
    unsafe { libc::_exit(status) }
}

/// Write a diagnostic to `fd` and `abort()`.
pub fn abort_with(fd: RawFd, template: &str, args: &[Arg<'_>]) -> ! {
    safe_dprintf(fd, template, args);
    std::process::abort()
}

/// `safe_dprintf!(fd, "pid %d: %s\n", pid, name)`
#[macro_export]
macro_rules! safe_dprintf {
    ($fd:expr, $fmt:expr $(, $arg:expr)* $(,)?) => {
        $crate::safe_dprintf($fd, $fmt, &[$($crate::Arg::from($arg)),*])
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(template: &str, args: &[Arg<'_>]) -> String {
        let mut buf = [0u8; BUF_SIZE];
        let n = format_into(&mut buf, template.as_bytes(), args);
        String::from_utf8(buf[..n].to_vec()).unwrap()
    }

    fn itoa_str(v: u64, radix: u32) -> String {
        let mut buf = [0u8; DIGITS_MAX];
        let n = itoa(v, radix, &mut buf);
        String::from_utf8(buf[..n].to_vec()).unwrap()
    }

    #[test]
    fn itoa_decimal_digits() {
        assert_eq!(itoa_str(0, 10), "0");
        assert_eq!(itoa_str(7, 10), "7");
        assert_eq!(itoa_str(1234567890, 10), "1234567890");
        assert_eq!(itoa_str(u64::MAX, 10), "18446744073709551615");
    }

    #[test]
    fn itoa_strips_leading_zeros_for_hex_and_octal() {
        assert_eq!(itoa_str(0, 16), "0");
        assert_eq!(itoa_str(0xdead, 16), "dead");
        assert_eq!(itoa_str(u64::MAX, 16), "ffffffffffffffff");
        assert_eq!(itoa_str(0o755, 8), "755");
        assert_eq!(itoa_str(u64::MAX, 8), "1777777777777777777777");
    }

    #[test]
    fn itoa_signed_negative() {
        let mut buf = [0u8; DIGITS_MAX];
        let n = itoa_signed(-42, &mut buf);
        assert_eq!(&buf[..n], b"-42");
        let n = itoa_signed(i64::MIN, &mut buf);
        assert_eq!(&buf[..n], b"-9223372036854775808");
    }

    #[test]
    fn itoa_truncates_to_buffer() {
        let mut buf = [0u8; 3];
        let n = itoa(123456, 10, &mut buf);
        assert_eq!(&buf[..n], b"123");
        let n = itoa(0xabcdef, 16, &mut buf);
        assert_eq!(&buf[..n], b"abc");
        let n = itoa_signed(-98765, &mut buf);
        assert_eq!(&buf[..n], b"-98");
        let n = itoa(7, 10, &mut buf[..0]);
        assert_eq!(n, 0);
    }

    #[test]
    fn all_conversions() {
        let out = fmt(
            "%c|%s|%d|%i|%u|%x|%o|%%",
            &[
                Arg::Char(b'z'),
                Arg::Str(b"abc"),
                Arg::Int(-5),
                Arg::Int(6),
                Arg::Uint(7),
                Arg::Uint(255),
                Arg::Uint(8),
            ],
        );
        assert_eq!(out, "z|abc|-5|6|7|ff|10|%");
    }

    #[test]
    fn length_modifiers_are_ignored() {
        assert_eq!(fmt("%ld %hu %lx", &[Arg::Int(1), Arg::Uint(2), Arg::Uint(16)]), "1 2 10");
    }

    #[test]
    fn unknown_conversion_copied_verbatim() {
        assert_eq!(fmt("a %q b %d", &[Arg::Int(3)]), "a %q b 3");
    }

    #[test]
    fn missing_argument_copied_verbatim() {
        assert_eq!(fmt("x=%d y=%s", &[Arg::Int(1)]), "x=1 y=%s");
    }

    #[test]
    fn trailing_percent() {
        assert_eq!(fmt("100%", &[]), "100%");
    }

    #[test]
    fn string_stops_at_nul() {
        assert_eq!(fmt("[%s]", &[Arg::Str(b"ab\0cd")]), "[ab]");
    }

    #[test]
    fn output_capped_at_buffer_size() {
        let long = "y".repeat(1000);
        let out = fmt("%s", &[Arg::from(long.as_str())]);
        assert_eq!(out.len(), BUF_SIZE);
    }

    #[test]
    fn macro_converts_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        let file = std::fs::File::create(&path).unwrap();
        let fd = std::os::fd::AsRawFd::as_raw_fd(&file);

        let written = safe_dprintf!(fd, "pid %d sig %u name %s\n", -1i32, 15u32, "job");
        assert_eq!(written, 23);
        drop(file);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "pid -1 sig 15 name job\n");
    }
}
