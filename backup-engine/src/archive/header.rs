//! POSIX ustar header encoding.

use chrono::Utc;
use nix::unistd::{getgid, getuid, Group, User};

use crate::utils::{EngineError, Result};

pub const BLOCK_SIZE: u64 = 512;

const NAME_LEN: usize = 100;
const PREFIX_LEN: usize = 155;
/// Largest size an 11-digit octal field can hold (8 GiB - 1).
const MAX_OCTAL_SIZE: u64 = 0o77_777_777_777;

/// Ownership and permission bits stamped on an archive member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberAttributes {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub uname: String,
    pub gname: String,
    /// Seconds since the Unix epoch
    pub mtime: i64,
}

impl MemberAttributes {
    /// Attributes matching the identity of the running process.
    pub fn current_process() -> Self {
        let uid = getuid();
        let gid = getgid();

        let uname = User::from_uid(uid)
            .ok()
            .flatten()
            .map(|user| user.name)
            .unwrap_or_else(|| uid.to_string());
        let gname = Group::from_gid(gid)
            .ok()
            .flatten()
            .map(|group| group.name)
            .unwrap_or_else(|| gid.to_string());

        Self {
            mode: 0o644,
            uid: uid.as_raw(),
            gid: gid.as_raw(),
            uname,
            gname,
            mtime: Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Regular,
    /// pax global extended header; used as filler
    GlobalExtended,
}

impl EntryType {
    fn flag(self) -> u8 {
        match self {
            EntryType::Regular => b'0',
            EntryType::GlobalExtended => b'g',
        }
    }
}

/// Bytes needed to pad `size` to a whole block.
pub fn padding_for(size: u64) -> u64 {
    (BLOCK_SIZE - size % BLOCK_SIZE) % BLOCK_SIZE
}

pub fn padded_size(size: u64) -> u64 {
    size + padding_for(size)
}

/// Encode a 512-byte header block.
pub fn encode_header(
    name: &str,
    size: u64,
    attrs: &MemberAttributes,
    entry_type: EntryType,
) -> Result<[u8; BLOCK_SIZE as usize]> {
    let mut block = [0u8; BLOCK_SIZE as usize];
    let (prefix, name) = split_name(name)?;

    block[0..name.len()].copy_from_slice(name.as_bytes());
    write_octal(&mut block[100..108], u64::from(attrs.mode & 0o7777));
    write_numeric(&mut block[108..116], u64::from(attrs.uid));
    write_numeric(&mut block[116..124], u64::from(attrs.gid));
    write_numeric(&mut block[124..136], size);
    write_octal(&mut block[136..148], attrs.mtime.max(0) as u64);
    block[156] = entry_type.flag();
    block[257..263].copy_from_slice(b"ustar\0");
    block[263..265].copy_from_slice(b"00");
    write_str(&mut block[265..297], &attrs.uname);
    write_str(&mut block[297..329], &attrs.gname);
    block[345..345 + prefix.len()].copy_from_slice(prefix.as_bytes());

    // Checksum is computed with its own field set to spaces.
    block[148..156].fill(b' ');
    let checksum: u32 = block.iter().map(|&b| u32::from(b)).sum();
    let digits = format!("{:06o}", checksum);
    block[148..154].copy_from_slice(digits.as_bytes());
    block[154] = 0;
    block[155] = b' ';

    Ok(block)
}

/// Split a path into ustar `(prefix, name)`.
fn split_name(path: &str) -> Result<(&str, &str)> {
    if path.is_empty() {
        return Err(EngineError::Archive("member name must not be empty".into()));
    }
    if path.len() <= NAME_LEN {
        return Ok(("", path));
    }

    for (index, _) in path.match_indices('/') {
        let (prefix, rest) = (&path[..index], &path[index + 1..]);
        if prefix.len() <= PREFIX_LEN && !rest.is_empty() && rest.len() <= NAME_LEN {
            return Ok((prefix, rest));
        }
    }

    Err(EngineError::Archive(format!(
        "member name too long for ustar header: {}",
        path
    )))
}

fn write_octal(field: &mut [u8], value: u64) {
    let width = field.len() - 1;
    let digits = format!("{:0width$o}", value, width = width);
    let digits = &digits.as_bytes()[digits.len().saturating_sub(width)..];
    field[..width].copy_from_slice(digits);
    field[width] = 0;
}

/// Octal when it fits, GNU base-256 otherwise.
fn write_numeric(field: &mut [u8], value: u64) {
    let max_octal = if field.len() == 12 {
        MAX_OCTAL_SIZE
    } else {
        (1u64 << (3 * (field.len() as u32 - 1))) - 1
    };

    if value <= max_octal {
        write_octal(field, value);
        return;
    }

    field.fill(0);
    let bytes = value.to_be_bytes();
    let start = field.len() - bytes.len();
    field[start..].copy_from_slice(&bytes);
    field[0] |= 0x80;
}

fn write_str(field: &mut [u8], value: &str) {
    let len = value.len().min(field.len() - 1);
    field[..len].copy_from_slice(&value.as_bytes()[..len]);
}

#[cfg(test)]
pub(crate) fn parse_octal(field: &[u8]) -> u64 {
    if field[0] & 0x80 != 0 {
        let mut value = u64::from(field[0] & 0x7f);
        for &b in &field[1..] {
            value = (value << 8) | u64::from(b);
        }
        return value;
    }
    let text: String = field
        .iter()
        .take_while(|&&b| b != 0 && b != b' ')
        .map(|&b| b as char)
        .collect();
    u64::from_str_radix(text.trim(), 8).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs() -> MemberAttributes {
        MemberAttributes {
            mode: 0o644,
            uid: 1000,
            gid: 1000,
            uname: "discourse".to_string(),
            gname: "www-data".to_string(),
            mtime: 1_616_617_651,
        }
    }

    #[test]
    fn test_padding() {
        assert_eq!(padding_for(0), 0);
        assert_eq!(padding_for(1), 511);
        assert_eq!(padding_for(512), 0);
        assert_eq!(padded_size(513), 1024);
    }

    #[test]
    fn test_header_fields() {
        let header = encode_header("dump.sql.zst", 1234, &attrs(), EntryType::Regular).unwrap();

        assert_eq!(&header[0..12], b"dump.sql.zst");
        assert_eq!(header[12], 0);
        assert_eq!(parse_octal(&header[124..136]), 1234);
        assert_eq!(parse_octal(&header[108..116]), 1000);
        assert_eq!(header[156], b'0');
        assert_eq!(&header[257..263], b"ustar\0");
        assert_eq!(&header[265..274], b"discourse");
        assert_eq!(&header[297..305], b"www-data");
    }

    #[test]
    fn test_checksum_matches_header_sum() {
        let header = encode_header("meta.json", 417, &attrs(), EntryType::Regular).unwrap();

        let mut copy = header;
        copy[148..156].fill(b' ');
        let expected: u64 = copy.iter().map(|&b| u64::from(b)).sum();
        assert_eq!(parse_octal(&header[148..156]), expected);
    }

    #[test]
    fn test_large_size_uses_base256() {
        let size = 20 * 1024 * 1024 * 1024u64;
        let header = encode_header("uploads.tar.zst", size, &attrs(), EntryType::Regular).unwrap();
        assert_eq!(header[124] & 0x80, 0x80);
        assert_eq!(parse_octal(&header[124..136]), size);
    }

    #[test]
    fn test_long_names_use_prefix() {
        let dir = "original/1X/".repeat(10);
        let name = format!("{}image.png", dir);
        let header = encode_header(&name, 1, &attrs(), EntryType::Regular).unwrap();

        let stored_name: String = header[0..100]
            .iter()
            .take_while(|&&b| b != 0)
            .map(|&b| b as char)
            .collect();
        let prefix: String = header[345..500]
            .iter()
            .take_while(|&&b| b != 0)
            .map(|&b| b as char)
            .collect();
        assert_eq!(format!("{}/{}", prefix, stored_name), name);
    }

    #[test]
    fn test_rejects_unsplittable_names() {
        let name = "x".repeat(120);
        assert!(encode_header(&name, 1, &attrs(), EntryType::Regular).is_err());
        assert!(encode_header("", 1, &attrs(), EntryType::Regular).is_err());
    }

    #[test]
    fn test_current_process_identity() {
        let attrs = MemberAttributes::current_process();
        assert_eq!(attrs.uid, getuid().as_raw());
        assert!(!attrs.uname.is_empty());
        assert!(!attrs.gname.is_empty());
    }
}
