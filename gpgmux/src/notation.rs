//! Signature notations and policy URLs.
//!
//! A notation is a `(name, value, flags)` triple; a policy URL is the
//! same object with no name.  Values may contain NUL bytes, so both
//! parts are stored as byte vectors with convenience accessors for the
//! textual case.

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::util;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NotationFlags: u32 {
        const HUMAN_READABLE = 1;
        const CRITICAL = 2;
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignatureNotation {
    /// None identifies a policy URL.
    pub name: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub flags: NotationFlags,
    /// The two flag bits, unpacked for convenient access.
    pub human_readable: bool,
    pub critical: bool,
}

impl SignatureNotation {
    /// Build a notation or (with `name` of None) a policy URL.  All
    /// named notations must be flagged human readable.
    pub fn new(
        name: Option<&[u8]>,
        value: &[u8],
        flags: NotationFlags,
    ) -> Result<SignatureNotation> {
        if name.is_some() && !flags.contains(NotationFlags::HUMAN_READABLE) {
            return Err(Error::InvValue);
        }
        let mut notation = SignatureNotation {
            name: name.map(|n| n.to_vec()),
            value: value.to_vec(),
            ..Default::default()
        };
        notation.set_flags(flags);
        Ok(notation)
    }

    pub fn set_flags(&mut self, flags: NotationFlags) {
        self.flags = flags;
        self.human_readable = flags.contains(NotationFlags::HUMAN_READABLE);
        self.critical = flags.contains(NotationFlags::CRITICAL);
    }

    pub fn name_str(&self) -> Option<&str> {
        self.name.as_deref().and_then(|n| std::str::from_utf8(n).ok())
    }

    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }

    pub fn is_policy_url(&self) -> bool {
        self.name.is_none()
    }
}

/// Subpacket type carrying notation data.
const SPK_NOTATION: u32 = 20;
/// Subpacket type carrying a policy URL.
const SPK_POLICY_URL: u32 = 26;

/// This subpacket is marked critical in the signature.
const SPK_FLAG_CRITICAL: u32 = 0x02;

/// First flag octet of a notation body: value is human readable.
const NOTATION_FLAG1_HUMAN_READABLE: u8 = 0x80;

/// Parse a signature subpacket as found in `spk` records and
/// SIG_SUBPACKET lines.  Unknown types yield None without error.  The
/// body is percent encoded; a notation body carries four flag octets
/// followed by two 16-bit big-endian lengths and the name and value
/// bytes.
pub fn parse_subpacket(
    pkt_type: u32,
    pkt_flags: u32,
    len: usize,
    data: &str,
) -> Result<Option<SignatureNotation>> {
    if pkt_type != SPK_NOTATION && pkt_type != SPK_POLICY_URL {
        return Ok(None);
    }
    if len > data.len() {
        return Err(Error::InvEngine);
    }
    if pkt_type == SPK_NOTATION && len < 4 + 2 + 2 {
        return Err(Error::InvEngine);
    }

    let body = util::decode_percent(data, true)?;
    let mut flags = NotationFlags::empty();
    if pkt_flags & SPK_FLAG_CRITICAL != 0 {
        flags |= NotationFlags::CRITICAL;
    }

    let notation = if pkt_type == SPK_NOTATION {
        if body.len() < 8 {
            return Err(Error::InvEngine);
        }
        if body[0] & NOTATION_FLAG1_HUMAN_READABLE != 0 {
            flags |= NotationFlags::HUMAN_READABLE;
        }
        // Octets 1..=3 of the flags are unused.
        let name_len = u16::from_be_bytes([body[4], body[5]]) as usize;
        let value_len = u16::from_be_bytes([body[6], body[7]]) as usize;
        if 8 + name_len + value_len > len {
            return Err(Error::InvEngine);
        }
        let name = &body[8..8 + name_len];
        let value = &body[8 + name_len..8 + name_len + value_len];
        let mut notation = SignatureNotation {
            name: Some(name.to_vec()),
            value: value.to_vec(),
            ..Default::default()
        };
        notation.set_flags(flags);
        notation
    } else {
        // A policy URL has no name and runs to the end of the body.
        let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
        let mut notation =
            SignatureNotation { name: None, value: body[..end].to_vec(), ..Default::default() };
        notation.set_flags(flags);
        notation
    };
    Ok(Some(notation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::encode_percent;

    fn notation_body(flag1: u8, name: &[u8], value: &[u8]) -> String {
        let mut body = vec![flag1, 0, 0, 0];
        body.extend_from_slice(&(name.len() as u16).to_be_bytes());
        body.extend_from_slice(&(value.len() as u16).to_be_bytes());
        body.extend_from_slice(name);
        body.extend_from_slice(value);
        encode_percent(&body)
    }

    #[test]
    fn parses_human_readable_notation() {
        let body = notation_body(0x80, b"pref@example.org", b"yes");
        let notation = parse_subpacket(20, 0, body.len(), &body).unwrap().unwrap();
        assert_eq!(notation.name_str(), Some("pref@example.org"));
        assert_eq!(notation.value_str(), Some("yes"));
        assert!(notation.human_readable);
        assert!(!notation.critical);
    }

    #[test]
    fn critical_flag_comes_from_packet_flags() {
        let body = notation_body(0x00, b"n", b"v");
        let notation = parse_subpacket(20, 0x02, body.len(), &body).unwrap().unwrap();
        assert!(notation.critical);
        assert!(!notation.human_readable);
    }

    #[test]
    fn parses_policy_url() {
        let body = encode_percent(b"https://example.org/policy");
        let notation = parse_subpacket(26, 0, body.len(), &body).unwrap().unwrap();
        assert!(notation.is_policy_url());
        assert_eq!(notation.value_str(), Some("https://example.org/policy"));
        assert!(!notation.human_readable);
    }

    #[test]
    fn unknown_type_is_skipped() {
        assert!(parse_subpacket(99, 0, 0, "").unwrap().is_none());
    }

    #[test]
    fn truncated_notation_is_an_engine_error() {
        assert_eq!(parse_subpacket(20, 0, 4, "abcd"), Err(Error::InvEngine));
        let body = notation_body(0x80, b"name", b"value");
        // Claimed lengths overrun the declared packet length.
        assert_eq!(parse_subpacket(20, 0, 9, &body[..9.min(body.len())]), Err(Error::InvEngine));
    }

    #[test]
    fn named_notations_must_be_human_readable() {
        assert!(SignatureNotation::new(Some(b"n"), b"v", NotationFlags::empty()).is_err());
        assert!(SignatureNotation::new(None, b"url", NotationFlags::empty()).is_ok());
    }
}
