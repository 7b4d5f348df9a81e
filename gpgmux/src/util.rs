//! Small parsing helpers shared by every status handler: the percent
//! codec used on status lines, C-style string unescaping used in colon
//! listings, field splitting and the two timestamp formats.

use chrono::NaiveDateTime;

use crate::error::{Error, Result};

/// Value of a single hex digit, or None.
fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Convert two hexadecimal digits to the byte they represent.
pub fn hex_to_byte(s: &[u8]) -> Option<u8> {
    if s.len() < 2 {
        return None;
    }
    Some(hex_digit(s[0])? << 4 | hex_digit(s[1])?)
}

/// Decode a percent escaped string.  A `%XX` sequence with two valid
/// hex digits becomes the raw byte; anything else is copied verbatim.
/// Embedded NUL bytes are only allowed when BINARY is set.
pub fn decode_percent(src: &str, binary: bool) -> Result<Vec<u8>> {
    let bytes = src.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let Some(val) = hex_to_byte(&bytes[i + 1..]) {
                if val == 0 && !binary {
                    return Err(Error::BadData);
                }
                out.push(val);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    Ok(out)
}

/// Like [`decode_percent`] but for textual output.
pub fn decode_percent_string(src: &str) -> Result<String> {
    let raw = decode_percent(src, false)?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// Percent escape control characters and the escape character itself.
pub fn encode_percent(src: &[u8]) -> String {
    let mut out = String::with_capacity(src.len());
    for &b in src {
        if b < 0x20 || b == 0x7f || b == b'%' {
            out.push('%');
            out.push(char::from_digit((b >> 4) as u32, 16).unwrap().to_ascii_uppercase());
            out.push(char::from_digit((b & 0x0f) as u32, 16).unwrap().to_ascii_uppercase());
        } else {
            out.push(b as char);
        }
    }
    out
}

/// Undo the C style escaping the engines apply in colon listings
/// (`\x3a` for the field separator and the usual single letter
/// escapes).  Unknown escapes are kept as-is.
pub fn decode_c_string(src: &str) -> String {
    let bytes = src.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' || i + 1 >= bytes.len() {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        match bytes[i + 1] {
            b'\\' => out.push(b'\\'),
            b'\'' => out.push(b'\''),
            b'"' => out.push(b'"'),
            b'?' => out.push(b'?'),
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0c),
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'v' => out.push(0x0b),
            b'x' => {
                if let Some(val) = hex_to_byte(&bytes[i + 2..]) {
                    out.push(val);
                    i += 4;
                    continue;
                }
                out.push(b'\\');
                out.push(b'x');
            }
            other => {
                out.push(b'\\');
                out.push(other);
            }
        }
        i += 2;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Split a status line argument into whitespace delimited fields.
pub fn split_fields(s: &str) -> Vec<&str> {
    s.split_whitespace().collect()
}

/// Strict decimal parse of a single field; trailing garbage is an
/// engine protocol violation.
pub fn parse_u64_field(s: &str) -> Result<u64> {
    s.parse::<u64>().map_err(|_| Error::InvEngine)
}

/// Parse a timestamp field.  The scalar format is either seconds since
/// the Epoch or ISO basic format (`YYYYMMDDThhmmss`, UTC).  An empty
/// field or `0` means "unknown" and yields 0.
pub fn parse_timestamp(s: &str) -> Result<i64> {
    let s = s.trim();
    if s.is_empty() || s == "0" {
        return Ok(0);
    }
    if s.len() >= 15 && s.as_bytes()[8] == b'T' {
        let dt = NaiveDateTime::parse_from_str(&s[..15], "%Y%m%dT%H%M%S")
            .map_err(|_| Error::InvEngine)?;
        return Ok(dt.and_utc().timestamp());
    }
    s.parse::<i64>().map_err(|_| Error::InvEngine)
}

/// Timestamp variant for the colon listings where a parse failure is
/// recorded as -1 instead of aborting the listing.
pub fn parse_timestamp_lenient(s: &str) -> i64 {
    parse_timestamp(s).unwrap_or(-1)
}

/// Timestamp variant returning 0 on error or missing value.
pub fn parse_timestamp_ul(s: &str) -> u64 {
    match parse_timestamp(s) {
        Ok(t) if t > 0 => t as u64,
        _ => 0,
    }
}

/// Scan a compliance field (decimal integers separated by whitespace)
/// and report whether the de-vs mode (23) is among them.
pub fn compliance_de_vs(s: &str) -> bool {
    split_fields(s)
        .iter()
        .filter_map(|f| f.parse::<u64>().ok())
        .any(|v| v == 23)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_roundtrip() {
        let cases: &[&[u8]] = &[b"", b"plain", b"with space", b"pct%pct", b"nl\ntab\t", b"\x01\x7f"];
        for &case in cases {
            let encoded = encode_percent(case);
            assert_eq!(decode_percent(&encoded, true).unwrap(), case, "case {:?}", case);
            assert_eq!(encode_percent(&decode_percent(&encoded, true).unwrap()), encoded);
        }
    }

    #[test]
    fn percent_decode_keeps_invalid_escapes() {
        assert_eq!(decode_percent("a%zz", false).unwrap(), b"a%zz");
        assert_eq!(decode_percent("a%25b", false).unwrap(), b"a%b");
        assert_eq!(decode_percent("%00", false), Err(Error::BadData));
        assert_eq!(decode_percent("%00", true).unwrap(), b"\0");
    }

    #[test]
    fn c_string_unescape() {
        assert_eq!(decode_c_string(r"a\x3ab"), "a:b");
        assert_eq!(decode_c_string(r"tab\tnl\n"), "tab\tnl\n");
        assert_eq!(decode_c_string(r"dangling\"), "dangling\\");
        assert_eq!(decode_c_string(r"odd\q"), "odd\\q");
    }

    #[test]
    fn timestamps() {
        assert_eq!(parse_timestamp("0"), Ok(0));
        assert_eq!(parse_timestamp(""), Ok(0));
        assert_eq!(parse_timestamp("20240101T000000"), Ok(1704067200));
        assert_eq!(parse_timestamp("1704067200"), Ok(1704067200));
        assert_eq!(parse_timestamp("notatime"), Err(Error::InvEngine));
        assert_eq!(parse_timestamp_lenient("notatime"), -1);
        assert_eq!(parse_timestamp_ul("20240101T000000"), 1704067200);
    }

    #[test]
    fn compliance() {
        assert!(compliance_de_vs("23"));
        assert!(compliance_de_vs("8 23"));
        assert!(!compliance_de_vs("8 42"));
        assert!(!compliance_de_vs(""));
    }

    #[test]
    fn u64_field_rejects_trailing_garbage() {
        assert_eq!(parse_u64_field("42"), Ok(42));
        assert!(parse_u64_field("42x").is_err());
        assert!(parse_u64_field("").is_err());
    }
}
