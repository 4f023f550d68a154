//! Log file parser using nom
//!
//! File format:
//! ```text
//! STASH01
//! [version: u32]
//! [record_count: u32]
//! ...records (\n-terminated)...
//! ```
//!
//! Record format:
//! ```text
//! S\t<key>\t<value>\n
//! R\t<key>\n
//! ```
//!
//! Keys and values escape `\`, tab, CR and newline, so a raw tab or newline
//! always delimits a field.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_till},
    character::complete::char,
    combinator::map,
    sequence::{delimited, separated_pair},
    IResult,
};

use crate::error::{Error, Result};

/// Magic header for stash log files
pub const STASH_MAGIC: &[u8] = b"STASH01\n";

/// Total header length: magic + version + record count
pub const HEADER_LEN: usize = STASH_MAGIC.len() + 8;

/// Current log format version
pub const FORMAT_VERSION: u32 = 1;

/// Log file header
#[derive(Debug, Clone, PartialEq)]
pub struct LogHeader {
    /// File format version
    pub version: u32,
    /// Number of records written as of the last clean close
    pub record_count: u32,
}

/// Parse the log file header
///
/// Format:
/// ```text
/// STASH01\n
/// [4 bytes: version u32 little-endian]
/// [4 bytes: record_count u32 little-endian]
/// ```
pub fn parse_header(input: &[u8]) -> Result<LogHeader> {
    if input.len() < HEADER_LEN {
        return Err(Error::Parse("Input too short for header".to_string()));
    }

    if &input[0..STASH_MAGIC.len()] != STASH_MAGIC {
        return Err(Error::Parse("Invalid stash magic header".to_string()));
    }

    let mut version = [0u8; 4];
    let mut record_count = [0u8; 4];
    version.copy_from_slice(&input[STASH_MAGIC.len()..STASH_MAGIC.len() + 4]);
    record_count.copy_from_slice(&input[STASH_MAGIC.len() + 4..HEADER_LEN]);

    let header = LogHeader {
        version: u32::from_le_bytes(version),
        record_count: u32::from_le_bytes(record_count),
    };

    if header.version != FORMAT_VERSION {
        return Err(Error::Parse(format!(
            "Unsupported log version {}",
            header.version
        )));
    }

    Ok(header)
}

/// Create a log file header
pub fn create_header(version: u32, record_count: u32) -> Vec<u8> {
    let mut header = Vec::with_capacity(HEADER_LEN);
    header.extend_from_slice(STASH_MAGIC);
    header.extend_from_slice(&version.to_le_bytes());
    header.extend_from_slice(&record_count.to_le_bytes());
    header
}

/// A record as it appears on disk, fields still escaped
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord<'a> {
    /// `S` record
    Set {
        /// Escaped key
        key: &'a [u8],
        /// Escaped value
        value: &'a [u8],
    },
    /// `R` record
    Remove {
        /// Escaped key
        key: &'a [u8],
    },
}

/// A decoded log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// Store `value` under `key`
    Set {
        /// Key
        key: String,
        /// Value
        value: String,
    },
    /// Drop `key`
    Remove {
        /// Key
        key: String,
    },
}

impl Record {
    /// Encode the record as a single `\n`-terminated line
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Record::Set { key, value } => {
                out.extend_from_slice(b"S\t");
                escape_into(key, &mut out);
                out.push(b'\t');
                escape_into(value, &mut out);
            }
            Record::Remove { key } => {
                out.extend_from_slice(b"R\t");
                escape_into(key, &mut out);
            }
        }
        out.push(b'\n');
        out
    }

    /// Unescape and validate a raw record
    pub fn decode(raw: RawRecord<'_>) -> Result<Self> {
        match raw {
            RawRecord::Set { key, value } => Ok(Record::Set {
                key: unescape(key)?,
                value: unescape(value)?,
            }),
            RawRecord::Remove { key } => Ok(Record::Remove { key: unescape(key)? }),
        }
    }
}

fn field(input: &[u8]) -> IResult<&[u8], &[u8]> {
    take_till(|b| b == b'\t' || b == b'\n')(input)
}

fn set_record(input: &[u8]) -> IResult<&[u8], RawRecord<'_>> {
    map(
        delimited(
            tag("S\t"),
            separated_pair(field, char('\t'), field),
            char('\n'),
        ),
        |(key, value)| RawRecord::Set { key, value },
    )(input)
}

fn remove_record(input: &[u8]) -> IResult<&[u8], RawRecord<'_>> {
    map(delimited(tag("R\t"), field, char('\n')), |key| {
        RawRecord::Remove { key }
    })(input)
}

/// Parse a single record, returning the remaining input
pub fn parse_record(input: &[u8]) -> IResult<&[u8], RawRecord<'_>> {
    alt((set_record, remove_record))(input)
}

fn escape_into(s: &str, out: &mut Vec<u8>) {
    for &b in s.as_bytes() {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\t' => out.extend_from_slice(b"\\t"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            _ => out.push(b),
        }
    }
}

fn unescape(field: &[u8]) -> Result<String> {
    let mut out = Vec::with_capacity(field.len());
    let mut bytes = field.iter();
    while let Some(&b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match bytes.next() {
            Some(b'\\') => out.push(b'\\'),
            Some(b't') => out.push(b'\t'),
            Some(b'n') => out.push(b'\n'),
            Some(b'r') => out.push(b'\r'),
            Some(other) => {
                return Err(Error::Parse(format!(
                    "Invalid escape sequence \\{}",
                    *other as char
                )))
            }
            None => return Err(Error::Parse("Dangling escape at end of field".to_string())),
        }
    }
    String::from_utf8(out).map_err(|e| Error::Parse(format!("Invalid UTF-8 in record: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header() {
        let header = create_header(FORMAT_VERSION, 42);
        let parsed = parse_header(&header).unwrap();

        assert_eq!(parsed.version, FORMAT_VERSION);
        assert_eq!(parsed.record_count, 42);
    }

    #[test]
    fn test_parse_header_invalid_magic() {
        let mut header = create_header(FORMAT_VERSION, 0);
        header[0] = b'X';

        assert!(parse_header(&header).is_err());
    }

    #[test]
    fn test_parse_header_too_short() {
        assert!(parse_header(STASH_MAGIC).is_err());
    }

    #[test]
    fn test_parse_header_unknown_version() {
        let header = create_header(7, 0);
        assert!(matches!(parse_header(&header), Err(Error::Parse(_))));
    }

    #[test]
    fn test_parse_set_record() {
        let input = b"S\tcache_user\t{\"a\":1}\nR\tother\n";
        let (rest, raw) = parse_record(input).unwrap();

        assert_eq!(
            raw,
            RawRecord::Set {
                key: b"cache_user",
                value: b"{\"a\":1}"
            }
        );
        assert_eq!(rest, b"R\tother\n");

        let (rest, raw) = parse_record(rest).unwrap();
        assert_eq!(raw, RawRecord::Remove { key: b"other" });
        assert!(rest.is_empty());
    }

    #[test]
    fn test_parse_empty_value() {
        let (_, raw) = parse_record(b"S\tk\t\n").unwrap();
        assert_eq!(raw, RawRecord::Set { key: b"k", value: b"" });
    }

    #[test]
    fn test_parse_truncated_record() {
        assert!(parse_record(b"S\tkey\tpartial").is_err());
        assert!(parse_record(b"X\tkey\n").is_err());
    }

    #[test]
    fn test_escaping_survives_control_characters() {
        let record = Record::Set {
            key: "tab\tkey".to_string(),
            value: "line one\nline two\\end\r".to_string(),
        };
        let line = record.encode();

        // Exactly one raw newline: the terminator
        assert_eq!(line.iter().filter(|&&b| b == b'\n').count(), 1);

        let (rest, raw) = parse_record(&line).unwrap();
        assert!(rest.is_empty());
        assert_eq!(Record::decode(raw).unwrap(), record);
    }

    #[test]
    fn test_decode_rejects_bad_escape() {
        let raw = RawRecord::Remove { key: b"bad\\q" };
        assert!(Record::decode(raw).is_err());

        let raw = RawRecord::Remove { key: b"dangling\\" };
        assert!(Record::decode(raw).is_err());
    }
}
