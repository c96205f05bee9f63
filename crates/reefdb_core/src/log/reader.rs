//! Streaming RESP command parser for load and recovery.

use crate::error::{Error, Result};
use std::io::{BufReader, Read};

/// A single replayable command from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    /// Upsert, with an optional TTL in whole seconds.
    Set {
        key: Vec<u8>,
        value: Vec<u8>,
        ttl_secs: Option<u64>,
    },
    /// Delete by key.
    Del { key: Vec<u8> },
}

/// Streams commands out of a RESP log.
///
/// Truncation tolerance: a partial command at end of stream is treated
/// as end-of-log, not corruption, so a database whose last append was
/// cut short still opens. Runs of NUL bytes between records are skipped.
/// Anything else malformed fails with [`Error::InvalidDatabase`].
pub(crate) struct CommandReader<R> {
    inner: BufReader<R>,
}

impl<R: Read> CommandReader<R> {
    pub fn new(source: R) -> Self {
        Self {
            inner: BufReader::new(source),
        }
    }

    /// Returns the next command, or `None` at end of log.
    pub fn next_command(&mut self) -> Result<Option<Command>> {
        loop {
            let Some(line) = self.read_line()? else {
                return Ok(None);
            };

            // Tolerate NUL padding left by torn writes.
            let start = line.iter().position(|&b| b != 0).unwrap_or(line.len());
            let line = &line[start..];
            if line.is_empty() {
                continue;
            }

            let Some(count) = parse_head(line, b'*') else {
                return Err(Error::InvalidDatabase);
            };

            let mut parts: Vec<Vec<u8>> = Vec::with_capacity(count);
            for _ in 0..count {
                match self.read_bulk()? {
                    Some(part) => parts.push(part),
                    // Command cut off mid-way by a crash: ignore the tail.
                    None => return Ok(None),
                }
            }

            if parts.is_empty() {
                continue;
            }
            return self.decode(parts).map(Some);
        }
    }

    fn decode(&self, mut parts: Vec<Vec<u8>>) -> Result<Command> {
        let verb = &parts[0];
        if verb.len() != 3 {
            return Err(Error::InvalidDatabase);
        }
        if verb.eq_ignore_ascii_case(b"set") {
            if parts.len() != 3 && parts.len() != 5 {
                return Err(Error::InvalidDatabase);
            }
            let mut ttl_secs = None;
            if parts.len() == 5 {
                if !parts[3].eq_ignore_ascii_case(b"ex") {
                    return Err(Error::InvalidDatabase);
                }
                ttl_secs = Some(parse_digits(&parts[4]).ok_or(Error::InvalidDatabase)?);
            }
            let value = parts.swap_remove(2);
            let key = parts.swap_remove(1);
            Ok(Command::Set {
                key,
                value,
                ttl_secs,
            })
        } else if verb.eq_ignore_ascii_case(b"del") {
            if parts.len() != 2 {
                return Err(Error::InvalidDatabase);
            }
            Ok(Command::Del {
                key: parts.swap_remove(1),
            })
        } else {
            Err(Error::InvalidDatabase)
        }
    }

    /// Reads one `\n`-terminated line. `None` means clean EOF or a
    /// truncated final line, both treated as end-of-log.
    fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        use std::io::BufRead;
        let mut line = Vec::new();
        let n = self.inner.read_until(b'\n', &mut line)?;
        if n == 0 || !line.ends_with(b"\n") {
            return Ok(None);
        }
        Ok(Some(line))
    }

    /// Reads one `$<len>\r\n<bytes>\r\n` bulk. `None` means the log was
    /// truncated inside this bulk.
    fn read_bulk(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(line) = self.read_line()? else {
            return Ok(None);
        };
        let Some(len) = parse_head(&line, b'$') else {
            return Err(Error::InvalidDatabase);
        };

        let mut payload = vec![0u8; len + 2];
        match self.inner.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        if &payload[len..] != b"\r\n" {
            return Err(Error::InvalidDatabase);
        }
        payload.truncate(len);
        Ok(Some(payload))
    }
}

/// Parses `<sigil><digits>\r\n`, returning the number.
fn parse_head(line: &[u8], sigil: u8) -> Option<usize> {
    let body = line.strip_suffix(b"\r\n")?;
    let digits = body.strip_prefix(std::slice::from_ref(&sigil))?;
    parse_digits(digits).map(|n| n as usize)
}

fn parse_digits(digits: &[u8]) -> Option<u64> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::record::{write_del, write_set};
    use std::time::{Duration, SystemTime};

    fn read_all(data: &[u8]) -> Result<Vec<Command>> {
        let mut reader = CommandReader::new(data);
        let mut out = Vec::new();
        while let Some(cmd) = reader.next_command()? {
            out.push(cmd);
        }
        Ok(out)
    }

    #[test]
    fn parses_set_and_del() {
        let mut buf = Vec::new();
        write_set(&mut buf, b"hello", b"world", None);
        write_del(&mut buf, b"hello");

        let cmds = read_all(&buf).unwrap();
        assert_eq!(
            cmds,
            vec![
                Command::Set {
                    key: b"hello".to_vec(),
                    value: b"world".to_vec(),
                    ttl_secs: None,
                },
                Command::Del {
                    key: b"hello".to_vec(),
                },
            ]
        );
    }

    #[test]
    fn parses_ttl_within_one_second() {
        let mut buf = Vec::new();
        let at = SystemTime::now() + Duration::from_secs(30);
        write_set(&mut buf, b"k", b"v", Some(at));

        let cmds = read_all(&buf).unwrap();
        let Command::Set { ttl_secs, .. } = &cmds[0] else {
            panic!("expected set");
        };
        let secs = ttl_secs.unwrap();
        assert!(secs == 29 || secs == 30, "got {secs}");
    }

    #[test]
    fn verbs_are_case_insensitive() {
        let data = b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n*2\r\n$3\r\nDeL\r\n$1\r\nk\r\n";
        assert_eq!(read_all(data).unwrap().len(), 2);
    }

    #[test]
    fn truncated_tail_is_tolerated() {
        let mut buf = Vec::new();
        write_set(&mut buf, b"complete", b"record", None);
        let full = buf.len();
        write_set(&mut buf, b"partial", b"record", None);

        // Cut the second record at every possible byte boundary.
        for cut in full..buf.len() {
            let cmds = read_all(&buf[..cut]).unwrap_or_else(|e| {
                panic!("cut at {cut} should be tolerated, got {e}");
            });
            assert_eq!(cmds.len(), 1, "cut at {cut}");
        }
    }

    #[test]
    fn nul_padding_is_skipped() {
        let mut buf = Vec::new();
        write_set(&mut buf, b"a", b"1", None);
        buf.extend_from_slice(&[0, 0, 0]);
        write_set(&mut buf, b"b", b"2", None);

        assert_eq!(read_all(&buf).unwrap().len(), 2);
    }

    #[test]
    fn trailing_nuls_at_eof_are_tolerated() {
        let mut buf = Vec::new();
        write_set(&mut buf, b"a", b"1", None);
        buf.extend_from_slice(&[0, 0, 0, 0]);

        assert_eq!(read_all(&buf).unwrap().len(), 1);
    }

    #[test]
    fn rejects_unknown_verbs() {
        let data = b"*2\r\n$4\r\nping\r\n$1\r\nx\r\n";
        assert!(matches!(read_all(data), Err(Error::InvalidDatabase)));
        let data = b"*2\r\n$3\r\nfoo\r\n$1\r\nx\r\n";
        assert!(matches!(read_all(data), Err(Error::InvalidDatabase)));
    }

    #[test]
    fn rejects_wrong_arity() {
        // set with 4 parts
        let data = b"*4\r\n$3\r\nset\r\n$1\r\nk\r\n$1\r\nv\r\n$2\r\nex\r\n";
        assert!(matches!(read_all(data), Err(Error::InvalidDatabase)));
        // del with 3 parts
        let data = b"*3\r\n$3\r\ndel\r\n$1\r\nk\r\n$1\r\nv\r\n";
        assert!(matches!(read_all(data), Err(Error::InvalidDatabase)));
    }

    #[test]
    fn rejects_malformed_framing() {
        // Wrong sigil on the array header.
        assert!(matches!(
            read_all(b"+3\r\n$3\r\nset\r\n$1\r\nk\r\n$1\r\nv\r\n"),
            Err(Error::InvalidDatabase)
        ));
        // Non-digit length.
        assert!(matches!(
            read_all(b"*x\r\n$3\r\nset\r\n$1\r\nk\r\n$1\r\nv\r\n"),
            Err(Error::InvalidDatabase)
        ));
        // Bulk missing its CRLF (followed by more data, so not a tail).
        assert!(matches!(
            read_all(b"*2\r\n$3\r\ndel\r\n$1\r\nkXX*2\r\n$3\r\ndel\r\n$1\r\nk\r\n"),
            Err(Error::InvalidDatabase)
        ));
        // Missing CR in the header terminator.
        assert!(matches!(
            read_all(b"*2\n$3\r\ndel\r\n$1\r\nk\r\n"),
            Err(Error::InvalidDatabase)
        ));
    }

    #[test]
    fn rejects_non_nul_garbage_between_records() {
        let mut buf = Vec::new();
        write_set(&mut buf, b"a", b"1", None);
        buf.extend_from_slice(b"garbage\r\n");
        write_set(&mut buf, b"b", b"2", None);

        assert!(matches!(read_all(&buf), Err(Error::InvalidDatabase)));
    }

    #[test]
    fn rejects_negative_ttl() {
        let data = b"*5\r\n$3\r\nset\r\n$1\r\nk\r\n$1\r\nv\r\n$2\r\nex\r\n$2\r\n-1\r\n";
        assert!(matches!(read_all(data), Err(Error::InvalidDatabase)));
    }

    #[test]
    fn empty_stream_yields_nothing() {
        assert!(read_all(b"").unwrap().is_empty());
    }

    #[test]
    fn binary_keys_and_values_round_trip() {
        let mut buf = Vec::new();
        write_set(&mut buf, &[0xff, 0x00, b'\n'], &[b'\r', b'\n', 0xfe], None);

        let cmds = read_all(&buf).unwrap();
        let Command::Set { key, value, .. } = &cmds[0] else {
            panic!("expected set");
        };
        assert_eq!(key, &[0xff, 0x00, b'\n']);
        assert_eq!(value, &[b'\r', b'\n', 0xfe]);
    }
}
