//! Length-prefixed framing for records on a TCP stream.
//!
//! Frames are:
//! - 4 bytes: payload length (big-endian u32)
//! - N bytes: one opcode-tagged record
//!
//! A record is self-delimiting once it is in memory, but a single `read` on a
//! socket may return part of a record or several records at once. The prefix
//! lets the reader collect exactly one record before decoding it.
//!
//! # Local vs transport failures
//!
//! Sending can fail before a byte hits the socket: the record does not encode,
//! or it is too large for the length prefix. Those are [`FrameError::Encode`]
//! and [`FrameError::TooLarge`], and they say nothing about the peer. Only
//! [`FrameError::Io`] means the connection itself failed.

use std::io::{self, ErrorKind, Read, Write};

use thiserror::Error;

use crate::codec::{CodecError, Decode, Encode};

/// Largest payload the `u32` prefix can describe.
pub const MAX_FRAME_LEN: usize = u32::MAX as usize;

/// Initial buffer for an incoming frame; larger frames grow as bytes arrive,
/// so a corrupt prefix cannot force a huge allocation up front.
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("failed to encode record: {0}")]
    Encode(#[from] CodecError),
    #[error("frame of {len} bytes exceeds {MAX_FRAME_LEN}")]
    TooLarge { len: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FrameError {
    /// Whether the failure happened before touching the connection.
    pub fn is_local(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}

pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::TooLarge { len: payload.len() })?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame. Returns `Ok(None)` when the peer closed the connection
/// cleanly between frames.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        match reader.read(&mut len_buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = Vec::with_capacity(len.min(READ_CHUNK));
    reader.by_ref().take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(ErrorKind::UnexpectedEof.into());
    }
    Ok(Some(buf))
}

/// Encodes `record` into a payload that is known to fit in one frame.
pub fn encode_record<T: Encode + ?Sized>(record: &T) -> Result<Vec<u8>, FrameError> {
    let bytes = record.encode()?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge { len: bytes.len() });
    }
    Ok(bytes)
}

/// Encodes `record` and writes it as one frame.
pub fn send_record<W: Write, T: Encode + ?Sized>(writer: &mut W, record: &T) -> Result<(), FrameError> {
    let bytes = encode_record(record)?;
    write_frame(writer, &bytes)
}

/// Reads one frame and decodes it as `T`. Returns `Ok(None)` on clean close.
pub fn recv_record<R: Read, T: Decode>(reader: &mut R) -> io::Result<Option<T>> {
    let Some(bytes) = read_frame(reader)? else {
        return Ok(None);
    };
    let (record, _) =
        T::decode(&bytes).map_err(|err| io::Error::new(ErrorKind::InvalidData, err))?;
    Ok(Some(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Account, ClientRequest, Snapshot, SyncRecord, UsernameRequest};
    use std::io::Cursor;

    #[test]
    fn frames_survive_coalesced_reads() {
        let first = ClientRequest::CreateAccount(UsernameRequest {
            username: "alice".into(),
        });
        let second = ClientRequest::DeleteAccount(UsernameRequest {
            username: "bob".into(),
        });

        let mut wire = Vec::new();
        send_record(&mut wire, &first).unwrap();
        send_record(&mut wire, &second).unwrap();

        let mut reader = Cursor::new(wire);
        assert_eq!(recv_record::<_, ClientRequest>(&mut reader).unwrap(), Some(first));
        assert_eq!(recv_record::<_, ClientRequest>(&mut reader).unwrap(), Some(second));
        assert_eq!(recv_record::<_, ClientRequest>(&mut reader).unwrap(), None);
    }

    #[test]
    fn eof_inside_a_frame_is_an_error() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"hello").unwrap();
        wire.truncate(6);
        let err = read_frame(&mut Cursor::new(wire)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);

        let err = read_frame(&mut Cursor::new(vec![0u8, 0])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn huge_length_prefix_with_short_body_fails_cleanly() {
        let mut wire = u32::MAX.to_be_bytes().to_vec();
        wire.extend_from_slice(b"tiny");
        let err = read_frame(&mut Cursor::new(wire)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn snapshots_larger_than_sixteen_mib_roundtrip() {
        let name = "u".repeat(280);
        let accounts: Vec<Account> = (0..62_000)
            .map(|i| Account::new(format!("{i:06}{}", &name[6..]), i % 2 == 0))
            .collect();
        let record = SyncRecord::Snapshot(Snapshot {
            accounts,
            messages: Vec::new(),
        });

        let mut wire = Vec::new();
        send_record(&mut wire, &record).unwrap();
        assert!(wire.len() > 16 * 1024 * 1024);
        let decoded = recv_record::<_, SyncRecord>(&mut Cursor::new(wire)).unwrap();
        assert_eq!(decoded, Some(record));
    }

    #[test]
    fn encode_failures_are_local() {
        let too_long = ClientRequest::CreateAccount(UsernameRequest {
            username: "x".repeat(281),
        });
        let mut wire = Vec::new();
        let err = send_record(&mut wire, &too_long).unwrap_err();
        assert!(err.is_local());
        assert!(matches!(err, FrameError::Encode(CodecError::StringTooLong { .. })));
        assert!(wire.is_empty());

        let io_err = FrameError::from(io::Error::from(ErrorKind::BrokenPipe));
        assert!(!io_err.is_local());
    }
}
