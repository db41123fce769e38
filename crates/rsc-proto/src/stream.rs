use std::io::{ErrorKind, Read, Write};

use crate::types::{Decode, Encode};
use crate::{
    HEADER_SIZE, MAX_MESSAGE_SIZE, ProtocolError, TAG_BYTES, TAG_INT, TAG_STR, TAG_WORD,
    read_u32_at, read_u64_at, tag_name,
};

/// Which way the current message flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// This side is producing a message.
    Encode,
    /// This side is consuming a message.
    Decode,
}

/// Whose message comes next on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Turn {
    Send,
    Receive,
}

/// A message-framed duplex connection with strict request/response
/// alternation.
///
/// A side may only encode when it is its turn to send, and only decode when
/// the peer owes it a message. `end_of_message` hands the turn over, so a
/// second request can never be started before the reply to the first has
/// been fully read.
pub struct Stream<T> {
    io: T,
    turn: Turn,
    direction: Option<Direction>,
    out: Vec<u8>,
    inp: Vec<u8>,
    pos: usize,
}

impl<T: Read + Write> Stream<T> {
    /// The job side: speaks first.
    pub fn client(io: T) -> Self {
        Self::new(io, Turn::Send)
    }

    /// The authority side: waits for a request.
    pub fn server(io: T) -> Self {
        Self::new(io, Turn::Receive)
    }

    fn new(io: T, turn: Turn) -> Self {
        Self {
            io,
            turn,
            direction: None,
            out: Vec::with_capacity(4096),
            inp: Vec::with_capacity(4096),
            pos: 0,
        }
    }

    /// Direction of the message in progress, if any.
    pub fn direction(&self) -> Option<Direction> {
        self.direction
    }

    pub fn get_ref(&self) -> &T {
        &self.io
    }

    pub fn into_inner(self) -> T {
        self.io
    }

    /// Switch to producing a message.
    pub fn encode(&mut self) -> Result<(), ProtocolError> {
        if self.turn != Turn::Send {
            return Err(ProtocolError::OutOfTurn(
                "encode before the peer's message was consumed",
            ));
        }
        self.direction = Some(Direction::Encode);
        Ok(())
    }

    /// Switch to consuming a message, blocking until a whole frame arrives.
    pub fn decode(&mut self) -> Result<(), ProtocolError> {
        if self.turn != Turn::Receive {
            return Err(ProtocolError::OutOfTurn(
                "decode before our own message was ended",
            ));
        }
        if self.direction != Some(Direction::Decode) {
            self.read_frame()?;
            self.direction = Some(Direction::Decode);
        }
        Ok(())
    }

    /// Close the current message.
    ///
    /// Encoding: writes the frame and hands the turn to the peer.
    /// Decoding: requires every field to have been read, then takes the turn.
    pub fn end_of_message(&mut self) -> Result<(), ProtocolError> {
        match self.direction {
            Some(Direction::Encode) => {
                self.write_frame()?;
                self.turn = Turn::Receive;
            }
            Some(Direction::Decode) => {
                let left = self.inp.len().saturating_sub(self.pos);
                if left > 0 {
                    return Err(ProtocolError::UnconsumedData(left));
                }
                self.inp.clear();
                self.pos = 0;
                self.turn = Turn::Send;
            }
            None => {
                return Err(ProtocolError::WrongMode("end_of_message outside a message"));
            }
        }
        self.direction = None;
        Ok(())
    }

    fn write_frame(&mut self) -> Result<(), ProtocolError> {
        if self.out.len() > MAX_MESSAGE_SIZE {
            let len = self.out.len();
            self.out.clear();
            return Err(ProtocolError::MessageTooLarge(len));
        }
        let mut frame = Vec::with_capacity(HEADER_SIZE + self.out.len());
        frame.extend_from_slice(&(self.out.len() as u32).to_be_bytes());
        frame.extend_from_slice(&self.out);
        self.out.clear();
        self.io.write_all(&frame).map_err(disconnect_or_io)?;
        self.io.flush().map_err(disconnect_or_io)?;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<(), ProtocolError> {
        let mut header = [0u8; HEADER_SIZE];
        self.io.read_exact(&mut header).map_err(disconnect_or_io)?;
        let length = read_u32_at(&header, 0).unwrap_or_default() as usize;
        if length > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(length));
        }
        self.inp.clear();
        self.inp.resize(length, 0);
        self.io.read_exact(&mut self.inp).map_err(disconnect_or_io)?;
        self.pos = 0;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Encode
    // -----------------------------------------------------------------------

    fn ensure_encoding(&self) -> Result<(), ProtocolError> {
        if self.direction != Some(Direction::Encode) {
            return Err(ProtocolError::WrongMode("put while not encoding"));
        }
        Ok(())
    }

    pub fn put_i64(&mut self, v: i64) -> Result<(), ProtocolError> {
        self.ensure_encoding()?;
        self.out.push(TAG_INT);
        self.out.extend_from_slice(&v.to_be_bytes());
        Ok(())
    }

    pub fn put_i32(&mut self, v: i32) -> Result<(), ProtocolError> {
        self.put_i64(i64::from(v))
    }

    pub fn put_word(&mut self, v: u64) -> Result<(), ProtocolError> {
        self.ensure_encoding()?;
        self.out.push(TAG_WORD);
        self.out.extend_from_slice(&v.to_be_bytes());
        Ok(())
    }

    fn put_counted(&mut self, tag: u8, data: &[u8]) -> Result<(), ProtocolError> {
        self.ensure_encoding()?;
        if self.out.len() + data.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(self.out.len() + data.len()));
        }
        self.out.push(tag);
        self.out.extend_from_slice(&(data.len() as u32).to_be_bytes());
        self.out.extend_from_slice(data);
        Ok(())
    }

    pub fn put_bytes(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        self.put_counted(TAG_BYTES, data)
    }

    pub fn put_str(&mut self, s: &str) -> Result<(), ProtocolError> {
        self.put_counted(TAG_STR, s.as_bytes())
    }

    /// Encode a compound value as its ordered primitives.
    pub fn put<V: Encode + ?Sized>(&mut self, value: &V) -> Result<(), ProtocolError> {
        value.encode(self)
    }

    // -----------------------------------------------------------------------
    // Decode
    // -----------------------------------------------------------------------

    fn take_tag(&mut self, tag: u8) -> Result<(), ProtocolError> {
        if self.direction != Some(Direction::Decode) {
            return Err(ProtocolError::WrongMode("get while not decoding"));
        }
        let found = *self
            .inp
            .get(self.pos)
            .ok_or(ProtocolError::Truncated("missing field"))?;
        if found != tag {
            return Err(ProtocolError::TypeMismatch {
                expected: tag_name(tag),
                found,
            });
        }
        self.pos += 1;
        Ok(())
    }

    fn take_u64(&mut self, tag: u8) -> Result<u64, ProtocolError> {
        self.take_tag(tag)?;
        let v = read_u64_at(&self.inp, self.pos).ok_or(ProtocolError::Truncated(tag_name(tag)))?;
        self.pos += 8;
        Ok(v)
    }

    fn take_counted(&mut self, tag: u8) -> Result<&[u8], ProtocolError> {
        self.take_tag(tag)?;
        let len = read_u32_at(&self.inp, self.pos)
            .ok_or(ProtocolError::Truncated("length prefix"))? as usize;
        let start = self.pos + 4;
        let data = self
            .inp
            .get(start..start + len)
            .ok_or(ProtocolError::Truncated(tag_name(tag)))?;
        self.pos = start + len;
        Ok(data)
    }

    pub fn get_i64(&mut self) -> Result<i64, ProtocolError> {
        self.take_u64(TAG_INT).map(|v| v as i64)
    }

    pub fn get_i32(&mut self) -> Result<i32, ProtocolError> {
        i32::try_from(self.get_i64()?)
            .map_err(|_| ProtocolError::InvalidPayload("int out of i32 range"))
    }

    pub fn get_word(&mut self) -> Result<u64, ProtocolError> {
        self.take_u64(TAG_WORD)
    }

    pub fn get_bytes(&mut self) -> Result<Vec<u8>, ProtocolError> {
        self.take_counted(TAG_BYTES).map(<[u8]>::to_vec)
    }

    pub fn get_str(&mut self) -> Result<String, ProtocolError> {
        let bytes = self.take_counted(TAG_STR)?.to_vec();
        String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidPayload("invalid UTF-8 in str"))
    }

    /// Decode a compound value from its ordered primitives.
    pub fn get<V: Decode>(&mut self) -> Result<V, ProtocolError> {
        V::decode(self)
    }
}

fn disconnect_or_io(e: std::io::Error) -> ProtocolError {
    match e.kind() {
        ErrorKind::UnexpectedEof | ErrorKind::BrokenPipe | ErrorKind::ConnectionReset => {
            ProtocolError::Disconnected
        }
        _ => ProtocolError::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;

    use super::*;

    fn pair() -> (Stream<UnixStream>, Stream<UnixStream>) {
        let (a, b) = UnixStream::pair().unwrap();
        (Stream::client(a), Stream::server(b))
    }

    #[test]
    fn request_response_roundtrip() {
        let (mut client, mut server) = pair();

        client.encode().unwrap();
        client.put_i32(-5).unwrap();
        client.put_str("/tmp/data").unwrap();
        client.put_bytes(b"\x00\x01\x02").unwrap();
        client.put_word(u64::MAX).unwrap();
        client.end_of_message().unwrap();

        server.decode().unwrap();
        assert_eq!(server.get_i32().unwrap(), -5);
        assert_eq!(server.get_str().unwrap(), "/tmp/data");
        assert_eq!(server.get_bytes().unwrap(), b"\x00\x01\x02");
        assert_eq!(server.get_word().unwrap(), u64::MAX);
        server.end_of_message().unwrap();

        server.encode().unwrap();
        server.put_i64(3).unwrap();
        server.end_of_message().unwrap();

        client.decode().unwrap();
        assert_eq!(client.get_i64().unwrap(), 3);
        client.end_of_message().unwrap();
    }

    #[test]
    fn second_request_before_reply_is_out_of_turn() {
        let (mut client, _server) = pair();
        client.encode().unwrap();
        client.put_i32(1).unwrap();
        client.end_of_message().unwrap();

        let err = client.encode().unwrap_err();
        assert!(matches!(err, ProtocolError::OutOfTurn(_)));
    }

    #[test]
    fn reply_before_request_consumed_is_out_of_turn() {
        let (mut client, mut server) = pair();
        client.encode().unwrap();
        client.put_i32(1).unwrap();
        client.end_of_message().unwrap();

        // Server has not decoded yet: it may not answer.
        assert!(matches!(server.encode(), Err(ProtocolError::OutOfTurn(_))));

        // Client may not read its own request back.
        let (mut fresh_client, _s) = pair();
        assert!(matches!(fresh_client.decode(), Err(ProtocolError::OutOfTurn(_))));
    }

    #[test]
    fn put_while_decoding_is_wrong_mode() {
        let (mut client, mut server) = pair();
        client.encode().unwrap();
        client.put_i32(1).unwrap();
        client.end_of_message().unwrap();

        server.decode().unwrap();
        assert!(matches!(server.put_i32(2), Err(ProtocolError::WrongMode(_))));
    }

    #[test]
    fn type_mismatch_detected() {
        let (mut client, mut server) = pair();
        client.encode().unwrap();
        client.put_str("x").unwrap();
        client.end_of_message().unwrap();

        server.decode().unwrap();
        let err = server.get_i32().unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::TypeMismatch { expected: "int", found: TAG_STR }
        ));
    }

    #[test]
    fn unconsumed_fields_rejected_at_end_of_message() {
        let (mut client, mut server) = pair();
        client.encode().unwrap();
        client.put_i32(1).unwrap();
        client.put_i32(2).unwrap();
        client.end_of_message().unwrap();

        server.decode().unwrap();
        server.get_i32().unwrap();
        assert!(matches!(
            server.end_of_message(),
            Err(ProtocolError::UnconsumedData(9))
        ));
    }

    #[test]
    fn reading_past_end_is_truncated() {
        let (mut client, mut server) = pair();
        client.encode().unwrap();
        client.end_of_message().unwrap();

        server.decode().unwrap();
        assert!(matches!(server.get_i64(), Err(ProtocolError::Truncated(_))));
    }

    #[test]
    fn peer_hangup_is_disconnected() {
        let (client, mut server) = pair();
        drop(client);
        assert!(matches!(server.decode(), Err(ProtocolError::Disconnected)));
    }

    #[test]
    fn oversized_frame_rejected() {
        let (mut raw, b) = UnixStream::pair().unwrap();
        let mut server = Stream::server(b);
        raw.write_all(&(17 * 1024 * 1024_u32).to_be_bytes()).unwrap();
        assert!(matches!(
            server.decode(),
            Err(ProtocolError::MessageTooLarge(_))
        ));
    }

    #[test]
    fn i32_range_enforced() {
        let (mut client, mut server) = pair();
        client.encode().unwrap();
        client.put_i64(i64::from(i32::MAX) + 1).unwrap();
        client.end_of_message().unwrap();

        server.decode().unwrap();
        assert!(matches!(
            server.get_i32(),
            Err(ProtocolError::InvalidPayload(_))
        ));
    }
}
