//! Line framing — turns a server-link byte stream into discrete lines.
//!
//! Splits on `\n`, stripping one preceding `\r` when present, so both
//! CR-LF and bare-LF peers are accepted. An unterminated tail stays in
//! the buffer until more bytes arrive. Empty lines are yielded as-is;
//! the session layer treats them as no-ops. No length cap is enforced
//! here — stalled or hostile peers are handled by the handshake timeout
//! sweep.
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::Message;

/// Frames complete protocol lines and encodes outbound [`Message`]s with
/// CR-LF termination.
#[derive(Debug, Default)]
pub struct LineCodec;

impl Decoder for LineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(lf) = src.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };

        let mut line = src.split_to(lf);
        src.advance(1); // the \n itself
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }

        let line = std::str::from_utf8(&line)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(Some(line.to_owned()))
    }
}

impl Encoder<Message> for LineCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let wire = item.to_wire();
        dst.reserve(wire.len() + 2);
        dst.put_slice(wire.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}
