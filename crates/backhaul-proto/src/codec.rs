//! Length-prefixed envelope codec for async streams

use crate::{Envelope, ProtocolError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Codec for envelopes over a byte stream: a big-endian `u32` length followed
/// by the MessagePack-encoded envelope.
pub struct EnvelopeCodec {
    /// Read buffer for incoming data
    read_buf: BytesMut,
    /// Maximum frame size allowed
    max_frame_size: usize,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeCodec {
    /// Create a new codec with default settings
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Create a new codec with a custom max frame size
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            read_buf: BytesMut::with_capacity(8192),
            max_frame_size,
        }
    }

    /// Encode an envelope to bytes with length prefix
    pub fn encode(&self, envelope: &Envelope) -> Result<Bytes, ProtocolError> {
        let body = envelope.to_msgpack()?;
        if body.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: body.len(),
                max: self.max_frame_size,
            });
        }

        let mut buf = BytesMut::with_capacity(4 + body.len());
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    /// Write an envelope to an async writer
    pub async fn write_envelope<W>(&self, writer: &mut W, envelope: &Envelope) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let encoded = self.encode(envelope)?;
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read an envelope from an async reader.
    ///
    /// Returns `Ok(None)` on a clean EOF. A frame that arrives whole but does
    /// not decode is consumed and reported as [`ProtocolError::Serialization`],
    /// so the caller may keep reading.
    pub async fn read_envelope<R>(&mut self, reader: &mut R) -> Result<Option<Envelope>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(envelope) = self.try_decode()? {
                return Ok(Some(envelope));
            }

            let mut temp_buf = [0u8; 8192];
            let n = reader.read(&mut temp_buf).await?;
            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(ProtocolError::Truncated);
            }
            self.read_buf.extend_from_slice(&temp_buf[..n]);
        }
    }

    /// Try to decode an envelope from the internal buffer
    pub fn try_decode(&mut self) -> Result<Option<Envelope>, ProtocolError> {
        if self.read_buf.len() < 4 {
            return Ok(None);
        }

        let frame_len = (&self.read_buf[..4]).get_u32() as usize;
        if frame_len > self.max_frame_size {
            // The stream cannot be resynchronised past an oversized length.
            return Err(ProtocolError::FrameTooLarge {
                size: frame_len,
                max: self.max_frame_size,
            });
        }
        if self.read_buf.len() < 4 + frame_len {
            return Ok(None);
        }

        self.read_buf.advance(4);
        let body = self.read_buf.split_to(frame_len);
        Envelope::from_msgpack(&body).map(Some)
    }

    /// Get the current buffer size
    pub fn buffer_size(&self) -> usize {
        self.read_buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_write_read_envelope() {
        let codec = EnvelopeCodec::new();
        let envelope = Envelope::request(10, 99, Bytes::from("payload"));

        let mut buffer = Vec::new();
        codec.write_envelope(&mut buffer, &envelope).await.unwrap();

        let mut reader = EnvelopeCodec::new();
        let mut cursor = Cursor::new(buffer);
        let decoded = reader.read_envelope(&mut cursor).await.unwrap().unwrap();
        assert_eq!(decoded, envelope);
        assert!(reader.read_envelope(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partial_frame() {
        let codec = EnvelopeCodec::new();
        let encoded = codec.encode(&Envelope::result(1, Bytes::from("abc"))).unwrap();

        let mut reader = EnvelopeCodec::new();
        let mid = encoded.len() / 2;
        reader.read_buf.extend_from_slice(&encoded[..mid]);
        assert!(reader.try_decode().unwrap().is_none());

        reader.read_buf.extend_from_slice(&encoded[mid..]);
        let decoded = reader.try_decode().unwrap().unwrap();
        assert_eq!(decoded.id, 1);
        assert_eq!(reader.buffer_size(), 0);
    }

    #[tokio::test]
    async fn test_bad_frame_is_skipped() {
        let codec = EnvelopeCodec::new();
        let mut stream = BytesMut::new();
        stream.put_u32(2);
        stream.put_slice(&[0xc1, 0xc1]);
        stream.extend_from_slice(&codec.encode(&Envelope::result(5, Bytes::new())).unwrap());

        let mut reader = EnvelopeCodec::new();
        let mut cursor = Cursor::new(stream.freeze());

        let first = reader.read_envelope(&mut cursor).await;
        assert!(matches!(first, Err(ProtocolError::Serialization(_))));
        assert!(!first.unwrap_err().is_transport());

        let second = reader.read_envelope(&mut cursor).await.unwrap().unwrap();
        assert_eq!(second.id, 5);
    }

    #[tokio::test]
    async fn test_truncated_stream() {
        let codec = EnvelopeCodec::new();
        let encoded = codec.encode(&Envelope::result(1, Bytes::from("abcdef"))).unwrap();

        let mut reader = EnvelopeCodec::new();
        let mut cursor = Cursor::new(encoded[..encoded.len() - 2].to_vec());
        let result = reader.read_envelope(&mut cursor).await;
        assert!(matches!(result, Err(ProtocolError::Truncated)));
    }

    #[test]
    fn test_frame_too_large() {
        let codec = EnvelopeCodec::with_max_frame_size(16);
        let result = codec.encode(&Envelope::result(1, vec![0u8; 64]));
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    proptest! {
        #[test]
        fn test_back_to_back_frames(
            ids in prop::collection::vec(any::<u64>(), 1..16),
            payload in prop::collection::vec(any::<u8>(), 0..512)
        ) {
            tokio_test::block_on(async {
                let codec = EnvelopeCodec::new();
                let mut stream = Vec::new();
                for id in &ids {
                    let envelope = Envelope::request(1, *id, payload.clone());
                    codec.write_envelope(&mut stream, &envelope).await?;
                }

                let mut reader = EnvelopeCodec::new();
                let mut cursor = Cursor::new(stream);
                for id in &ids {
                    let decoded = reader.read_envelope(&mut cursor).await?.unwrap();
                    prop_assert_eq!(decoded.id, *id);
                    prop_assert_eq!(&decoded.data[..], &payload[..]);
                }
                prop_assert!(reader.read_envelope(&mut cursor).await?.is_none());
                Ok(())
            })?;
        }
    }
}
