//! Length-prefixed framing of JSON records over a byte stream.
//!
//! A frame is a 4-byte big-endian length followed by that many bytes of JSON.
//! A frame whose body does not parse is still consumed, so that one bad record
//! does not desynchronise the rest of the stream.

use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{config::DEFAULT_MAX_FRAME, ChatError};

/// Size of the length field in front of every frame.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Serialize a record and prefix it with its length.
pub fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>, ChatError> {
    let body = serde_json::to_vec(record)?;
    let length = u32::try_from(body.len())
        .map_err(|_| ChatError::FrameTooLarge(body.len(), u32::MAX as usize))?;

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Parse the body of one frame.
pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ChatError> {
    serde_json::from_slice(body).map_err(|err| ChatError::MalformedPayload(err.to_string()))
}

/// Append `new_bytes` to `buffer` and extract every complete frame.
///
/// Returns the decoded records, in stream order, and whatever trailing partial
/// frame is left for the next call.
pub fn feed<T: DeserializeOwned>(
    buffer: Vec<u8>,
    new_bytes: &[u8],
) -> (Vec<Result<T, ChatError>>, Vec<u8>) {
    let mut decoder = FrameDecoder::from_pending(buffer);
    let records = decoder.feed(new_bytes);
    (records, decoder.into_pending())
}

/// The receive buffer of one connection.
#[derive(Debug)]
pub struct FrameDecoder<T> {
    buffer: Vec<u8>,
    max_frame: usize,
    _phantom: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Default for FrameDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> FrameDecoder<T> {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::from_pending(Vec::new())
    }

    /// Create a decoder resuming from a partially received buffer.
    pub fn from_pending(buffer: Vec<u8>) -> Self {
        Self {
            buffer,
            max_frame: DEFAULT_MAX_FRAME,
            _phantom: PhantomData,
        }
    }

    /// Sets the largest frame body accepted.
    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    /// Append received bytes and extract every complete frame.
    ///
    /// A frame declaring more than the maximum length yields
    /// [`ChatError::FrameTooLarge`]; there is no way to find the next frame boundary
    /// after that, so the buffer is discarded and the caller should close the stream.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<T, ChatError>> {
        self.buffer.extend_from_slice(bytes);

        let mut records = Vec::new();
        let mut consumed = 0;

        loop {
            let remaining = &self.buffer[consumed..];
            if remaining.len() < LENGTH_PREFIX_SIZE {
                break;
            }

            let length =
                u32::from_be_bytes([remaining[0], remaining[1], remaining[2], remaining[3]])
                    as usize;

            if length > self.max_frame {
                records.push(Err(ChatError::FrameTooLarge(length, self.max_frame)));
                consumed = self.buffer.len();
                break;
            }

            if remaining.len() < LENGTH_PREFIX_SIZE + length {
                break;
            }

            records.push(decode_body(
                &remaining[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + length],
            ));
            consumed += LENGTH_PREFIX_SIZE + length;
        }

        self.buffer.drain(..consumed);
        records
    }

    /// Whether no partial frame is buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Consume the decoder, returning the trailing partial frame.
    pub fn into_pending(self) -> Vec<u8> {
        self.buffer
    }
}

/// Write one record as a frame.
pub async fn write_frame<W, T>(writer: &mut W, record: &T) -> Result<usize, ChatError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode(record)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(frame.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChatMessage, PeerRecord};
    use tokio::io::AsyncReadExt;

    fn messages() -> Vec<ChatMessage> {
        let alice = PeerRecord::new("alice-id", "alice", "alice-laptop", "192.168.1.20", 10000);
        vec![
            ChatMessage::direct(&alice, "bob-id", "bob", "hello"),
            ChatMessage::direct(&alice, "bob-id", "bob", "how are you?"),
            ChatMessage::direct(&alice, "bob-id", "bob", "\u{1F4AC} unicode body"),
        ]
    }

    fn stream(records: &[ChatMessage]) -> Vec<u8> {
        records
            .iter()
            .flat_map(|record| encode(record).expect("Failed to encode."))
            .collect()
    }

    fn unwrap_all(records: Vec<Result<ChatMessage, ChatError>>) -> Vec<ChatMessage> {
        records
            .into_iter()
            .map(|record| record.expect("Failed to decode."))
            .collect()
    }

    #[test]
    fn prefix_is_big_endian_length() {
        let frame = encode(&serde_json::json!({"a": 1})).expect("Failed to encode.");
        let body = br#"{"a":1}"#;
        assert_eq!(&frame[..4], &(body.len() as u32).to_be_bytes());
        assert_eq!(&frame[4..], body);
    }

    #[test]
    fn round_trip() {
        let mut decoder = FrameDecoder::<ChatMessage>::new();
        let decoded = unwrap_all(decoder.feed(&stream(&messages())));

        assert_eq!(decoded, messages());
        assert!(decoder.is_empty());
    }

    #[test]
    fn fragmentation_does_not_matter() {
        let bytes = stream(&messages());

        let mut decoder = FrameDecoder::<ChatMessage>::new();
        let decoded: Vec<_> = bytes
            .iter()
            .flat_map(|byte| decoder.feed(std::slice::from_ref(byte)))
            .collect();

        assert_eq!(unwrap_all(decoded), messages());
        assert!(decoder.is_empty());
    }

    #[test]
    fn two_records_in_one_read_decode_in_order() {
        let records = &messages()[..2];
        let (decoded, pending) = feed::<ChatMessage>(Vec::new(), &stream(records));

        assert_eq!(unwrap_all(decoded), records);
        assert!(pending.is_empty());
    }

    #[test]
    fn partial_frame_stays_buffered() {
        let bytes = stream(&messages()[..1]);
        let split = bytes.len() - 3;

        let (decoded, pending) = feed::<ChatMessage>(Vec::new(), &bytes[..split]);
        assert!(decoded.is_empty());
        assert_eq!(pending.len(), split);

        let (decoded, pending) = feed::<ChatMessage>(pending, &bytes[split..]);
        assert_eq!(unwrap_all(decoded), &messages()[..1]);
        assert!(pending.is_empty());
    }

    #[test]
    fn malformed_body_is_consumed() {
        let garbage = b"{this is not json";
        let mut bytes = (garbage.len() as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(garbage);
        bytes.extend(stream(&messages()[..1]));

        let mut decoder = FrameDecoder::<ChatMessage>::new();
        let mut decoded = decoder.feed(&bytes).into_iter();

        assert!(matches!(
            decoded.next(),
            Some(Err(ChatError::MalformedPayload(_)))
        ));
        assert_eq!(
            decoded.next().map(|record| record.expect("Failed to decode.")),
            Some(messages()[0].clone())
        );
        assert!(decoded.next().is_none());
        assert!(decoder.is_empty());
    }

    #[test]
    fn wrong_shape_is_a_decode_error() {
        let bytes = encode(&serde_json::json!({"type": "HEARTBEAT"})).expect("Failed to encode.");
        let (decoded, pending) = feed::<ChatMessage>(Vec::new(), &bytes);

        assert_eq!(decoded.len(), 1);
        assert!(matches!(decoded[0], Err(ChatError::MalformedPayload(_))));
        assert!(pending.is_empty());
    }

    #[test]
    fn oversized_frame_is_fatal_to_the_stream() {
        let mut decoder = FrameDecoder::<ChatMessage>::new().with_max_frame(8);
        let decoded = decoder.feed(&stream(&messages()[..1]));

        assert_eq!(decoded.len(), 1);
        let err = decoded.into_iter().next().and_then(Result::err).expect("Expected an error.");
        assert!(err.is_stream_fatal());
        assert!(decoder.is_empty());
    }

    #[tokio::test]
    async fn async_read_and_write() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let writer = tokio::spawn(async move {
            for message in messages() {
                write_frame(&mut client, &message).await.expect("Failed to write.");
            }
        });

        let mut decoder = FrameDecoder::new();
        let mut received = Vec::new();
        let mut chunk = [0u8; 16];
        loop {
            let read = server.read(&mut chunk).await.expect("Failed to read.");
            if read == 0 {
                break;
            }
            received.extend(unwrap_all(decoder.feed(&chunk[..read])));
        }

        writer.await.expect("Writer panicked.");
        assert_eq!(received, messages());
        assert!(decoder.is_empty());
    }
}
