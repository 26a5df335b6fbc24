//! Incremental payload-stream codec.
//!
//! The wire format for push bodies and pull responses is a concatenation of
//! self-delimited JSON objects, each tagged with the payload type. Both ends
//! must process the stream incrementally: pull responses can carry far more
//! objects than fit in memory, and partial store commits happen mid-stream.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::types::Payload;

const READ_CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed payload stream: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload stream ended mid-object")]
    UnexpectedEof,
}

/// Reads payloads one at a time from an async byte stream.
///
/// Buffers only as much input as the current object needs; whitespace
/// (including the newline separators the writer emits) between objects is
/// skipped by the JSON parser.
pub struct PayloadReader<R> {
    inner: R,
    buf: BytesMut,
    eof: bool,
}

impl<R: AsyncRead + Unpin> PayloadReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            eof: false,
        }
    }

    /// Next payload, or `None` at a clean end of stream.
    pub async fn next(&mut self) -> Result<Option<Payload>, CodecError> {
        loop {
            let attempt = {
                let mut iter =
                    serde_json::Deserializer::from_slice(&self.buf).into_iter::<Payload>();
                match iter.next() {
                    Some(Ok(payload)) => Some(Ok((payload, iter.byte_offset()))),
                    Some(Err(e)) => Some(Err(e)),
                    None => None,
                }
            };
            match attempt {
                Some(Ok((payload, consumed))) => {
                    self.buf.advance(consumed);
                    return Ok(Some(payload));
                }
                Some(Err(e)) if e.is_eof() && !self.eof => {
                    // Partial object: fall through and read more.
                }
                Some(Err(e)) if e.is_eof() => return Err(CodecError::UnexpectedEof),
                Some(Err(e)) => return Err(CodecError::Json(e)),
                None if self.eof => return Ok(None),
                None => {
                    // Buffer holds only whitespace so far.
                }
            }

            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                self.eof = true;
            }
        }
    }
}

/// Write one payload followed by a newline separator.
pub async fn write_payload<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &Payload,
) -> Result<(), CodecError> {
    let mut line = serde_json::to_vec(payload)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    Ok(())
}

/// Encode a batch of payloads into a single request body.
pub fn encode_payloads<'a>(
    payloads: impl IntoIterator<Item = &'a Payload>,
) -> Result<Vec<u8>, CodecError> {
    let mut body = Vec::new();
    for payload in payloads {
        serde_json::to_writer(&mut body, payload)?;
        std::io::Write::write_all(&mut body, b"\n")?;
    }
    Ok(body)
}

/// An `AsyncRead` body that serializes payloads lazily as it is consumed.
///
/// Backs streaming pull responses: the store's response iterator is only
/// advanced as the peer drains the connection.
pub struct PayloadBody<I> {
    items: I,
    pending: Vec<u8>,
    pos: usize,
    failed: bool,
}

impl<I> PayloadBody<I>
where
    I: Iterator<Item = Payload>,
{
    pub fn new(items: I) -> Self {
        Self {
            items,
            pending: Vec::new(),
            pos: 0,
            failed: false,
        }
    }
}

impl<I> AsyncRead for PayloadBody<I>
where
    I: Iterator<Item = Payload> + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.failed {
            return Poll::Ready(Err(std::io::Error::other("payload serialization failed")));
        }
        loop {
            if this.pos < this.pending.len() {
                let n = buf.remaining().min(this.pending.len() - this.pos);
                buf.put_slice(&this.pending[this.pos..this.pos + n]);
                this.pos += n;
                return Poll::Ready(Ok(()));
            }
            match this.items.next() {
                Some(payload) => match serde_json::to_vec(&payload) {
                    Ok(mut line) => {
                        line.push(b'\n');
                        this.pending = line;
                        this.pos = 0;
                    }
                    Err(e) => {
                        this.failed = true;
                        return Poll::Ready(Err(std::io::Error::other(e)));
                    }
                },
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FriendId, Group, Location, Post, PublicIdentity};
    use chrono::Utc;

    fn sample_payloads() -> Vec<Payload> {
        let member = PublicIdentity {
            id: FriendId::from("f1"),
            nickname: "alice".into(),
            x509_certificate: "cert".into(),
            hidden_service_hostname: "alice.onion".into(),
            hidden_service_auth_cookie: "cookie".into(),
        };
        vec![
            Payload::Group(Group {
                id: "g1".into(),
                name: "hikers".into(),
                members: vec![member],
                sequence_number: 1,
                modified_timestamp: Utc::now(),
            }),
            Payload::Post(Post {
                id: "p1".into(),
                group_id: "g1".into(),
                content: "view from the summit".into(),
                attachments: vec![],
                sequence_number: 2,
                created_timestamp: Utc::now(),
            }),
            Payload::Location(Location {
                timestamp: Utc::now(),
                latitude: 46.2,
                longitude: 6.1,
                street_address: String::new(),
            }),
        ]
    }

    /// Delivers the underlying bytes a few at a time, to exercise partial
    /// object buffering.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl AsyncRead for Trickle {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            let this = self.get_mut();
            let n = this.step.min(this.data.len() - this.pos).min(buf.remaining());
            buf.put_slice(&this.data[this.pos..this.pos + n]);
            this.pos += n;
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn round_trip() {
        let payloads = sample_payloads();
        let body = encode_payloads(&payloads).unwrap();

        let mut reader = PayloadReader::new(body.as_slice());
        let mut decoded = Vec::new();
        while let Some(payload) = reader.next().await.unwrap() {
            decoded.push(payload);
        }
        assert_eq!(decoded, payloads);
    }

    #[tokio::test]
    async fn decodes_across_partial_reads() {
        let payloads = sample_payloads();
        let body = encode_payloads(&payloads).unwrap();

        let mut reader = PayloadReader::new(Trickle {
            data: body,
            pos: 0,
            step: 7,
        });
        let mut count = 0;
        while let Some(_payload) = reader.next().await.unwrap() {
            count += 1;
        }
        assert_eq!(count, payloads.len());
    }

    #[tokio::test]
    async fn empty_stream_yields_none() {
        let mut reader = PayloadReader::new(&b"  \n"[..]);
        assert!(reader.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_object_is_an_error() {
        let payloads = sample_payloads();
        let mut body = encode_payloads(&payloads).unwrap();
        body.truncate(body.len() / 2);

        let mut reader = PayloadReader::new(body.as_slice());
        let mut saw_error = false;
        loop {
            match reader.next().await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(CodecError::UnexpectedEof) => {
                    saw_error = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn garbage_is_rejected() {
        let mut reader = PayloadReader::new(&b"{\"type\":\"unknown\",\"x\":1}\n"[..]);
        assert!(matches!(reader.next().await, Err(CodecError::Json(_))));
    }

    #[tokio::test]
    async fn payload_body_streams_lazily() {
        let payloads = sample_payloads();
        let body = PayloadBody::new(payloads.clone().into_iter());

        let mut reader = PayloadReader::new(body);
        let mut decoded = Vec::new();
        while let Some(payload) = reader.next().await.unwrap() {
            decoded.push(payload);
        }
        assert_eq!(decoded, payloads);
    }
}
