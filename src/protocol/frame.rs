//! Frame Codec
//!
//! Length-prefixed encoding of [`Message`]s. The prefix lets the reader pull
//! exactly one frame off the stream regardless of how the transport splits it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{Data, Message, Request, Response, Status};
use crate::error::{Error, Result};

/// Largest frame body accepted from a peer (16MB)
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const KIND_REQUEST: u8 = 1;
const KIND_RESPONSE: u8 = 2;

// =============================================================================
// Encoding
// =============================================================================

/// Encode a message body (without the length prefix)
pub fn encode(message: &Message) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(64);
    let data = match message {
        Message::Request(request) => {
            buf.put_u8(KIND_REQUEST);
            put_str(&mut buf, request.command())?;
            request.data()
        }
        Message::Response(response) => {
            buf.put_u8(KIND_RESPONSE);
            buf.put_u8(response.status().code());
            response.data()
        }
    };

    buf.put_u32(len_u32(data.len())?);
    for (key, value) in data.iter() {
        put_str(&mut buf, key)?;
        put_str(&mut buf, value)?;
    }

    if buf.len() > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!(
            "frame of {} bytes exceeds limit of {}",
            buf.len(),
            MAX_FRAME_LEN
        )));
    }
    Ok(buf.freeze())
}

fn put_str(buf: &mut BytesMut, value: &str) -> Result<()> {
    buf.put_u32(len_u32(value.len())?);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn len_u32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::Protocol(format!("length {} does not fit a frame", len)))
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode a message body (without the length prefix)
pub fn decode(mut body: Bytes) -> Result<Message> {
    let kind = get_u8(&mut body)?;
    let message = match kind {
        KIND_REQUEST => {
            let command = get_str(&mut body)?;
            let data = get_data(&mut body)?;
            Message::Request(Request::with_data(command, data))
        }
        KIND_RESPONSE => {
            let status = Status::from_code(get_u8(&mut body)?)?;
            let data = get_data(&mut body)?;
            Message::Response(Response::with_data(status, data))
        }
        other => {
            return Err(Error::Protocol(format!("unknown frame kind {}", other)));
        }
    };

    if body.has_remaining() {
        return Err(Error::Protocol(format!(
            "{} trailing bytes after {}",
            body.remaining(),
            message.kind()
        )));
    }
    Ok(message)
}

fn get_u8(body: &mut Bytes) -> Result<u8> {
    if body.remaining() < 1 {
        return Err(truncated());
    }
    Ok(body.get_u8())
}

fn get_u32(body: &mut Bytes) -> Result<u32> {
    if body.remaining() < 4 {
        return Err(truncated());
    }
    Ok(body.get_u32())
}

fn get_str(body: &mut Bytes) -> Result<String> {
    let len = get_u32(body)? as usize;
    if body.remaining() < len {
        return Err(truncated());
    }
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|e| Error::Protocol(format!("string is not UTF-8: {}", e)))
}

fn get_data(body: &mut Bytes) -> Result<Data> {
    let count = get_u32(body)?;
    let mut data = Data::new();
    for _ in 0..count {
        let key = get_str(body)?;
        let value = get_str(body)?;
        data.insert(key, value);
    }
    Ok(data)
}

fn truncated() -> Error {
    Error::Protocol("truncated frame".into())
}

// =============================================================================
// Stream I/O
// =============================================================================

/// Write one length-prefixed frame and flush it
pub async fn write_frame<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = encode(message)?;
    let mut frame = BytesMut::with_capacity(4 + body.len());
    frame.put_u32(len_u32(body.len())?);
    frame.put_slice(&body);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame, waiting until it has fully arrived
pub async fn read_frame<R>(reader: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(Error::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    };

    if len > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!(
            "announced frame of {} bytes exceeds limit of {}",
            len, MAX_FRAME_LEN
        )));
    }

    let mut body = BytesMut::zeroed(len);
    match reader.read_exact(&mut body).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(Error::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    decode(body.freeze())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HELLO, MESSAGE};
    use assert_matches::assert_matches;

    #[test]
    fn test_request_layout() {
        let request = Request::new("HI").with("k", "v");
        let body = encode(&Message::Request(request)).unwrap();

        let expected: &[u8] = &[
            1, // kind
            0, 0, 0, 2, b'H', b'I', // command
            0, 0, 0, 1, // count
            0, 0, 0, 1, b'k', // key
            0, 0, 0, 1, b'v', // value
        ];
        assert_eq!(body.as_ref(), expected);
    }

    #[test]
    fn test_decode_response() {
        let response = Response::ok().with_message("hi!").with("extra", "1");
        let decoded = decode(encode(&Message::Response(response.clone())).unwrap()).unwrap();
        assert_eq!(decoded, Message::Response(response));
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let body = Bytes::from_static(&[7, 0, 0, 0, 0]);
        assert_matches!(decode(body), Err(Error::Protocol(_)));
    }

    #[test]
    fn test_decode_rejects_truncated_string() {
        let body = Bytes::from_static(&[1, 0, 0, 0, 9, b'H']);
        assert_matches!(decode(body), Err(Error::Protocol(msg)) if msg.contains("truncated"));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut raw = encode(&Message::Request(Request::new(HELLO))).unwrap().to_vec();
        raw.push(0xff);
        assert_matches!(decode(Bytes::from(raw)), Err(Error::Protocol(_)));
    }

    #[test]
    fn test_decode_rejects_invalid_utf8() {
        let body = Bytes::from_static(&[1, 0, 0, 0, 1, 0xff, 0, 0, 0, 0]);
        assert_matches!(decode(body), Err(Error::Protocol(msg)) if msg.contains("UTF-8"));
    }

    #[tokio::test]
    async fn test_frame_survives_partial_reads() {
        let (mut client, mut server) = tokio::io::duplex(3);
        let request = Request::new(HELLO).with("hello", "world");

        let expected = request.clone();
        let writer = tokio::spawn(async move {
            write_frame(&mut client, &Message::Request(request)).await.unwrap();
        });

        let message = read_frame(&mut server).await.unwrap();
        writer.await.unwrap();
        assert_eq!(message, Message::Request(expected));
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let request = Request::new(HELLO).with("hello", "world");
        let body = encode(&Message::Request(request.clone())).unwrap();
        let mut wire = (body.len() as u32).to_be_bytes().to_vec();
        wire.extend_from_slice(&body);

        // Length prefix straddles the first two reads
        let (head, tail) = wire.split_at(3);
        let (mid, rest) = tail.split_at(5);
        let mut stream = tokio_test::io::Builder::new()
            .read(head)
            .read(mid)
            .read(rest)
            .build();

        let message = read_frame(&mut stream).await.unwrap();
        assert_eq!(message, Message::Request(request));
    }

    #[tokio::test]
    async fn test_write_frame_prefixes_length() {
        let message = Message::Request(Request::new("HI"));
        let mut wire = vec![0, 0, 0, 11];
        wire.extend_from_slice(&encode(&message).unwrap());

        let mut stream = tokio_test::io::Builder::new().write(&wire).build();
        write_frame(&mut stream, &message).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_frame_on_closed_stream() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert_matches!(read_frame(&mut server).await, Err(Error::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized_announcement() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes())
            .await
            .unwrap();
        assert_matches!(read_frame(&mut server).await, Err(Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_message_key_survives_framing() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let response = Response::ok().with_message("done");
        write_frame(&mut client, &Message::Response(response)).await.unwrap();

        match read_frame(&mut server).await.unwrap() {
            Message::Response(r) => assert_eq!(r.require_data(MESSAGE).unwrap(), "done"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
