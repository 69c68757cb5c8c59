//! Length-prefixed Ethernet frame tunnel encoding.
//!
//! Every frame travels as a 4-byte big-endian length followed by exactly that
//! many bytes of the raw frame. Streams may deliver either part in pieces.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Smallest valid Ethernet frame without FCS (header only).
pub const MIN_FRAME_LEN: usize = 14;

/// Largest frame accepted on the tunnel.
pub const MAX_FRAME_LEN: usize = 65_535;

/// Read one frame into `buf`.
///
/// Returns `Ok(None)` when the stream ends cleanly between frames.
///
/// # Errors
///
/// `UnexpectedEof` if the stream ends inside a frame, `InvalidData` for a
/// length above [`MAX_FRAME_LEN`], or any read error.
pub async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<Option<usize>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    let mut filled = 0;
    while filled < LENGTH_PREFIX_LEN {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended inside a frame length prefix",
            ));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds {MAX_FRAME_LEN}"),
        ));
    }

    buf.resize(len, 0);
    reader.read_exact(&mut buf[..len]).await?;
    Ok(Some(len))
}

/// Write one frame.
///
/// # Errors
///
/// `InvalidInput` for a frame above [`MAX_FRAME_LEN`], or any write error.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let len = u32::try_from(frame.len())
        .ok()
        .filter(|len| *len as usize <= MAX_FRAME_LEN)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame length {} exceeds {MAX_FRAME_LEN}", frame.len()),
            )
        })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Encode a frame into a standalone buffer.
#[must_use]
pub fn encode(frame: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LENGTH_PREFIX_LEN + frame.len());
    #[allow(clippy::cast_possible_truncation)]
    out.extend_from_slice(&(frame.len() as u32).to_be_bytes());
    out.extend_from_slice(frame);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        #[allow(clippy::cast_possible_truncation)]
        (0..len).map(|i| (i * 31 + 7) as u8).collect()
    }

    #[tokio::test]
    async fn frames_survive_tiny_pipes() {
        // A 7-byte pipe forces split prefixes and payloads on both sides.
        let (mut tx, mut rx) = tokio::io::duplex(7);
        let sizes: Vec<usize> = (MIN_FRAME_LEN..=1518).step_by(97).chain([1518]).collect();
        let expected: Vec<_> = sizes.iter().map(|len| sample(*len)).collect();

        let frames = expected.clone();
        let writer = tokio::spawn(async move {
            for frame in &frames {
                write_frame(&mut tx, frame).await.unwrap();
            }
        });

        let mut buf = Vec::new();
        for want in &expected {
            let n = read_frame(&mut rx, &mut buf).await.unwrap().unwrap();
            assert_eq!(&buf[..n], want.as_slice());
        }
        writer.await.unwrap();
        assert!(read_frame(&mut rx, &mut buf).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_inside_prefix_is_an_error() {
        let mut data: &[u8] = &[0, 0];
        let err = read_frame(&mut data, &mut Vec::new()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn eof_inside_payload_is_an_error() {
        let mut encoded = encode(&sample(60));
        encoded.truncate(30);
        let mut data = encoded.as_slice();
        let err = read_frame(&mut data, &mut Vec::new()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn oversized_lengths_are_rejected() {
        let prefix = u32::try_from(MAX_FRAME_LEN + 1).unwrap().to_be_bytes();
        let mut data = &prefix[..];
        let err = read_frame(&mut data, &mut Vec::new()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let mut sink = Vec::new();
        let err = write_frame(&mut sink, &vec![0; MAX_FRAME_LEN + 1])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn encode_matches_write_frame() {
        let frame = sample(64);
        let mut written = Vec::new();
        write_frame(&mut written, &frame).await.unwrap();
        assert_eq!(written, encode(&frame));
        assert_eq!(&written[..4], &[0, 0, 0, 64]);
    }
}
