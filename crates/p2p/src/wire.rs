//! Length-prefixed bincode framing shared by the DHT and block exchange.
//!
//! A frame is a 4-byte big-endian length followed by that many bytes of
//! bincode. One request and one response travel per stream. The responder
//! closes after writing its frame, the requester after reading it.

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;

/// Largest frame accepted or produced.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(usize),
    #[error("malformed message: {0}")]
    Codec(#[from] bincode::Error),
}

pub async fn write_message<W, T>(io: &mut W, message: &T) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = bincode::serialize(message)?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(bytes.len()));
    }
    io.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    io.write_all(&bytes).await?;
    io.flush().await?;
    Ok(())
}

pub async fn read_message<R, T>(io: &mut R) -> Result<T, WireError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len = [0u8; 4];
    io.read_exact(&mut len).await?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    Ok(bincode::deserialize(&buf)?)
}

/// Client side of one exchange: send `request`, read the reply, close.
///
/// The stream stays open for writing until the reply arrives, so dropping
/// the future resets it and the remote sees the cancellation.
pub async fn request<S, Req, Resp>(stream: &mut S, request: &Req) -> Result<Resp, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    Req: Serialize,
    Resp: DeserializeOwned,
{
    write_message(stream, request).await?;
    let response = read_message(stream).await?;
    stream.close().await?;
    Ok(response)
}
