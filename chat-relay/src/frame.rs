//! Length-prefixed wire framing shared by the relay and the terminal client.
//!
//! Every string on the wire is a 2-byte big-endian length followed by that
//! many UTF-8 bytes. A frame is a kind tag string (`"TEXT"` or `"IMAGE"`)
//! followed by a kind-specific payload:
//!
//! - `TEXT`: one length-prefixed string.
//! - `IMAGE`: a 4-byte big-endian length followed by the raw bytes.
//!
//! The handshake is a single bare string carrying the username.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const TEXT_TAG: &str = "TEXT";
const IMAGE_TAG: &str = "IMAGE";

/// Largest string payload the 2-byte length prefix can describe.
pub const MAX_TEXT_BYTES: usize = u16::MAX as usize;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("stream closed")]
    Closed,
    #[error("i/o failure: {0}")]
    Io(#[source] io::Error),
    #[error("unknown frame kind '{0}'")]
    UnknownKind(String),
    #[error("string payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("text of {0} bytes does not fit a 16-bit length prefix")]
    TextTooLong(usize),
    #[error("image of {len} bytes exceeds the {max} byte limit")]
    ImageTooLarge { len: usize, max: usize },
    #[error("negative image length {0}")]
    NegativeLength(i32),
    #[error("peer did not accept the frame within {0:?}")]
    WriteTimedOut(std::time::Duration),
}

impl From<io::Error> for ChannelError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => ChannelError::Closed,
            _ => ChannelError::Io(err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    Image,
}

impl FrameKind {
    pub fn tag(self) -> &'static str {
        match self {
            FrameKind::Text => TEXT_TAG,
            FrameKind::Image => IMAGE_TAG,
        }
    }

    fn from_tag(tag: String) -> Result<Self, ChannelError> {
        match tag.as_str() {
            TEXT_TAG => Ok(FrameKind::Text),
            IMAGE_TAG => Ok(FrameKind::Image),
            _ => Err(ChannelError::UnknownKind(tag)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Image(Vec<u8>),
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Text(_) => FrameKind::Text,
            Frame::Image(_) => FrameKind::Image,
        }
    }

    /// Encodes the whole frame up front so a single `write_all` puts it on the wire.
    pub fn encode(&self) -> Result<Vec<u8>, ChannelError> {
        let mut buf = Vec::new();
        put_string(&mut buf, self.kind().tag())?;
        match self {
            Frame::Text(body) => put_string(&mut buf, body)?,
            Frame::Image(bytes) => {
                let len = i32::try_from(bytes.len()).map_err(|_| ChannelError::ImageTooLarge {
                    len: bytes.len(),
                    max: i32::MAX as usize,
                })?;
                buf.extend_from_slice(&len.to_be_bytes());
                buf.extend_from_slice(bytes);
            }
        }
        Ok(buf)
    }
}

fn put_string(buf: &mut Vec<u8>, value: &str) -> Result<(), ChannelError> {
    let len = u16::try_from(value.len()).map_err(|_| ChannelError::TextTooLong(value.len()))?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

pub async fn read_string<R>(reader: &mut R) -> Result<String, ChannelError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u16().await? as usize;
    let mut bytes = vec![0; len];
    reader.read_exact(&mut bytes).await?;
    String::from_utf8(bytes).map_err(|_| ChannelError::InvalidUtf8)
}

pub async fn write_string<W>(writer: &mut W, value: &str) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(value.len() + 2);
    put_string(&mut buf, value)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one complete frame, rejecting images larger than `max_image_bytes`.
///
/// Not cancel safe: dropping the future mid-frame leaves the stream out of sync.
pub async fn read_frame<R>(reader: &mut R, max_image_bytes: usize) -> Result<Frame, ChannelError>
where
    R: AsyncRead + Unpin,
{
    let kind = FrameKind::from_tag(read_string(reader).await?)?;
    match kind {
        FrameKind::Text => Ok(Frame::Text(read_string(reader).await?)),
        FrameKind::Image => {
            let len = reader.read_i32().await?;
            let len = usize::try_from(len).map_err(|_| ChannelError::NegativeLength(len))?;
            if len > max_image_bytes {
                return Err(ChannelError::ImageTooLarge {
                    len,
                    max: max_image_bytes,
                });
            }
            let mut bytes = vec![0; len];
            reader.read_exact(&mut bytes).await?;
            Ok(Frame::Image(bytes))
        }
    }
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
{
    write_encoded(writer, &frame.encode()?).await
}

pub(crate) async fn write_encoded<W>(writer: &mut W, encoded: &[u8]) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(encoded).await?;
    writer.flush().await?;
    Ok(())
}
