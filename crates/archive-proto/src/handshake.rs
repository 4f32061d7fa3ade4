use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::codec::{put_string, read_string, read_u32};
use crate::{
    WireError, CLIENT_MAGIC, CLIENT_READY, PROTOCOL_VERSION, SERVER_MAGIC, SERVER_READY,
};

/// Runs the client half of the connection handshake, announcing `name` to the server.
pub async fn client_handshake<S>(stream: &mut S, name: &str) -> Result<(), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&CLIENT_MAGIC.to_le_bytes()).await?;
    stream.flush().await?;

    let magic = read_u32(stream).await?;
    if magic != SERVER_MAGIC {
        return Err(WireError::BadMagic(magic));
    }
    let version = read_u32(stream).await?;
    if version != PROTOCOL_VERSION {
        return Err(WireError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            found: version,
        });
    }

    let mut buf = BytesMut::with_capacity(12 + name.len());
    buf.put_u32_le(PROTOCOL_VERSION);
    put_string(&mut buf, name)?;
    buf.put_u32_le(CLIENT_READY);
    stream.write_all(&buf).await?;
    stream.flush().await?;

    let ready = read_u32(stream).await?;
    if ready != SERVER_READY {
        return Err(WireError::BadReady(ready));
    }
    Ok(())
}

/// Runs the server half of the handshake and returns the name the client announced.
pub async fn server_handshake<S>(stream: &mut S) -> Result<String, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let magic = read_u32(stream).await?;
    if magic != CLIENT_MAGIC {
        return Err(WireError::BadMagic(magic));
    }

    let mut buf = BytesMut::with_capacity(8);
    buf.put_u32_le(SERVER_MAGIC);
    buf.put_u32_le(PROTOCOL_VERSION);
    stream.write_all(&buf).await?;
    stream.flush().await?;

    let version = read_u32(stream).await?;
    if version != PROTOCOL_VERSION {
        return Err(WireError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            found: version,
        });
    }
    let name = read_string(stream).await?;
    let ready = read_u32(stream).await?;
    if ready != CLIENT_READY {
        return Err(WireError::BadReady(ready));
    }

    stream.write_all(&SERVER_READY.to_le_bytes()).await?;
    stream.flush().await?;
    Ok(name)
}
