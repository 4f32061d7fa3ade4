use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{WireError, MAX_STRING_LEN};

pub(crate) fn put_string(buf: &mut BytesMut, value: &str) -> Result<(), WireError> {
    if value.len() > MAX_STRING_LEN {
        return Err(WireError::InvalidData("string too long"));
    }
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value.as_bytes());
    Ok(())
}

pub(crate) fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(value as u8);
}

pub(crate) fn put_range(
    buf: &mut BytesMut,
    key: &str,
    start: i64,
    end: i64,
) -> Result<(), WireError> {
    put_string(buf, key)?;
    buf.put_i64_le(start);
    buf.put_i64_le(end);
    Ok(())
}

pub(crate) async fn read_u8<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u8, WireError> {
    Ok(reader.read_u8().await?)
}

pub(crate) async fn read_u32<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u32, WireError> {
    Ok(reader.read_u32_le().await?)
}

pub(crate) async fn read_u64<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u64, WireError> {
    Ok(reader.read_u64_le().await?)
}

pub(crate) async fn read_i64<R: AsyncRead + Unpin>(reader: &mut R) -> Result<i64, WireError> {
    Ok(reader.read_i64_le().await?)
}

pub(crate) async fn read_bool<R: AsyncRead + Unpin>(reader: &mut R) -> Result<bool, WireError> {
    match read_u8(reader).await? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(WireError::InvalidData("invalid boolean")),
    }
}

pub(crate) async fn read_blob<R: AsyncRead + Unpin>(
    reader: &mut R,
    len: usize,
) -> Result<Vec<u8>, WireError> {
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

pub(crate) async fn read_string<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<String, WireError> {
    let len = read_u32(reader).await? as usize;
    if len > MAX_STRING_LEN {
        return Err(WireError::InvalidData("string too long"));
    }
    let bytes = read_blob(reader, len).await?;
    String::from_utf8(bytes).map_err(|_| WireError::InvalidData("string is not utf-8"))
}

pub(crate) async fn read_range<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<(String, i64, i64), WireError> {
    let key = read_string(reader).await?;
    let start = read_i64(reader).await?;
    let end = read_i64(reader).await?;
    Ok((key, start, end))
}
