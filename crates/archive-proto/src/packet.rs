use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::AsyncRead;

use crate::codec::{
    put_bool, put_range, put_string, read_blob, read_bool, read_i64, read_range, read_string,
    read_u32, read_u64, read_u8,
};
use crate::{WireError, MAX_CHUNK_SIZE, MAX_LIST_ENTRIES};

const CLIENT_KIND_HEARTBEAT: u8 = 0;
const CLIENT_KIND_LIST_FILES: u8 = 1;
const CLIENT_KIND_TRANSACTION_BEGIN: u8 = 2;
const CLIENT_KIND_TRANSACTION_COMMIT: u8 = 3;
const CLIENT_KIND_TRANSACTION_ABORT: u8 = 4;
const CLIENT_KIND_SET_TRANSACTION_STATUS: u8 = 5;
const CLIENT_KIND_READ_FILE: u8 = 6;
const CLIENT_KIND_WRITE_FILE: u8 = 7;
const CLIENT_KIND_REMOVE_FILE: u8 = 8;
const CLIENT_KIND_LOCK_READ: u8 = 9;
const CLIENT_KIND_LOCK_WRITE: u8 = 10;
const CLIENT_KIND_ACQUIRE_INTENT: u8 = 11;
const CLIENT_KIND_RELEASE_INTENT: u8 = 12;
const CLIENT_KIND_SEND_NOTIFICATION: u8 = 13;
const CLIENT_KIND_LISTEN_NOTIFICATION: u8 = 14;
const CLIENT_KIND_LISTEN_INTENT: u8 = 15;
const CLIENT_KIND_ACKNOWLEDGE_NOTIFICATION: u8 = 16;
const CLIENT_KIND_CLOSE: u8 = 17;

const SERVER_KIND_HEARTBEAT: u8 = 0;
const SERVER_KIND_NOTIFICATION_RECEIVED: u8 = 1;
const SERVER_KIND_INTENT_HIT: u8 = 2;
const SERVER_KIND_LIST_RESULT: u8 = 3;
const SERVER_KIND_TRANSACTION_STARTED: u8 = 4;
const SERVER_KIND_TRANSACTION_COMPLETE: u8 = 5;
const SERVER_KIND_TRANSACTION_ABORTED: u8 = 6;
const SERVER_KIND_READ_FILE_DATA: u8 = 7;
const SERVER_KIND_READ_FILE_END: u8 = 8;
const SERVER_KIND_READ_FILE_NOT_FOUND: u8 = 9;
const SERVER_KIND_WRITE_FILE_COMPLETE: u8 = 10;
const SERVER_KIND_REMOVE_FILE_COMPLETE: u8 = 11;
const SERVER_KIND_REMOVE_FILE_NOT_FOUND: u8 = 12;
const SERVER_KIND_READ_LOCK_ACQUIRED: u8 = 13;
const SERVER_KIND_READ_LOCK_DENIED: u8 = 14;
const SERVER_KIND_WRITE_LOCK_ACQUIRED: u8 = 15;
const SERVER_KIND_WRITE_LOCK_DENIED: u8 = 16;
const SERVER_KIND_INTENT_ACQUIRED: u8 = 17;
const SERVER_KIND_INTENT_RELEASED: u8 = 18;

const NO_MODIFIED_AFTER: i64 = -1;

/// Packets written by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientPacket {
    Heartbeat,
    ListFiles {
        path: String,
        modified_after: Option<i64>,
    },
    TransactionBegin {
        write: bool,
    },
    TransactionCommit,
    TransactionAbort,
    SetTransactionStatus {
        status: String,
    },
    ReadFile {
        name: String,
    },
    /// Header plus the full contents; on the wire the data follows as chunks of at
    /// most [`MAX_CHUNK_SIZE`] bytes terminated by an empty chunk.
    WriteFile {
        name: String,
        data: Bytes,
    },
    RemoveFile {
        name: String,
    },
    LockRead {
        key: String,
        start: i64,
        end: i64,
    },
    LockWrite {
        key: String,
        start: i64,
        end: i64,
    },
    AcquireIntent {
        key: String,
        start: i64,
        end: i64,
        immediate: bool,
    },
    ReleaseIntent {
        uid: u64,
        immediate: bool,
    },
    SendNotification {
        key: String,
        start: i64,
        end: i64,
    },
    ListenNotification {
        key: String,
    },
    ListenIntent {
        key: String,
    },
    AcknowledgeNotification {
        ack: u64,
    },
    Close,
}

/// Packets written by the server, both responses and unsolicited events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerPacket {
    Heartbeat,
    NotificationReceived {
        key: String,
        start: i64,
        end: i64,
        /// Zero when the server does not expect an acknowledgement.
        ack: u64,
    },
    IntentHit {
        key: String,
        start: i64,
        end: i64,
    },
    ListResult {
        names: Vec<String>,
    },
    TransactionStarted,
    TransactionComplete,
    TransactionAborted,
    ReadFileData {
        data: Bytes,
    },
    ReadFileEnd,
    ReadFileNotFound,
    WriteFileComplete,
    RemoveFileComplete,
    RemoveFileNotFound,
    ReadLockAcquired,
    ReadLockDenied {
        status: String,
    },
    WriteLockAcquired,
    WriteLockDenied {
        status: String,
    },
    IntentAcquired {
        uid: u64,
    },
    IntentReleased,
}

impl ClientPacket {
    /// Whether the server answers this packet with a response packet.
    pub fn expects_response(&self) -> bool {
        !matches!(
            self,
            ClientPacket::Heartbeat
                | ClientPacket::SetTransactionStatus { .. }
                | ClientPacket::SendNotification { .. }
                | ClientPacket::ListenNotification { .. }
                | ClientPacket::ListenIntent { .. }
                | ClientPacket::AcknowledgeNotification { .. }
                | ClientPacket::Close
        )
    }

    pub fn to_bytes(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::with_capacity(32);
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Appends the packet to `buf`, failing on any string longer than
    /// [`crate::MAX_STRING_LEN`].
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        match self {
            ClientPacket::Heartbeat => buf.put_u8(CLIENT_KIND_HEARTBEAT),
            ClientPacket::ListFiles {
                path,
                modified_after,
            } => {
                buf.put_u8(CLIENT_KIND_LIST_FILES);
                put_string(buf, path)?;
                buf.put_i64_le(modified_after.unwrap_or(NO_MODIFIED_AFTER));
            }
            ClientPacket::TransactionBegin { write } => {
                buf.put_u8(CLIENT_KIND_TRANSACTION_BEGIN);
                put_bool(buf, *write);
            }
            ClientPacket::TransactionCommit => buf.put_u8(CLIENT_KIND_TRANSACTION_COMMIT),
            ClientPacket::TransactionAbort => buf.put_u8(CLIENT_KIND_TRANSACTION_ABORT),
            ClientPacket::SetTransactionStatus { status } => {
                buf.put_u8(CLIENT_KIND_SET_TRANSACTION_STATUS);
                put_string(buf, status)?;
            }
            ClientPacket::ReadFile { name } => {
                buf.put_u8(CLIENT_KIND_READ_FILE);
                put_string(buf, name)?;
            }
            ClientPacket::WriteFile { name, data } => {
                buf.reserve(data.len() + data.len() / MAX_CHUNK_SIZE * 4 + 16);
                buf.put_u8(CLIENT_KIND_WRITE_FILE);
                put_string(buf, name)?;
                buf.put_u64_le(data.len() as u64);
                for chunk in data.chunks(MAX_CHUNK_SIZE) {
                    buf.put_u32_le(chunk.len() as u32);
                    buf.put_slice(chunk);
                }
                buf.put_u32_le(0);
            }
            ClientPacket::RemoveFile { name } => {
                buf.put_u8(CLIENT_KIND_REMOVE_FILE);
                put_string(buf, name)?;
            }
            ClientPacket::LockRead { key, start, end } => {
                buf.put_u8(CLIENT_KIND_LOCK_READ);
                put_range(buf, key, *start, *end)?;
            }
            ClientPacket::LockWrite { key, start, end } => {
                buf.put_u8(CLIENT_KIND_LOCK_WRITE);
                put_range(buf, key, *start, *end)?;
            }
            ClientPacket::AcquireIntent {
                key,
                start,
                end,
                immediate,
            } => {
                buf.put_u8(CLIENT_KIND_ACQUIRE_INTENT);
                put_range(buf, key, *start, *end)?;
                put_bool(buf, *immediate);
            }
            ClientPacket::ReleaseIntent { uid, immediate } => {
                buf.put_u8(CLIENT_KIND_RELEASE_INTENT);
                buf.put_u64_le(*uid);
                put_bool(buf, *immediate);
            }
            ClientPacket::SendNotification { key, start, end } => {
                buf.put_u8(CLIENT_KIND_SEND_NOTIFICATION);
                put_range(buf, key, *start, *end)?;
            }
            ClientPacket::ListenNotification { key } => {
                buf.put_u8(CLIENT_KIND_LISTEN_NOTIFICATION);
                put_string(buf, key)?;
            }
            ClientPacket::ListenIntent { key } => {
                buf.put_u8(CLIENT_KIND_LISTEN_INTENT);
                put_string(buf, key)?;
            }
            ClientPacket::AcknowledgeNotification { ack } => {
                buf.put_u8(CLIENT_KIND_ACKNOWLEDGE_NOTIFICATION);
                buf.put_u64_le(*ack);
            }
            ClientPacket::Close => buf.put_u8(CLIENT_KIND_CLOSE),
        }
        Ok(())
    }

    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, WireError> {
        let kind = read_u8(reader).await?;
        let packet = match kind {
            CLIENT_KIND_HEARTBEAT => ClientPacket::Heartbeat,
            CLIENT_KIND_LIST_FILES => {
                let path = read_string(reader).await?;
                let after = read_i64(reader).await?;
                ClientPacket::ListFiles {
                    path,
                    modified_after: (after != NO_MODIFIED_AFTER).then_some(after),
                }
            }
            CLIENT_KIND_TRANSACTION_BEGIN => ClientPacket::TransactionBegin {
                write: read_bool(reader).await?,
            },
            CLIENT_KIND_TRANSACTION_COMMIT => ClientPacket::TransactionCommit,
            CLIENT_KIND_TRANSACTION_ABORT => ClientPacket::TransactionAbort,
            CLIENT_KIND_SET_TRANSACTION_STATUS => ClientPacket::SetTransactionStatus {
                status: read_string(reader).await?,
            },
            CLIENT_KIND_READ_FILE => ClientPacket::ReadFile {
                name: read_string(reader).await?,
            },
            CLIENT_KIND_WRITE_FILE => {
                let name = read_string(reader).await?;
                let size = read_u64(reader).await? as usize;
                let mut data = BytesMut::with_capacity(size.min(MAX_CHUNK_SIZE * 16));
                loop {
                    let len = read_u32(reader).await? as usize;
                    if len == 0 {
                        break;
                    }
                    if len > MAX_CHUNK_SIZE {
                        return Err(WireError::InvalidData("file chunk too large"));
                    }
                    if data.len() + len > size {
                        return Err(WireError::InvalidData("file data exceeds declared size"));
                    }
                    data.put_slice(&read_blob(reader, len).await?);
                }
                if data.len() != size {
                    return Err(WireError::InvalidData("file data shorter than declared size"));
                }
                ClientPacket::WriteFile {
                    name,
                    data: data.freeze(),
                }
            }
            CLIENT_KIND_REMOVE_FILE => ClientPacket::RemoveFile {
                name: read_string(reader).await?,
            },
            CLIENT_KIND_LOCK_READ => {
                let (key, start, end) = read_range(reader).await?;
                ClientPacket::LockRead { key, start, end }
            }
            CLIENT_KIND_LOCK_WRITE => {
                let (key, start, end) = read_range(reader).await?;
                ClientPacket::LockWrite { key, start, end }
            }
            CLIENT_KIND_ACQUIRE_INTENT => {
                let (key, start, end) = read_range(reader).await?;
                let immediate = read_bool(reader).await?;
                ClientPacket::AcquireIntent {
                    key,
                    start,
                    end,
                    immediate,
                }
            }
            CLIENT_KIND_RELEASE_INTENT => {
                let uid = read_u64(reader).await?;
                let immediate = read_bool(reader).await?;
                ClientPacket::ReleaseIntent { uid, immediate }
            }
            CLIENT_KIND_SEND_NOTIFICATION => {
                let (key, start, end) = read_range(reader).await?;
                ClientPacket::SendNotification { key, start, end }
            }
            CLIENT_KIND_LISTEN_NOTIFICATION => ClientPacket::ListenNotification {
                key: read_string(reader).await?,
            },
            CLIENT_KIND_LISTEN_INTENT => ClientPacket::ListenIntent {
                key: read_string(reader).await?,
            },
            CLIENT_KIND_ACKNOWLEDGE_NOTIFICATION => ClientPacket::AcknowledgeNotification {
                ack: read_u64(reader).await?,
            },
            CLIENT_KIND_CLOSE => ClientPacket::Close,
            other => return Err(WireError::UnknownPacketType(other)),
        };
        Ok(packet)
    }
}

impl ServerPacket {
    pub fn to_bytes(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::with_capacity(32);
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Appends the packet to `buf`, failing on any string longer than
    /// [`crate::MAX_STRING_LEN`].
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        match self {
            ServerPacket::Heartbeat => buf.put_u8(SERVER_KIND_HEARTBEAT),
            ServerPacket::NotificationReceived {
                key,
                start,
                end,
                ack,
            } => {
                buf.put_u8(SERVER_KIND_NOTIFICATION_RECEIVED);
                put_range(buf, key, *start, *end)?;
                buf.put_u64_le(*ack);
            }
            ServerPacket::IntentHit { key, start, end } => {
                buf.put_u8(SERVER_KIND_INTENT_HIT);
                put_range(buf, key, *start, *end)?;
            }
            ServerPacket::ListResult { names } => {
                if names.len() > MAX_LIST_ENTRIES {
                    return Err(WireError::InvalidData("listing too large"));
                }
                buf.put_u8(SERVER_KIND_LIST_RESULT);
                buf.put_u32_le(names.len() as u32);
                for name in names {
                    put_string(buf, name)?;
                }
            }
            ServerPacket::TransactionStarted => buf.put_u8(SERVER_KIND_TRANSACTION_STARTED),
            ServerPacket::TransactionComplete => buf.put_u8(SERVER_KIND_TRANSACTION_COMPLETE),
            ServerPacket::TransactionAborted => buf.put_u8(SERVER_KIND_TRANSACTION_ABORTED),
            ServerPacket::ReadFileData { data } => {
                buf.put_u8(SERVER_KIND_READ_FILE_DATA);
                buf.put_u32_le(data.len() as u32);
                buf.put_slice(data);
            }
            ServerPacket::ReadFileEnd => buf.put_u8(SERVER_KIND_READ_FILE_END),
            ServerPacket::ReadFileNotFound => buf.put_u8(SERVER_KIND_READ_FILE_NOT_FOUND),
            ServerPacket::WriteFileComplete => buf.put_u8(SERVER_KIND_WRITE_FILE_COMPLETE),
            ServerPacket::RemoveFileComplete => buf.put_u8(SERVER_KIND_REMOVE_FILE_COMPLETE),
            ServerPacket::RemoveFileNotFound => buf.put_u8(SERVER_KIND_REMOVE_FILE_NOT_FOUND),
            ServerPacket::ReadLockAcquired => buf.put_u8(SERVER_KIND_READ_LOCK_ACQUIRED),
            ServerPacket::ReadLockDenied { status } => {
                buf.put_u8(SERVER_KIND_READ_LOCK_DENIED);
                put_string(buf, status)?;
            }
            ServerPacket::WriteLockAcquired => buf.put_u8(SERVER_KIND_WRITE_LOCK_ACQUIRED),
            ServerPacket::WriteLockDenied { status } => {
                buf.put_u8(SERVER_KIND_WRITE_LOCK_DENIED);
                put_string(buf, status)?;
            }
            ServerPacket::IntentAcquired { uid } => {
                buf.put_u8(SERVER_KIND_INTENT_ACQUIRED);
                buf.put_u64_le(*uid);
            }
            ServerPacket::IntentReleased => buf.put_u8(SERVER_KIND_INTENT_RELEASED),
        }
        Ok(())
    }

    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, WireError> {
        let kind = read_u8(reader).await?;
        let packet = match kind {
            SERVER_KIND_HEARTBEAT => ServerPacket::Heartbeat,
            SERVER_KIND_NOTIFICATION_RECEIVED => {
                let (key, start, end) = read_range(reader).await?;
                let ack = read_u64(reader).await?;
                ServerPacket::NotificationReceived {
                    key,
                    start,
                    end,
                    ack,
                }
            }
            SERVER_KIND_INTENT_HIT => {
                let (key, start, end) = read_range(reader).await?;
                ServerPacket::IntentHit { key, start, end }
            }
            SERVER_KIND_LIST_RESULT => {
                let count = read_u32(reader).await? as usize;
                if count > MAX_LIST_ENTRIES {
                    return Err(WireError::InvalidData("listing too large"));
                }
                let mut names = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    names.push(read_string(reader).await?);
                }
                ServerPacket::ListResult { names }
            }
            SERVER_KIND_TRANSACTION_STARTED => ServerPacket::TransactionStarted,
            SERVER_KIND_TRANSACTION_COMPLETE => ServerPacket::TransactionComplete,
            SERVER_KIND_TRANSACTION_ABORTED => ServerPacket::TransactionAborted,
            SERVER_KIND_READ_FILE_DATA => {
                let len = read_u32(reader).await? as usize;
                if len > MAX_CHUNK_SIZE {
                    return Err(WireError::InvalidData("file chunk too large"));
                }
                ServerPacket::ReadFileData {
                    data: Bytes::from(read_blob(reader, len).await?),
                }
            }
            SERVER_KIND_READ_FILE_END => ServerPacket::ReadFileEnd,
            SERVER_KIND_READ_FILE_NOT_FOUND => ServerPacket::ReadFileNotFound,
            SERVER_KIND_WRITE_FILE_COMPLETE => ServerPacket::WriteFileComplete,
            SERVER_KIND_REMOVE_FILE_COMPLETE => ServerPacket::RemoveFileComplete,
            SERVER_KIND_REMOVE_FILE_NOT_FOUND => ServerPacket::RemoveFileNotFound,
            SERVER_KIND_READ_LOCK_ACQUIRED => ServerPacket::ReadLockAcquired,
            SERVER_KIND_READ_LOCK_DENIED => ServerPacket::ReadLockDenied {
                status: read_string(reader).await?,
            },
            SERVER_KIND_WRITE_LOCK_ACQUIRED => ServerPacket::WriteLockAcquired,
            SERVER_KIND_WRITE_LOCK_DENIED => ServerPacket::WriteLockDenied {
                status: read_string(reader).await?,
            },
            SERVER_KIND_INTENT_ACQUIRED => ServerPacket::IntentAcquired {
                uid: read_u64(reader).await?,
            },
            SERVER_KIND_INTENT_RELEASED => ServerPacket::IntentReleased,
            other => return Err(WireError::UnknownPacketType(other)),
        };
        Ok(packet)
    }
}
