//! Frame constants and encode/decode for the binary subscription protocol.
//!
//! Every frame is big-endian, fixed-width, with no length prefixes. Fixed
//! string fields are NUL-padded on write and NUL-trimmed on read (first NUL
//! marks end-of-string); encoding a value longer than its field truncates,
//! never overflows.

use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use taskqueue_core::domain::Task;

pub const SIZE_QUEUE_NAME: usize = 256;
pub const SIZE_TASK_ID: usize = 16;
pub const SIZE_TASK_PAYLOAD: usize = 1024;
pub const SIZE_TASK_CREATED_AT: usize = 19;

/// Inbound (client -> server) message type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InType {
    QueueSubscribe = 1,
    TaskAck = 2,
    TaskNack = 3,
    /// Supplemental: graceful client-initiated close, absent from the
    /// distilled request-type table but present upstream.
    ConnClose = 4,
}

impl InType {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::QueueSubscribe),
            2 => Some(Self::TaskAck),
            3 => Some(Self::TaskNack),
            4 => Some(Self::ConnClose),
            _ => None,
        }
    }
}

/// Outbound (server -> client) message type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OutType {
    QueueSubscribePass = 1,
    QueueSubscribeFail = 2,
    TaskAckPass = 3,
    TaskAckFail = 4,
    TaskNackPass = 5,
    TaskNackFail = 6,
    TaskProcess = 7,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("connection closed")]
    Eof,

    #[error("unknown message type: {0}")]
    UnknownType(u8),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A decoded inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    QueueSubscribe { queue_name: String },
    TaskAck { task_id: Uuid },
    TaskNack { task_id: Uuid },
    ConnClose,
}

/// An outbound response or notification frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    QueueSubscribePass,
    QueueSubscribeFail,
    TaskAckPass,
    TaskAckFail,
    TaskNackPass,
    TaskNackFail,
    TaskProcess {
        task_id: Uuid,
        payload: String,
        created_at: DateTime<Utc>,
    },
}

impl Response {
    /// Builds the `TaskProcess` notification for a freshly leased task.
    /// `task.id`/`task.created_at` are always present on a leased task.
    pub fn task_process(task: &Task) -> Self {
        Self::TaskProcess {
            task_id: task.id.expect("leased task has an id"),
            payload: task.payload.clone(),
            created_at: task.created_at.expect("leased task has created_at"),
        }
    }
}

fn pad_bytes(s: &str, width: usize) -> Vec<u8> {
    let mut buf = vec![0u8; width];
    let bytes = s.as_bytes();
    let n = bytes.len().min(width);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

fn trim_nul(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Reads one request frame from `r`. Returns `FrameError::Eof` on a clean
/// close before any bytes are read; any other short read is a framing
/// error and should terminate the session.
pub async fn read_request<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<Request, FrameError> {
    let msg_type = match r.read_u8().await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(FrameError::Eof),
        Err(e) => return Err(e.into()),
    };

    match InType::from_u8(msg_type) {
        Some(InType::QueueSubscribe) => {
            let mut buf = [0u8; SIZE_QUEUE_NAME];
            r.read_exact(&mut buf).await?;
            Ok(Request::QueueSubscribe {
                queue_name: trim_nul(&buf),
            })
        }
        Some(InType::TaskAck) => Ok(Request::TaskAck {
            task_id: read_task_id(r).await?,
        }),
        Some(InType::TaskNack) => Ok(Request::TaskNack {
            task_id: read_task_id(r).await?,
        }),
        Some(InType::ConnClose) => Ok(Request::ConnClose),
        None => Err(FrameError::UnknownType(msg_type)),
    }
}

async fn read_task_id<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<Uuid, FrameError> {
    let mut buf = [0u8; SIZE_TASK_ID];
    r.read_exact(&mut buf).await?;
    Ok(Uuid::from_bytes(buf))
}

/// Writes one response frame to `w`.
pub async fn write_response<W: AsyncWriteExt + Unpin>(w: &mut W, resp: &Response) -> Result<(), FrameError> {
    match resp {
        Response::QueueSubscribePass => w.write_u8(OutType::QueueSubscribePass as u8).await?,
        Response::QueueSubscribeFail => w.write_u8(OutType::QueueSubscribeFail as u8).await?,
        Response::TaskAckPass => w.write_u8(OutType::TaskAckPass as u8).await?,
        Response::TaskAckFail => w.write_u8(OutType::TaskAckFail as u8).await?,
        Response::TaskNackPass => w.write_u8(OutType::TaskNackPass as u8).await?,
        Response::TaskNackFail => w.write_u8(OutType::TaskNackFail as u8).await?,
        Response::TaskProcess {
            task_id,
            payload,
            created_at,
        } => {
            w.write_u8(OutType::TaskProcess as u8).await?;
            w.write_all(task_id.as_bytes()).await?;
            w.write_all(&pad_bytes(payload, SIZE_TASK_PAYLOAD)).await?;
            let formatted = created_at.format("%Y-%m-%d %H:%M:%S").to_string();
            w.write_all(&pad_bytes(&formatted, SIZE_TASK_CREATED_AT)).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use std::io::Cursor;

    #[tokio::test]
    async fn subscribe_round_trips() {
        let mut buf = Vec::new();
        buf.push(InType::QueueSubscribe as u8);
        buf.extend_from_slice(&pad_bytes("orders", SIZE_QUEUE_NAME));

        let mut cursor = Cursor::new(buf);
        let req = read_request(&mut cursor).await.unwrap();
        assert_eq!(
            req,
            Request::QueueSubscribe {
                queue_name: "orders".to_string()
            }
        );
    }

    #[tokio::test]
    async fn task_ack_round_trips() {
        let id = Uuid::new_v4();
        let mut buf = Vec::new();
        buf.push(InType::TaskAck as u8);
        buf.extend_from_slice(id.as_bytes());

        let mut cursor = Cursor::new(buf);
        let req = read_request(&mut cursor).await.unwrap();
        assert_eq!(req, Request::TaskAck { task_id: id });
    }

    #[tokio::test]
    async fn conn_close_has_no_payload() {
        let buf = vec![InType::ConnClose as u8];
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_request(&mut cursor).await.unwrap(), Request::ConnClose);
    }

    #[tokio::test]
    async fn unknown_type_is_an_error() {
        let mut cursor = Cursor::new(vec![99u8]);
        assert!(matches!(
            read_request(&mut cursor).await,
            Err(FrameError::UnknownType(99))
        ));
    }

    #[tokio::test]
    async fn empty_stream_is_eof_not_an_error() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        assert!(matches!(read_request(&mut cursor).await, Err(FrameError::Eof)));
    }

    #[tokio::test]
    async fn queue_name_longer_than_field_truncates_never_overflows() {
        let long_name = "q".repeat(SIZE_QUEUE_NAME + 50);
        let padded = pad_bytes(&long_name, SIZE_QUEUE_NAME);
        assert_eq!(padded.len(), SIZE_QUEUE_NAME);

        let mut buf = vec![InType::QueueSubscribe as u8];
        buf.extend_from_slice(&padded);
        let mut cursor = Cursor::new(buf);

        let req = read_request(&mut cursor).await.unwrap();
        match req {
            Request::QueueSubscribe { queue_name } => assert_eq!(queue_name.len(), SIZE_QUEUE_NAME),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn task_process_round_trips_through_write_and_read_buffers() {
        let id = Uuid::new_v4();
        let created_at = Utc::now().with_nanosecond(0).unwrap();
        let resp = Response::TaskProcess {
            task_id: id,
            payload: "hello".to_string(),
            created_at,
        };

        let mut out = Vec::new();
        write_response(&mut out, &resp).await.unwrap();

        assert_eq!(out[0], OutType::TaskProcess as u8);
        assert_eq!(&out[1..1 + SIZE_TASK_ID], id.as_bytes());
    }
}
