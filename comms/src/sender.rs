use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{LEN_TYPE_SIZE, LenType, Serialize};

/// Writes frames to a peer rank.
///
/// The length prefix and message header are staged in a reused buffer; a
/// gradient body is written straight from the caller's slice.
pub struct FrameSender<W: AsyncWrite + Unpin> {
    tx: W,
    head: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> FrameSender<W> {
    pub(super) fn new(tx: W) -> Self {
        Self { tx, head: Vec::new() }
    }

    /// Writes `msg` as one frame and flushes the connection.
    pub async fn send<'a, T: Serialize<'a>>(&mut self, msg: &'a T) -> io::Result<()> {
        self.head.clear();
        self.head.resize(LEN_TYPE_SIZE, 0);

        let body = msg.serialize(&mut self.head)?;
        let body_len = body.map_or(0, <[u8]>::len);
        let len = (self.head.len() - LEN_TYPE_SIZE + body_len) as LenType;
        self.head[..LEN_TYPE_SIZE].copy_from_slice(&len.to_be_bytes());

        self.tx.write_all(&self.head).await?;
        if let Some(body) = body {
            self.tx.write_all(body).await?;
        }

        self.tx.flush().await
    }
}
