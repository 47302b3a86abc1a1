use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Align4, Deserialize, LEN_TYPE_SIZE, LenType};

/// Reads frames sent by a peer rank.
pub struct FrameReceiver<R: AsyncRead + Unpin> {
    rx: R,
}

impl<R: AsyncRead + Unpin> FrameReceiver<R> {
    pub(super) fn new(rx: R) -> Self {
        Self { rx }
    }

    /// Reads the next frame into `buf` and decodes it.
    ///
    /// `buf` is resized to hold the frame and is reused between calls, so a
    /// rank exchanging gradients every step allocates only once. The decoded
    /// message borrows from it.
    ///
    /// # Errors
    /// Fails on a closed connection or a frame that does not decode.
    pub async fn recv_into<'buf, T, B>(&mut self, buf: &'buf mut Vec<B>) -> io::Result<T>
    where
        T: Deserialize<'buf>,
        B: Align4,
    {
        let mut len_bytes = [0; LEN_TYPE_SIZE];
        self.rx.read_exact(&mut len_bytes).await?;
        let len = LenType::from_be_bytes(len_bytes) as usize;

        buf.clear();
        buf.resize(len.div_ceil(size_of::<B>()), B::zeroed());

        let frame = &mut bytemuck::cast_slice_mut::<B, u8>(buf.as_mut_slice())[..len];
        self.rx.read_exact(frame).await?;

        T::deserialize(frame)
    }
}
