// dbvault/src/stream.rs
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::sync::CancellationToken;

/// Byte stream of a backup flowing between the database tool, processors and
/// storage. Dropping it closes whatever it wraps.
pub type BackupStream = Pin<Box<dyn AsyncRead + Send>>;

/// Fails reads once its token is cancelled, so a copy loop blocked on a
/// backup stream notices that its task was cancelled.
pub struct CancellableStream<R> {
    inner: R,
    token: CancellationToken,
}

impl<R> CancellableStream<R> {
    pub fn new(inner: R, token: CancellationToken) -> Self {
        CancellableStream { inner, token }
    }
}

impl CancellableStream<BackupStream> {
    pub fn boxed(inner: BackupStream, token: CancellationToken) -> BackupStream {
        Box::pin(CancellableStream::new(inner, token))
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CancellableStream<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.token.is_cancelled() {
            return Poll::Ready(Err(io::Error::other("backup stream cancelled")));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_reads_pass_through_until_cancelled() -> anyhow::Result<()> {
        let token = CancellationToken::new();
        let inner: BackupStream = Box::pin(&b"hello world"[..]);
        let mut stream = CancellableStream::boxed(inner, token.clone());

        let mut first = [0u8; 5];
        stream.read_exact(&mut first).await?;
        assert_eq!(&first, b"hello");

        token.cancel();
        let mut rest = Vec::new();
        assert!(stream.read_to_end(&mut rest).await.is_err());
        Ok(())
    }
}
