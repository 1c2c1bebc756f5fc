// dbvault/src/processor/compressor.rs
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, ReadBuf};

use super::{Processor, ProcessorType};
use crate::stream::BackupStream;

const INPUT_BUFFER_SIZE: usize = 64 * 1024;

/// zlib compression of the whole backup.
pub struct BackupCompressor {
    level: Compression,
}

impl BackupCompressor {
    pub fn new(level: Compression) -> Self {
        BackupCompressor { level }
    }
}

impl Default for BackupCompressor {
    fn default() -> Self {
        BackupCompressor::new(Compression::default())
    }
}

impl Processor for BackupCompressor {
    fn processor_type(&self) -> ProcessorType {
        ProcessorType::Compressor
    }

    fn precedence(&self) -> u32 {
        10
    }

    fn process(&self, input: BackupStream) -> BackupStream {
        Box::pin(FlateStream::new(input, Compress::new(self.level, true)))
    }

    fn deprocess(&self, input: BackupStream) -> BackupStream {
        Box::pin(FlateStream::new(input, Decompress::new(true)))
    }
}

/// One step of a flate codec: consume from `input`, produce into `output`.
trait Codec {
    /// Returns `(consumed, produced, stream_end)`.
    fn step(&mut self, input: &[u8], output: &mut [u8], finish: bool)
    -> io::Result<(usize, usize, bool)>;
}

impl Codec for Compress {
    fn step(
        &mut self,
        input: &[u8],
        output: &mut [u8],
        finish: bool,
    ) -> io::Result<(usize, usize, bool)> {
        let (before_in, before_out) = (self.total_in(), self.total_out());
        let flush = if finish {
            FlushCompress::Finish
        } else {
            FlushCompress::None
        };
        let status = self.compress(input, output, flush).map_err(io::Error::other)?;
        Ok((
            (self.total_in() - before_in) as usize,
            (self.total_out() - before_out) as usize,
            matches!(status, Status::StreamEnd),
        ))
    }
}

impl Codec for Decompress {
    fn step(
        &mut self,
        input: &[u8],
        output: &mut [u8],
        finish: bool,
    ) -> io::Result<(usize, usize, bool)> {
        let (before_in, before_out) = (self.total_in(), self.total_out());
        let flush = if finish {
            FlushDecompress::Finish
        } else {
            FlushDecompress::None
        };
        let status = self
            .decompress(input, output, flush)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok((
            (self.total_in() - before_in) as usize,
            (self.total_out() - before_out) as usize,
            matches!(status, Status::StreamEnd),
        ))
    }
}

/// Pulls from `inner` on demand and runs the bytes through `codec`.
struct FlateStream<C> {
    inner: BackupStream,
    codec: C,
    input: Box<[u8]>,
    pos: usize,
    len: usize,
    eof: bool,
    done: bool,
}

impl<C> FlateStream<C> {
    fn new(inner: BackupStream, codec: C) -> Self {
        FlateStream {
            inner,
            codec,
            input: vec![0u8; INPUT_BUFFER_SIZE].into_boxed_slice(),
            pos: 0,
            len: 0,
            eof: false,
            done: false,
        }
    }
}

impl<C: Codec + Unpin> AsyncRead for FlateStream<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            if this.done {
                return Poll::Ready(Ok(()));
            }
            if this.pos == this.len && !this.eof {
                let mut read_buf = ReadBuf::new(&mut this.input);
                ready!(this.inner.as_mut().poll_read(cx, &mut read_buf))?;
                let filled = read_buf.filled().len();
                this.pos = 0;
                this.len = filled;
                this.eof = filled == 0;
            }

            let output = buf.initialize_unfilled();
            let (consumed, produced, stream_end) =
                this.codec
                    .step(&this.input[this.pos..this.len], output, this.eof)?;
            this.pos += consumed;
            buf.advance(produced);
            this.done = stream_end;

            if produced > 0 || this.done {
                return Poll::Ready(Ok(()));
            }
            if consumed == 0 && this.eof {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "backup stream ended before the compressed data did",
                )));
            }
            if consumed == 0 && this.pos < this.len {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "codec made no progress on buffered input",
                )));
            }
        }
    }
}
