//! Line-at-a-time copying from a child's output pipe.
//!
//! A unit is everything up to and including the next `\n`, or the whole
//! buffered input when no newline has arrived yet. Callers that swap the
//! destination between units only do so when [`StreamCopier::at_line_boundary`]
//! holds, so a line never straddles two files.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_stream::StreamExt;
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, FramedRead};

const READ_CAPACITY: usize = 4096;

/// Splits raw bytes into newline-terminated units
#[derive(Debug, Default, Clone, Copy)]
pub struct ChunkCodec;

impl Decoder for ChunkCodec {
    type Item = Bytes;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        match src.iter().position(|b| *b == b'\n') {
            Some(index) => Ok(Some(src.split_to(index + 1).freeze())),
            None => Ok(Some(src.split().freeze())),
        }
    }
}

/// Copies a readable stream to a replaceable destination one unit at a time
pub struct StreamCopier<R> {
    frames: FramedRead<R, ChunkCodec>,
    at_boundary: bool,
    total: u64,
}

impl<R: AsyncRead + Unpin> StreamCopier<R> {
    pub fn new(reader: R) -> Self {
        Self {
            frames: FramedRead::with_capacity(reader, ChunkCodec, READ_CAPACITY),
            at_boundary: true,
            total: 0,
        }
    }

    /// Read the next unit; `None` at end of stream
    pub async fn next_unit(&mut self) -> std::io::Result<Option<Bytes>> {
        match self.frames.next().await {
            Some(Ok(unit)) => {
                self.at_boundary = unit.last() == Some(&b'\n');
                self.total += unit.len() as u64;
                Ok(Some(unit))
            }
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// Whether the last unit ended a line (true before anything was read)
    pub fn at_line_boundary(&self) -> bool {
        self.at_boundary
    }

    /// Bytes read from the source so far
    pub fn total_bytes(&self) -> u64 {
        self.total
    }

    /// Copy one unit to `dest` and flush it. Returns 0 exactly at end of stream.
    pub async fn copy_to<W: AsyncWrite + Unpin>(&mut self, dest: &mut W) -> std::io::Result<usize> {
        match self.next_unit().await? {
            Some(unit) => {
                write_unit(dest, &unit).await?;
                Ok(unit.len())
            }
            None => Ok(0),
        }
    }

    /// Copy everything until end of stream
    pub async fn drain_to<W: AsyncWrite + Unpin>(&mut self, dest: &mut W) -> std::io::Result<u64> {
        let mut written = 0u64;
        loop {
            let n = self.copy_to(dest).await?;
            if n == 0 {
                return Ok(written);
            }
            written += n as u64;
        }
    }
}

/// Write one unit and flush so a crash loses at most a partial line
pub async fn write_unit<W: AsyncWrite + Unpin>(dest: &mut W, unit: &[u8]) -> std::io::Result<()> {
    dest.write_all(unit).await?;
    dest.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_splits_on_newline() {
        let mut codec = ChunkCodec;
        let mut buf = BytesMut::from(&b"one\ntwo\nthr"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Bytes::from_static(b"one\n"));
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Bytes::from_static(b"two\n"));
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Bytes::from_static(b"thr"));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_copy_returns_zero_at_eof() {
        let input: &[u8] = b"alpha\nbeta\n";
        let mut copier = StreamCopier::new(input);
        let mut out = Vec::new();

        assert_eq!(copier.copy_to(&mut out).await.unwrap(), 6);
        assert!(copier.at_line_boundary());
        assert_eq!(copier.copy_to(&mut out).await.unwrap(), 5);
        assert_eq!(copier.copy_to(&mut out).await.unwrap(), 0);
        assert_eq!(out, input);
        assert_eq!(copier.total_bytes(), 11);
    }

    #[tokio::test]
    async fn test_destination_can_be_swapped_between_units() {
        let input: &[u8] = b"first\nsecond\nthird\n";
        let mut copier = StreamCopier::new(input);
        let mut files: Vec<Vec<u8>> = vec![Vec::new()];

        loop {
            let dest = files.last_mut().unwrap();
            if copier.copy_to(dest).await.unwrap() == 0 {
                break;
            }
            if copier.at_line_boundary() {
                files.push(Vec::new());
            }
        }

        assert_eq!(files[0], b"first\n");
        assert_eq!(files[1], b"second\n");
        assert_eq!(files[2], b"third\n");
        assert_eq!(files.concat(), input);
    }

    #[tokio::test]
    async fn test_partial_line_is_not_a_boundary() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let mut copier = StreamCopier::new(reader);

        writer.write_all(b"no newline yet").await.unwrap();
        let unit = copier.next_unit().await.unwrap().unwrap();
        assert_eq!(&unit[..], b"no newline yet");
        assert!(!copier.at_line_boundary());

        writer.write_all(b" done\n").await.unwrap();
        drop(writer);
        let unit = copier.next_unit().await.unwrap().unwrap();
        assert_eq!(&unit[..], b" done\n");
        assert!(copier.at_line_boundary());
        assert!(copier.next_unit().await.unwrap().is_none());
    }
}
