use std::io::{self, Read, Write};

/// Streaming compressor. `finish` must be called to flush the trailing
/// frame; dropping an unfinished encoder loses data.
pub trait Encoder: Write {
    fn finish(self: Box<Self>) -> io::Result<()>;
}

/// A pluggable pair of streaming byte transformers.
///
/// The engine only requires `decode(encode(x)) == x` and that both
/// directions wrap an existing sink/source. Implementations are held by
/// the blob as factories; the produced streams live for one operation.
pub trait Codec: Send + Sync {
    fn encoder<'a>(&self, dst: Box<dyn Write + 'a>) -> io::Result<Box<dyn Encoder + 'a>>;
    fn decoder<'a>(&self, src: Box<dyn Read + 'a>) -> io::Result<Box<dyn Read + 'a>>;
}

impl<W: Write> Encoder for zstd::stream::write::Encoder<'_, W> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        (*self).finish().map(|_| ())
    }
}

/// zstd-backed codec.
#[derive(Debug, Clone)]
pub struct ZstdCodec {
    level: i32,
}

impl ZstdCodec {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Default for ZstdCodec {
    fn default() -> Self {
        Self { level: 3 }
    }
}

impl Codec for ZstdCodec {
    fn encoder<'a>(&self, dst: Box<dyn Write + 'a>) -> io::Result<Box<dyn Encoder + 'a>> {
        Ok(Box::new(zstd::stream::write::Encoder::new(dst, self.level)?))
    }

    fn decoder<'a>(&self, src: Box<dyn Read + 'a>) -> io::Result<Box<dyn Read + 'a>> {
        Ok(Box::new(zstd::stream::read::Decoder::new(src)?))
    }
}
