// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{self, Write};

use flate2::{Compression, write::GzEncoder};
use liblzma::write::XzEncoder;
use serde::{Deserialize, Serialize};

/// Compressor for the new-data payload of full installs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressedFormat {
    None,
    Gzip,
    #[default]
    Xz,
}

impl CompressedFormat {
    /// Suffix appended to the uncompressed file name.
    pub fn extension(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Gzip => ".gz",
            Self::Xz => ".xz",
        }
    }
}

pub enum CompressedWriter<W: Write> {
    None(W),
    Gzip(GzEncoder<W>),
    Xz(XzEncoder<W>),
}

impl<W: Write> CompressedWriter<W> {
    /// Create a writer that compresses at a fixed quality `level`. The level is
    /// clamped to the range supported by each format.
    pub fn new(writer: W, format: CompressedFormat, level: u32) -> Self {
        match format {
            CompressedFormat::None => Self::None(writer),
            CompressedFormat::Gzip => Self::Gzip(GzEncoder::new(
                writer,
                Compression::new(level.min(9)),
            )),
            CompressedFormat::Xz => Self::Xz(XzEncoder::new(writer, level.min(9))),
        }
    }

    pub fn finish(self) -> io::Result<W> {
        match self {
            Self::None(w) => Ok(w),
            Self::Gzip(w) => w.finish(),
            Self::Xz(w) => w.finish(),
        }
    }
}

impl<W: Write> Write for CompressedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::None(w) => w.write(buf),
            Self::Gzip(w) => w.write(buf),
            Self::Xz(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::None(w) => w.flush(),
            Self::Gzip(w) => w.flush(),
            Self::Xz(w) => w.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::GzDecoder;
    use liblzma::read::XzDecoder;

    use super::*;

    fn compress(format: CompressedFormat, data: &[u8]) -> Vec<u8> {
        let mut writer = CompressedWriter::new(Vec::new(), format, 6);
        writer.write_all(data).unwrap();
        writer.finish().unwrap()
    }

    #[test]
    fn compressors_are_readable() {
        let data = b"hello world ".repeat(1000);

        assert_eq!(compress(CompressedFormat::None, &data), data);

        let mut buf = vec![];
        GzDecoder::new(&compress(CompressedFormat::Gzip, &data)[..])
            .read_to_end(&mut buf)
            .unwrap();
        assert_eq!(buf, data);

        let mut buf = vec![];
        XzDecoder::new(&compress(CompressedFormat::Xz, &data)[..])
            .read_to_end(&mut buf)
            .unwrap();
        assert_eq!(buf, data);
    }
}
