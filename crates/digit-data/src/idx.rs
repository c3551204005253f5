use std::{
    ffi::OsString,
    fs::File,
    io::{self, BufReader, Read},
    path::{Path, PathBuf},
};

use flate2::read::GzDecoder;

// The third byte is the element type (0x08 = unsigned byte), the fourth the dimension count.
pub const IMAGES_MAGIC: u32 = 0x0000_0803;
pub const LABELS_MAGIC: u32 = 0x0000_0801;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ReadIdxError {
    #[error("neither `{0}` nor its `.gz` variant exist")]
    Missing(PathBuf),
    #[error("could not open idx file")]
    Open(#[source] io::Error),
    #[error("idx stream ended early or could not be read")]
    Read(#[source] io::Error),
    #[error("magic number must be {expected:#010x}, found {found:#010x}")]
    InvalidMagic { expected: u32, found: u32 },
    #[error("label {0} is not a digit")]
    InvalidLabel(u8),
    #[error("header dimensions {0:?} do not fit in memory")]
    TooLarge(Vec<usize>),
}

/// A set of greyscale images stored row-major, one byte per pixel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdxImages {
    pub rows: usize,
    pub columns: usize,
    pixels: Vec<u8>,
}

impl IdxImages {
    pub fn len(&self) -> usize {
        self.pixels.len() / self.image_size().max(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn image_size(&self) -> usize {
        self.rows * self.columns
    }

    pub fn image(&self, index: usize) -> Option<&[u8]> {
        let size = self.image_size();

        self.pixels.get(index * size..(index + 1) * size)
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.pixels.chunks_exact(self.image_size().max(1))
    }

    pub fn read(reader: impl Read) -> Result<Self, ReadIdxError> {
        let mut reader = reader;

        check_magic(&mut reader, IMAGES_MAGIC)?;

        let count = read_u32(&mut reader)? as usize;
        let rows = read_u32(&mut reader)? as usize;
        let columns = read_u32(&mut reader)? as usize;

        let pixels = read_body(&mut reader, &[count, rows, columns])?;

        Ok(Self {
            rows,
            columns,
            pixels,
        })
    }

    pub fn open(path: &Path) -> Result<Self, ReadIdxError> {
        Self::read(open(path)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdxLabels(Vec<u8>);

impl IdxLabels {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn read(reader: impl Read) -> Result<Self, ReadIdxError> {
        let mut reader = reader;

        check_magic(&mut reader, LABELS_MAGIC)?;

        let count = read_u32(&mut reader)? as usize;

        let labels = read_body(&mut reader, &[count])?;

        if let Some(&label) = labels.iter().find(|&&label| label > 9) {
            return Err(ReadIdxError::InvalidLabel(label));
        }

        Ok(Self(labels))
    }

    pub fn open(path: &Path) -> Result<Self, ReadIdxError> {
        Self::read(open(path)?)
    }
}

fn read_u32(reader: &mut impl Read) -> Result<u32, ReadIdxError> {
    let mut buffer = [0; 4];
    reader.read_exact(&mut buffer).map_err(ReadIdxError::Read)?;

    Ok(u32::from_be_bytes(buffer))
}

/// Reads the `dims.product()` bytes following the header.
///
/// Bytes are pulled through `take`, so a count that overstates the file cannot force a large
/// allocation.
fn read_body(reader: &mut impl Read, dims: &[usize]) -> Result<Vec<u8>, ReadIdxError> {
    let length = dims
        .iter()
        .try_fold(1usize, |length, &dim| length.checked_mul(dim))
        .and_then(|length| u64::try_from(length).ok())
        .ok_or_else(|| ReadIdxError::TooLarge(dims.to_vec()))?;

    let mut body = Vec::new();
    reader
        .take(length)
        .read_to_end(&mut body)
        .map_err(ReadIdxError::Read)?;

    if body.len() as u64 == length {
        Ok(body)
    } else {
        Err(ReadIdxError::Read(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("expected {length} bytes after the header, found {}", body.len()),
        )))
    }
}

fn check_magic(reader: &mut impl Read, expected: u32) -> Result<(), ReadIdxError> {
    let found = read_u32(reader)?;

    if found == expected {
        Ok(())
    } else {
        Err(ReadIdxError::InvalidMagic { expected, found })
    }
}

/// Opens `path`, falling back to `path.gz` which is then decompressed on the fly.
fn open(path: &Path) -> Result<Box<dyn Read>, ReadIdxError> {
    if path.exists() {
        let file = File::open(path).map_err(ReadIdxError::Open)?;

        return Ok(Box::new(BufReader::new(file)));
    }

    let mut gz_path = OsString::from(path.as_os_str());
    gz_path.push(".gz");
    let gz_path = PathBuf::from(gz_path);

    if gz_path.exists() {
        tracing::debug!(path = %gz_path.display(), "reading compressed idx file");

        let file = File::open(&gz_path).map_err(ReadIdxError::Open)?;

        Ok(Box::new(GzDecoder::new(BufReader::new(file))))
    } else {
        Err(ReadIdxError::Missing(path.to_path_buf()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{fs, io::Write};

    use flate2::{write::GzEncoder, Compression};
    use test_case::test_case;

    use super::*;

    pub(crate) fn encode_images(rows: u32, columns: u32, images: &[Vec<u8>]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend(IMAGES_MAGIC.to_be_bytes());
        bytes.extend((images.len() as u32).to_be_bytes());
        bytes.extend(rows.to_be_bytes());
        bytes.extend(columns.to_be_bytes());
        images.iter().for_each(|image| bytes.extend(image));
        bytes
    }

    pub(crate) fn encode_labels(labels: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend(LABELS_MAGIC.to_be_bytes());
        bytes.extend((labels.len() as u32).to_be_bytes());
        bytes.extend(labels);
        bytes
    }

    #[test]
    fn reads_images() {
        let bytes = encode_images(2, 3, &[vec![0, 1, 2, 3, 4, 5], vec![9; 6]]);
        let images = IdxImages::read(bytes.as_slice()).unwrap();

        assert_eq!(images.len(), 2);
        assert_eq!((images.rows, images.columns), (2, 3));
        assert_eq!(images.image(0), Some([0, 1, 2, 3, 4, 5].as_slice()));
        assert_eq!(images.image(1), Some([9; 6].as_slice()));
        assert_eq!(images.image(2), None);
    }

    #[test]
    fn reads_labels() {
        let labels = IdxLabels::read(encode_labels(&[7, 2, 1, 0]).as_slice()).unwrap();

        assert_eq!(labels.as_slice(), &[7, 2, 1, 0]);
    }

    #[test_case(encode_labels(&[1, 2]), IMAGES_MAGIC; "labels read as images")]
    #[test_case(vec![0, 0, 8, 3, 0, 0, 0, 0], LABELS_MAGIC; "images read as labels")]
    fn rejects_wrong_magic(bytes: Vec<u8>, expected: u32) {
        let result = if expected == IMAGES_MAGIC {
            IdxImages::read(bytes.as_slice()).map(|_| ())
        } else {
            IdxLabels::read(bytes.as_slice()).map(|_| ())
        };

        assert!(matches!(
            result,
            Err(ReadIdxError::InvalidMagic { expected: e, .. }) if e == expected
        ));
    }

    #[test]
    fn rejects_truncated_images() {
        let mut bytes = encode_images(28, 28, &[vec![0; 784]]);
        bytes.truncate(bytes.len() - 1);

        assert!(matches!(
            IdxImages::read(bytes.as_slice()),
            Err(ReadIdxError::Read(_))
        ));
    }

    #[test]
    fn rejects_header_overstating_count() {
        let mut bytes = encode_images(28, 28, &[vec![0; 784]]);
        bytes[4..8].copy_from_slice(&u32::MAX.to_be_bytes());

        assert!(matches!(
            IdxImages::read(bytes.as_slice()),
            Err(ReadIdxError::Read(error)) if error.kind() == io::ErrorKind::UnexpectedEof
        ));
    }

    #[test]
    fn rejects_labels_overstating_count() {
        let mut bytes = encode_labels(&[1, 2, 3]);
        bytes[4..8].copy_from_slice(&u32::MAX.to_be_bytes());

        assert!(matches!(
            IdxLabels::read(bytes.as_slice()),
            Err(ReadIdxError::Read(_))
        ));
    }

    #[test]
    fn rejects_overflowing_dimensions() {
        assert!(matches!(
            read_body(&mut io::empty(), &[usize::MAX, 2]),
            Err(ReadIdxError::TooLarge(_))
        ));
    }

    #[test]
    fn rejects_non_digit_labels() {
        assert!(matches!(
            IdxLabels::read(encode_labels(&[3, 10]).as_slice()),
            Err(ReadIdxError::InvalidLabel(10))
        ));
    }

    #[test]
    fn opens_gzip_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels-idx1-ubyte");

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&encode_labels(&[4, 5, 6])).unwrap();
        fs::write(dir.path().join("labels-idx1-ubyte.gz"), encoder.finish().unwrap()).unwrap();

        assert_eq!(IdxLabels::open(&path).unwrap().as_slice(), &[4, 5, 6]);
    }

    #[test]
    fn reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();

        assert!(matches!(
            IdxImages::open(&dir.path().join("nothing")),
            Err(ReadIdxError::Missing(_))
        ));
    }
}
