use std::io::{self, Read, Write};

use serde::{de::DeserializeOwned, Serialize};

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ContainerError {
    #[error("magic must be {expected:?}, found {found:?}")]
    InvalidMagic { expected: [u8; 4], found: [u8; 4] },
    #[error("format version {0} is not supported")]
    UnsupportedVersion(u32),
    #[error("container is truncated")]
    Truncated,
    #[error("manifest of {0} bytes does not fit a 32 bit length")]
    ManifestTooLarge(usize),
    #[error("manifest is malformed")]
    Manifest(#[source] serde_json::Error),
    #[error("container could not be read or written")]
    Io(#[source] io::Error),
}

impl From<io::Error> for ContainerError {
    fn from(error: io::Error) -> Self {
        if error.kind() == io::ErrorKind::UnexpectedEof {
            Self::Truncated
        } else {
            Self::Io(error)
        }
    }
}

/// A JSON manifest followed by an opaque payload.
///
/// Layout: `magic | version: u32 | manifest length: u32 | manifest | payload length: u64 | payload`,
/// integers little-endian.
#[derive(Debug, Clone, PartialEq)]
pub struct Container<M> {
    pub manifest: M,
    pub payload: Vec<u8>,
}

impl<M: Serialize + DeserializeOwned> Container<M> {
    pub fn write(&self, magic: [u8; 4], mut writer: impl Write) -> Result<(), ContainerError> {
        let manifest = serde_json::to_vec(&self.manifest).map_err(ContainerError::Manifest)?;
        let length = manifest_length(manifest.len())?;

        writer.write_all(&magic)?;
        writer.write_all(&FORMAT_VERSION.to_le_bytes())?;
        writer.write_all(&length.to_le_bytes())?;
        writer.write_all(&manifest)?;
        writer.write_all(&(self.payload.len() as u64).to_le_bytes())?;
        writer.write_all(&self.payload)?;

        Ok(writer.flush()?)
    }

    pub fn read(magic: [u8; 4], mut reader: impl Read) -> Result<Self, ContainerError> {
        let mut found = [0; 4];
        reader.read_exact(&mut found)?;

        if found != magic {
            return Err(ContainerError::InvalidMagic {
                expected: magic,
                found,
            });
        }

        let mut word = [0; 4];
        reader.read_exact(&mut word)?;
        let version = u32::from_le_bytes(word);

        if version != FORMAT_VERSION {
            return Err(ContainerError::UnsupportedVersion(version));
        }

        reader.read_exact(&mut word)?;
        let manifest = read_section(&mut reader, u32::from_le_bytes(word) as u64)?;
        let manifest = serde_json::from_slice(&manifest).map_err(ContainerError::Manifest)?;

        let mut long_word = [0; 8];
        reader.read_exact(&mut long_word)?;
        let payload = read_section(&mut reader, u64::from_le_bytes(long_word))?;

        Ok(Self { manifest, payload })
    }
}

fn manifest_length(length: usize) -> Result<u32, ContainerError> {
    u32::try_from(length).map_err(|_| ContainerError::ManifestTooLarge(length))
}

// Reads through `take` so a corrupt length cannot make us allocate it up front.
fn read_section(reader: &mut impl Read, length: u64) -> Result<Vec<u8>, ContainerError> {
    let mut section = Vec::new();
    reader.take(length).read_to_end(&mut section)?;

    if section.len() as u64 == length {
        Ok(section)
    } else {
        Err(ContainerError::Truncated)
    }
}
