//! The MNIST subset container.
//!
//! Layout (little-endian):
//!
//! ```text
//! "MNST" | version: u32 = 1 | image_size: u32 | train: u32 | test: u32
//! train images: f32 * image_size * train
//! train labels: u8 * train
//! test images:  f32 * image_size * test
//! test labels:  u8 * test
//! ```
//!
//! The file size must match the header exactly.

pub mod idx;

use std::fs;
use std::path::Path;

use log::info;

use crate::errors::{DatasetError, DatasetResult};

pub const MAGIC: &[u8; 4] = b"MNST";
pub const VERSION: u32 = 1;
pub const HEADER_BYTES: usize = 20;
pub const NUM_CLASSES: u8 = 10;

/// Which half of the dataset a sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "test",
        }
    }
}

impl std::fmt::Display for Split {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Train and test samples loaded from a container. Immutable after load.
#[derive(Debug, Clone, PartialEq)]
pub struct MnistSubset {
    image_size: usize,
    train_images: Vec<f32>,
    train_labels: Vec<u8>,
    test_images: Vec<f32>,
    test_labels: Vec<u8>,
}

fn invalid(reason: impl Into<String>) -> DatasetError {
    DatasetError::InvalidFormat {
        reason: reason.into(),
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Splits payload sections off the front of the container.
struct Sections<'a> {
    rest: &'a [u8],
}

impl<'a> Sections<'a> {
    fn take(&mut self, len: usize) -> &'a [u8] {
        let (head, tail) = self.rest.split_at(len);
        self.rest = tail;
        head
    }

    fn floats(&mut self, count: usize) -> Vec<f32> {
        self.take(count * 4)
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

impl MnistSubset {
    /// Builds a dataset from in-memory samples, validating shapes and labels.
    pub fn new(
        image_size: usize,
        train_images: Vec<f32>,
        train_labels: Vec<u8>,
        test_images: Vec<f32>,
        test_labels: Vec<u8>,
    ) -> DatasetResult<Self> {
        for (split, images, labels) in [
            (Split::Train, &train_images, &train_labels),
            (Split::Test, &test_images, &test_labels),
        ] {
            if images.len() != image_size * labels.len() {
                return Err(invalid(format!(
                    "{split} split has {} pixels for {} labels of {image_size} pixels",
                    images.len(),
                    labels.len()
                )));
            }
            check_labels(split, labels)?;
        }

        Ok(Self {
            image_size,
            train_images,
            train_labels,
            test_images,
            test_labels,
        })
    }

    /// Parses a container held in memory.
    pub fn from_bytes(bytes: &[u8]) -> DatasetResult<Self> {
        if bytes.len() < HEADER_BYTES {
            return Err(invalid(format!(
                "file is {} bytes, shorter than the {HEADER_BYTES} byte header",
                bytes.len()
            )));
        }
        if &bytes[..4] != MAGIC {
            return Err(invalid(format!(
                "bad magic {:?}, expected \"MNST\"",
                String::from_utf8_lossy(&bytes[..4])
            )));
        }
        let version = read_u32(bytes, 4);
        if version != VERSION {
            return Err(invalid(format!(
                "unsupported version {version}, expected {VERSION}"
            )));
        }

        let image_size = read_u32(bytes, 8) as usize;
        let train_count = read_u32(bytes, 12) as usize;
        let test_count = read_u32(bytes, 16) as usize;

        let expected = payload_bytes(image_size, train_count)
            .and_then(|train| Some((train, payload_bytes(image_size, test_count)?)))
            .and_then(|(train, test)| train.checked_add(test)?.checked_add(HEADER_BYTES))
            .ok_or_else(|| invalid("header counts overflow"))?;
        if bytes.len() != expected {
            return Err(invalid(format!(
                "file is {} bytes, header describes {expected}",
                bytes.len()
            )));
        }

        let mut sections = Sections {
            rest: &bytes[HEADER_BYTES..],
        };
        let train_images = sections.floats(image_size * train_count);
        let train_labels = sections.take(train_count).to_vec();
        let test_images = sections.floats(image_size * test_count);
        let test_labels = sections.take(test_count).to_vec();

        Self::new(
            image_size,
            train_images,
            train_labels,
            test_images,
            test_labels,
        )
    }

    /// Loads a container file.
    pub fn load(path: impl AsRef<Path>) -> DatasetResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|source| DatasetError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let dataset = Self::from_bytes(&bytes)?;
        info!(
            "loaded {}: {} train, {} test, {} pixels per image",
            path.display(),
            dataset.train_count(),
            dataset.test_count(),
            dataset.image_size
        );
        Ok(dataset)
    }

    /// Serializes the dataset into the container format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            HEADER_BYTES
                + (self.train_images.len() + self.test_images.len()) * 4
                + self.train_labels.len()
                + self.test_labels.len(),
        );
        out.extend_from_slice(MAGIC);
        for value in [
            VERSION,
            self.image_size as u32,
            self.train_count() as u32,
            self.test_count() as u32,
        ] {
            out.extend_from_slice(&value.to_le_bytes());
        }
        for (images, labels) in [
            (&self.train_images, &self.train_labels),
            (&self.test_images, &self.test_labels),
        ] {
            images
                .iter()
                .for_each(|v| out.extend_from_slice(&v.to_le_bytes()));
            out.extend_from_slice(labels);
        }
        out
    }

    /// Writes the container, creating parent directories as needed.
    pub fn save(&self, path: impl AsRef<Path>) -> DatasetResult<()> {
        let path = path.as_ref();
        let io_err = |source| DatasetError::Io {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        fs::write(path, self.to_bytes()).map_err(io_err)
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    pub fn train_count(&self) -> usize {
        self.train_labels.len()
    }

    pub fn test_count(&self) -> usize {
        self.test_labels.len()
    }

    pub fn count(&self, split: Split) -> usize {
        match split {
            Split::Train => self.train_count(),
            Split::Test => self.test_count(),
        }
    }

    /// Image and label of one sample.
    pub fn sample(&self, split: Split, index: usize) -> DatasetResult<(&[f32], u8)> {
        let (images, labels) = match split {
            Split::Train => (&self.train_images, &self.train_labels),
            Split::Test => (&self.test_images, &self.test_labels),
        };
        let label = *labels
            .get(index)
            .ok_or_else(|| DatasetError::IndexOutOfBounds {
                split: split.to_string(),
                index,
                count: labels.len(),
            })?;
        let start = index * self.image_size;
        Ok((&images[start..start + self.image_size], label))
    }

    pub fn train_sample(&self, index: usize) -> DatasetResult<(&[f32], u8)> {
        self.sample(Split::Train, index)
    }

    pub fn test_sample(&self, index: usize) -> DatasetResult<(&[f32], u8)> {
        self.sample(Split::Test, index)
    }
}

fn payload_bytes(image_size: usize, count: usize) -> Option<usize> {
    image_size.checked_mul(count)?.checked_mul(4)?.checked_add(count)
}

fn check_labels(split: Split, labels: &[u8]) -> DatasetResult<()> {
    match labels.iter().position(|label| *label >= NUM_CLASSES) {
        Some(index) => Err(DatasetError::LabelOutOfRange {
            split: split.to_string(),
            index,
            label: labels[index],
            num_classes: NUM_CLASSES,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> MnistSubset {
        MnistSubset::new(
            2,
            vec![0.0, 0.5, 1.0, 0.25],
            vec![3, 9],
            vec![0.75, 0.125],
            vec![0],
        )
        .unwrap()
    }

    #[test]
    fn test_container_size_identity() {
        let bytes = tiny().to_bytes();
        // header + train (2 * 2 * 4 + 2) + test (1 * 2 * 4 + 1)
        assert_eq!(bytes.len(), HEADER_BYTES + 18 + 9);
        assert_eq!(MnistSubset::from_bytes(&bytes).unwrap(), tiny());
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = tiny().to_bytes();
        bytes[..4].copy_from_slice(b"XXXX");
        let err = MnistSubset::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, DatasetError::InvalidFormat { reason } if reason.contains("XXXX")));
    }

    #[test]
    fn test_bad_version() {
        let mut bytes = tiny().to_bytes();
        bytes[4..8].copy_from_slice(&2u32.to_le_bytes());
        assert!(matches!(
            MnistSubset::from_bytes(&bytes),
            Err(DatasetError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn test_size_mismatch() {
        let mut bytes = tiny().to_bytes();
        bytes.push(0);
        assert!(MnistSubset::from_bytes(&bytes).is_err());
        bytes.truncate(bytes.len() - 2);
        assert!(MnistSubset::from_bytes(&bytes).is_err());
        assert!(MnistSubset::from_bytes(&bytes[..12]).is_err());
    }

    #[test]
    fn test_overflowing_header() {
        let mut bytes = tiny().to_bytes();
        bytes[8..12].copy_from_slice(&u32::MAX.to_le_bytes());
        bytes[12..16].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            MnistSubset::from_bytes(&bytes),
            Err(DatasetError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn test_label_out_of_range() {
        let mut bytes = tiny().to_bytes();
        // first train label follows the four train pixels
        bytes[HEADER_BYTES + 16] = 10;
        assert!(matches!(
            MnistSubset::from_bytes(&bytes),
            Err(DatasetError::LabelOutOfRange { index: 0, label: 10, .. })
        ));
    }

    #[test]
    fn test_sample_access() {
        let dataset = tiny();
        assert_eq!(dataset.train_sample(1).unwrap(), (&[1.0, 0.25][..], 9));
        assert_eq!(dataset.test_sample(0).unwrap(), (&[0.75, 0.125][..], 0));
        assert!(matches!(
            dataset.test_sample(1),
            Err(DatasetError::IndexOutOfBounds { index: 1, count: 1, .. })
        ));
    }
}
