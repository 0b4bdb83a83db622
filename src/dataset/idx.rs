//! Reading the upstream MNIST IDX files and cutting a subset container.
//!
//! IDX files are big-endian: a magic number (2051 for images, 2049 for
//! labels), the item count, and for images the row and column counts,
//! followed by raw `u8` data. Files may be gzip-compressed.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use log::info;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index;

use super::MnistSubset;
use crate::errors::{DatasetError, DatasetResult};

pub const IMAGE_MAGIC: u32 = 2051;
pub const LABEL_MAGIC: u32 = 2049;

pub const TRAIN_IMAGES: &str = "train-images-idx3-ubyte";
pub const TRAIN_LABELS: &str = "train-labels-idx1-ubyte";
pub const TEST_IMAGES: &str = "t10k-images-idx3-ubyte";
pub const TEST_LABELS: &str = "t10k-labels-idx1-ubyte";

/// Images from an IDX image file, one row of `rows * cols` bytes each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdxImages {
    pub count: usize,
    pub rows: usize,
    pub cols: usize,
    pub pixels: Vec<u8>,
}

impl IdxImages {
    pub fn image_size(&self) -> usize {
        self.rows * self.cols
    }

    pub fn image(&self, index: usize) -> &[u8] {
        let size = self.image_size();
        &self.pixels[index * size..(index + 1) * size]
    }
}

fn be_u32(bytes: &[u8], word: usize) -> u32 {
    let at = word * 4;
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn check_header(path: &str, bytes: &[u8], words: usize, magic: u32) -> DatasetResult<()> {
    if bytes.len() < words * 4 {
        return Err(DatasetError::TruncatedIdx {
            path: path.to_string(),
            expected: words * 4,
            actual: bytes.len(),
        });
    }
    let actual = be_u32(bytes, 0);
    if actual != magic {
        return Err(DatasetError::InvalidIdxMagic {
            path: path.to_string(),
            expected: magic,
            actual,
        });
    }
    Ok(())
}

fn payload<'a>(path: &str, bytes: &'a [u8], header: usize, expected: usize) -> DatasetResult<&'a [u8]> {
    let data = &bytes[header..];
    if data.len() < expected {
        return Err(DatasetError::TruncatedIdx {
            path: path.to_string(),
            expected,
            actual: data.len(),
        });
    }
    Ok(&data[..expected])
}

/// Parses an IDX image file held in memory. `path` is used in errors.
pub fn parse_images(path: &str, bytes: &[u8]) -> DatasetResult<IdxImages> {
    check_header(path, bytes, 4, IMAGE_MAGIC)?;
    let count = be_u32(bytes, 1) as usize;
    let rows = be_u32(bytes, 2) as usize;
    let cols = be_u32(bytes, 3) as usize;
    let len = count.saturating_mul(rows).saturating_mul(cols);
    let pixels = payload(path, bytes, 16, len)?.to_vec();
    Ok(IdxImages {
        count,
        rows,
        cols,
        pixels,
    })
}

/// Parses an IDX label file held in memory.
pub fn parse_labels(path: &str, bytes: &[u8]) -> DatasetResult<Vec<u8>> {
    check_header(path, bytes, 2, LABEL_MAGIC)?;
    let count = be_u32(bytes, 1) as usize;
    Ok(payload(path, bytes, 8, count)?.to_vec())
}

/// Reads a file, transparently inflating it when it is gzip-compressed.
pub fn read_maybe_gz(path: &Path) -> DatasetResult<Vec<u8>> {
    let io_err = |source| DatasetError::Io {
        path: path.display().to_string(),
        source,
    };
    let mut raw = Vec::new();
    File::open(path)
        .and_then(|mut file| file.read_to_end(&mut raw))
        .map_err(io_err)?;

    if raw.starts_with(&[0x1f, 0x8b]) {
        let mut inflated = Vec::new();
        GzDecoder::new(raw.as_slice())
            .read_to_end(&mut inflated)
            .map_err(io_err)?;
        Ok(inflated)
    } else {
        Ok(raw)
    }
}

/// Finds `<dir>/<stem>.gz` or `<dir>/<stem>`.
pub fn locate(dir: &Path, stem: &str) -> DatasetResult<PathBuf> {
    let gz = dir.join(format!("{stem}.gz"));
    if gz.is_file() {
        return Ok(gz);
    }
    let raw = dir.join(stem);
    if raw.is_file() {
        return Ok(raw);
    }
    Err(DatasetError::MissingIdxFile {
        dir: dir.display().to_string(),
        stem: stem.to_string(),
    })
}

pub fn load_images(path: &Path) -> DatasetResult<IdxImages> {
    parse_images(&path.display().to_string(), &read_maybe_gz(path)?)
}

pub fn load_labels(path: &Path) -> DatasetResult<Vec<u8>> {
    parse_labels(&path.display().to_string(), &read_maybe_gz(path)?)
}

/// Sizes and seed of a subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareOptions {
    pub train_count: usize,
    pub test_count: usize,
    /// Train samples are drawn with `seed`, test samples with `seed + 1`.
    pub seed: u64,
}

impl Default for PrepareOptions {
    fn default() -> Self {
        Self {
            train_count: 2000,
            test_count: 400,
            seed: 42,
        }
    }
}

/// Draws `count` distinct samples and scales pixels to `[0, 1]`.
pub fn choose_subset(
    images: &IdxImages,
    labels: &[u8],
    count: usize,
    seed: u64,
) -> DatasetResult<(Vec<f32>, Vec<u8>)> {
    if images.count != labels.len() {
        return Err(DatasetError::IdxCountMismatch {
            images: images.count,
            labels: labels.len(),
        });
    }
    if count > images.count {
        return Err(DatasetError::SubsetTooLarge {
            requested: count,
            available: images.count,
        });
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let picked = index::sample(&mut rng, images.count, count);

    let mut pixels = Vec::with_capacity(count * images.image_size());
    let mut chosen = Vec::with_capacity(count);
    for i in picked.iter() {
        pixels.extend(images.image(i).iter().map(|p| f32::from(*p) / 255.0));
        chosen.push(labels[i]);
    }
    Ok((pixels, chosen))
}

/// Builds a subset container from the four MNIST IDX files in `dir`.
pub fn prepare_subset(dir: &Path, options: &PrepareOptions) -> DatasetResult<MnistSubset> {
    let train_images = load_images(&locate(dir, TRAIN_IMAGES)?)?;
    let train_labels = load_labels(&locate(dir, TRAIN_LABELS)?)?;
    let test_images = load_images(&locate(dir, TEST_IMAGES)?)?;
    let test_labels = load_labels(&locate(dir, TEST_LABELS)?)?;

    if train_images.image_size() != test_images.image_size() {
        return Err(DatasetError::InvalidFormat {
            reason: format!(
                "train images have {} pixels but test images have {}",
                train_images.image_size(),
                test_images.image_size()
            ),
        });
    }

    let (train_x, train_y) =
        choose_subset(&train_images, &train_labels, options.train_count, options.seed)?;
    let (test_x, test_y) = choose_subset(
        &test_images,
        &test_labels,
        options.test_count,
        options.seed.wrapping_add(1),
    )?;

    info!(
        "prepared subset: train={} test={} image_size={}",
        train_y.len(),
        test_y.len(),
        train_images.image_size()
    );
    MnistSubset::new(train_images.image_size(), train_x, train_y, test_x, test_y)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_file(count: u32, rows: u32, cols: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        for word in [IMAGE_MAGIC, count, rows, cols] {
            bytes.extend_from_slice(&word.to_be_bytes());
        }
        bytes.extend((0..count * rows * cols).map(|i| (i % 256) as u8));
        bytes
    }

    #[test]
    fn test_parse_images() {
        let images = parse_images("mem", &image_file(3, 2, 2)).unwrap();
        assert_eq!(images.count, 3);
        assert_eq!(images.image_size(), 4);
        assert_eq!(images.image(2), &[8, 9, 10, 11]);
    }

    #[test]
    fn test_wrong_magic() {
        let mut bytes = image_file(1, 1, 1);
        bytes[..4].copy_from_slice(&LABEL_MAGIC.to_be_bytes());
        assert!(matches!(
            parse_images("mem", &bytes),
            Err(DatasetError::InvalidIdxMagic {
                expected: IMAGE_MAGIC,
                actual: LABEL_MAGIC,
                ..
            })
        ));
    }

    #[test]
    fn test_truncated_labels() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&LABEL_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&5u32.to_be_bytes());
        bytes.extend_from_slice(&[1, 2, 3]);
        assert!(matches!(
            parse_labels("mem", &bytes),
            Err(DatasetError::TruncatedIdx {
                expected: 5,
                actual: 3,
                ..
            })
        ));
    }

    #[test]
    fn test_choose_subset_is_seeded_and_distinct() {
        let images = parse_images("mem", &image_file(20, 1, 1)).unwrap();
        let labels: Vec<u8> = (0..20).map(|i| (i % 10) as u8).collect();

        let (a, _) = choose_subset(&images, &labels, 8, 7).unwrap();
        let (b, _) = choose_subset(&images, &labels, 8, 7).unwrap();
        assert_eq!(a, b);

        let mut seen: Vec<u32> = a.iter().map(|v| (v * 255.0).round() as u32).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 8);
        assert!(a.iter().all(|v| (0.0..=1.0).contains(v)));

        assert!(matches!(
            choose_subset(&images, &labels, 21, 7),
            Err(DatasetError::SubsetTooLarge {
                requested: 21,
                available: 20
            })
        ));
    }
}
