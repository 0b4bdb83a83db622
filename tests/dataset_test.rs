//! Tests for the subset container and IDX preparation on disk.

use std::fs;
use std::io::Write;
use std::path::Path;

use aot_mnist::MnistSubset;
use aot_mnist::dataset::idx::{
    IMAGE_MAGIC, LABEL_MAGIC, PrepareOptions, TEST_IMAGES, TEST_LABELS, TRAIN_IMAGES,
    TRAIN_LABELS, prepare_subset,
};
use aot_mnist::dataset::{HEADER_BYTES, Split};
use aot_mnist::errors::DatasetError;
use flate2::Compression;
use flate2::write::GzEncoder;
use tempfile::tempdir;

fn idx_images(count: u32, side: u32) -> Vec<u8> {
    let mut bytes = Vec::new();
    for word in [IMAGE_MAGIC, count, side, side] {
        bytes.extend_from_slice(&word.to_be_bytes());
    }
    for i in 0..count {
        bytes.extend(std::iter::repeat_n((i * 8) as u8, (side * side) as usize));
    }
    bytes
}

fn idx_labels(count: u32) -> Vec<u8> {
    let mut bytes = Vec::new();
    for word in [LABEL_MAGIC, count] {
        bytes.extend_from_slice(&word.to_be_bytes());
    }
    bytes.extend((0..count).map(|i| (i % 10) as u8));
    bytes
}

fn write_gz(path: &Path, bytes: &[u8]) {
    let mut encoder = GzEncoder::new(fs::File::create(path).unwrap(), Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap();
}

#[cfg(test)]
mod container_tests {
    use super::*;

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/mnist_subset.bin");
        let dataset = MnistSubset::new(
            3,
            vec![0.0, 0.1, 0.2, 0.3, 0.4, 0.5],
            vec![1, 2],
            vec![0.9, 0.8, 0.7],
            vec![9],
        )
        .unwrap();
        dataset.save(&path).unwrap();

        let size = fs::metadata(&path).unwrap().len() as usize;
        assert_eq!(size, HEADER_BYTES + 6 * 4 + 2 + 3 * 4 + 1);
        let loaded = MnistSubset::load(&path).unwrap();
        assert_eq!(loaded, dataset);
        assert_eq!(loaded.count(Split::Train), 2);
        assert_eq!(loaded.sample(Split::Test, 0).unwrap().1, 9);
    }

    #[test]
    fn test_wrong_magic_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.bin");
        let mut bytes = MnistSubset::new(1, vec![0.0], vec![0], vec![], vec![])
            .unwrap()
            .to_bytes();
        bytes[..4].copy_from_slice(b"XXXX");
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            MnistSubset::load(&path),
            Err(DatasetError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn test_missing_file() {
        let result = MnistSubset::load("does/not/exist.bin");
        assert!(matches!(result, Err(DatasetError::Io { .. })));
    }
}

#[cfg(test)]
mod prepare_tests {
    use super::*;

    fn write_sources(dir: &Path, compressed: bool) {
        let files = [
            (TRAIN_IMAGES, idx_images(30, 2)),
            (TRAIN_LABELS, idx_labels(30)),
            (TEST_IMAGES, idx_images(12, 2)),
            (TEST_LABELS, idx_labels(12)),
        ];
        for (stem, bytes) in files {
            if compressed {
                write_gz(&dir.join(format!("{stem}.gz")), &bytes);
            } else {
                fs::write(dir.join(stem), bytes).unwrap();
            }
        }
    }

    #[test]
    fn test_prepare_from_gzip_sources() {
        let dir = tempdir().unwrap();
        write_sources(dir.path(), true);
        let options = PrepareOptions {
            train_count: 10,
            test_count: 4,
            seed: 42,
        };
        let dataset = prepare_subset(dir.path(), &options).unwrap();
        assert_eq!(dataset.image_size(), 4);
        assert_eq!(dataset.train_count(), 10);
        assert_eq!(dataset.test_count(), 4);

        // every image is a single repeated byte i * 8 whose label is i % 10
        for index in 0..dataset.train_count() {
            let (image, label) = dataset.train_sample(index).unwrap();
            let source = (image[0] * 255.0).round() as u32 / 8;
            assert_eq!(label as u32, source % 10);
            assert!(image.iter().all(|p| *p == image[0]));
        }

        let again = prepare_subset(dir.path(), &options).unwrap();
        assert_eq!(dataset, again);
    }

    #[test]
    fn test_prepare_from_raw_sources() {
        let dir = tempdir().unwrap();
        write_sources(dir.path(), false);
        let dataset = prepare_subset(
            dir.path(),
            &PrepareOptions {
                train_count: 30,
                test_count: 12,
                seed: 1,
            },
        )
        .unwrap();
        assert_eq!(dataset.train_count(), 30);
    }

    #[test]
    fn test_prepare_rejects_oversized_subset() {
        let dir = tempdir().unwrap();
        write_sources(dir.path(), true);
        let result = prepare_subset(dir.path(), &PrepareOptions::default());
        assert!(matches!(
            result,
            Err(DatasetError::SubsetTooLarge {
                requested: 2000,
                available: 30
            })
        ));
    }

    #[test]
    fn test_prepare_missing_sources() {
        let dir = tempdir().unwrap();
        let error = prepare_subset(dir.path(), &PrepareOptions::default()).unwrap_err();
        assert!(matches!(
            &error,
            DatasetError::MissingIdxFile { stem, .. } if stem == TRAIN_IMAGES
        ));
        assert!(error.to_string().contains("not downloaded"));
    }
}
