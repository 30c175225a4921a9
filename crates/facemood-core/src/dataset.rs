//! Labeled folder tree → samples, deterministic splits, and dataset management.
//!
//! Layout: `<root>/<label>/<image>`; only files directly inside a label folder count.

use crate::class_index::ClassIndex;
use crate::types::Sample;
use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("no images found under {0}")]
    EmptyDataset(PathBuf),
    #[error("unreadable sample {path}: {reason}")]
    CorruptSample { path: PathBuf, reason: String },
    #[error("invalid label name: {0:?}")]
    InvalidLabel(String),
    #[error("unknown label: {0}")]
    UnknownLabel(String),
    #[error("not an image file: {0}")]
    NotAnImage(PathBuf),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> DatasetError + '_ {
    move |source| DatasetError::Io { path: path.to_path_buf(), source }
}

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Immediate subdirectory names of `root`, sorted. A missing root has no labels.
pub fn scan_labels(root: &Path) -> Result<Vec<String>, DatasetError> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let mut labels = Vec::new();
    for entry in fs::read_dir(root).map_err(io_err(root))? {
        let entry = entry.map_err(io_err(root))?;
        if entry.path().is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                labels.push(name.to_string());
            }
        }
    }
    labels.sort();
    Ok(labels)
}

fn image_files(dir: &Path) -> Result<Vec<PathBuf>, DatasetError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err(dir))? {
        let path = entry.map_err(io_err(dir))?.path();
        if path.is_file() && is_image_file(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Enumerate samples in class-index order, paths sorted within each label.
///
/// Labels without a folder contribute nothing. Fails only when nothing at all is found.
pub fn enumerate(root: &Path, class_index: &ClassIndex) -> Result<Vec<Sample>, DatasetError> {
    let mut samples = Vec::new();
    for (label_idx, label) in class_index.labels().iter().enumerate() {
        let dir = root.join(label);
        if !dir.is_dir() {
            continue;
        }
        samples.extend(
            image_files(&dir)?
                .into_iter()
                .map(|path| Sample { path, label: label_idx }),
        );
    }

    if samples.is_empty() {
        return Err(DatasetError::EmptyDataset(root.to_path_buf()));
    }
    tracing::debug!(root = %root.display(), count = samples.len(), "enumerated samples");
    Ok(samples)
}

/// Seeded shuffle, then the first `n - floor(n * fraction)` go to training.
///
/// Identical inputs always yield identical partitions.
pub fn split(samples: &[Sample], validation_fraction: f64, seed: u64) -> (Vec<Sample>, Vec<Sample>) {
    let mut shuffled = samples.to_vec();
    shuffled.shuffle(&mut StdRng::seed_from_u64(seed));

    let total = shuffled.len();
    let val_len = ((total as f64) * validation_fraction.clamp(0.0, 1.0)).floor() as usize;
    let validation = shuffled.split_off(total - val_len.min(total));

    tracing::debug!(train = shuffled.len(), validation = validation.len(), "dataset split");
    (shuffled, validation)
}

/// Decode a sample as RGB.
pub fn read_sample(path: &Path) -> Result<RgbImage, DatasetError> {
    image::open(path)
        .map(|img| img.to_rgb8())
        .map_err(|e| DatasetError::CorruptSample {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Decode a sample, substituting a black `size × size` placeholder when unreadable.
pub fn load_sample(path: &Path, size: u32) -> RgbImage {
    match read_sample(path) {
        Ok(img) if img.width() > 0 && img.height() > 0 => img,
        Ok(_) => placeholder(size),
        Err(e) => {
            tracing::warn!(error = %e, "substituting placeholder image");
            placeholder(size)
        }
    }
}

pub fn placeholder(size: u32) -> RgbImage {
    RgbImage::from_pixel(size, size, Rgb([0, 0, 0]))
}

/// Number of image files per label folder.
pub fn label_counts(root: &Path) -> Result<BTreeMap<String, usize>, DatasetError> {
    let mut counts = BTreeMap::new();
    for label in scan_labels(root)? {
        let n = image_files(&root.join(&label))?.len();
        counts.insert(label, n);
    }
    Ok(counts)
}

fn validate_label(name: &str) -> Result<&str, DatasetError> {
    let name = name.trim();
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
    {
        return Err(DatasetError::InvalidLabel(name.to_string()));
    }
    Ok(name)
}

/// Create a label folder. Existing folders are left as they are.
pub fn add_label(root: &Path, name: &str) -> Result<PathBuf, DatasetError> {
    let name = validate_label(name)?;
    let dir = root.join(name);
    fs::create_dir_all(&dir).map_err(io_err(&dir))?;
    tracing::info!(label = name, "label folder ready");
    Ok(dir)
}

/// Copy an image into a label folder under a timestamp-prefixed name.
pub fn import_image(root: &Path, label: &str, source: &Path) -> Result<PathBuf, DatasetError> {
    let label = validate_label(label)?;
    let dir = root.join(label);
    if !dir.is_dir() {
        return Err(DatasetError::UnknownLabel(label.to_string()));
    }
    if !is_image_file(source) {
        return Err(DatasetError::NotAnImage(source.to_path_buf()));
    }
    let file_name = source
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| DatasetError::NotAnImage(source.to_path_buf()))?;

    let stamp = chrono::Utc::now().timestamp();
    let mut dest = dir.join(format!("{stamp}_0_{file_name}"));
    let mut n = 1;
    while dest.exists() {
        dest = dir.join(format!("{stamp}_{n}_{file_name}"));
        n += 1;
    }

    fs::copy(source, &dest).map_err(io_err(source))?;
    tracing::debug!(label, dest = %dest.display(), "imported image");
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("happy/b.jpg"));
        touch(&root.join("happy/a.PNG"));
        touch(&root.join("happy/notes.txt"));
        touch(&root.join("sad/c.webp"));
        touch(&root.join("loose.jpg"));
        fs::create_dir_all(root.join("happy/nested")).unwrap();
        touch(&root.join("happy/nested/deep.jpg"));
        dir
    }

    #[test]
    fn test_scan_labels_sorted_dirs_only() {
        let dir = tree();
        assert_eq!(scan_labels(dir.path()).unwrap(), vec!["happy", "sad"]);
    }

    #[test]
    fn test_scan_labels_missing_root() {
        assert!(scan_labels(Path::new("/nonexistent/facemood")).unwrap().is_empty());
    }

    #[test]
    fn test_enumerate_order_and_filter() {
        let dir = tree();
        let idx = ClassIndex::from_labels(["happy", "sad"]).unwrap();
        let samples = enumerate(dir.path(), &idx).unwrap();
        let names: Vec<_> = samples
            .iter()
            .map(|s| (s.path.file_name().unwrap().to_str().unwrap().to_string(), s.label))
            .collect();
        assert_eq!(
            names,
            vec![("a.PNG".to_string(), 0), ("b.jpg".to_string(), 0), ("c.webp".to_string(), 1)]
        );
    }

    #[test]
    fn test_enumerate_empty_is_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("happy")).unwrap();
        let idx = ClassIndex::from_labels(["happy"]).unwrap();
        assert!(matches!(enumerate(dir.path(), &idx), Err(DatasetError::EmptyDataset(_))));
    }

    fn fake_samples(n: usize) -> Vec<Sample> {
        (0..n)
            .map(|i| Sample { path: PathBuf::from(format!("{i}.jpg")), label: i % 3 })
            .collect()
    }

    #[test]
    fn test_split_deterministic() {
        let samples = fake_samples(50);
        let a = split(&samples, 0.2, 42);
        let b = split(&samples, 0.2, 42);
        assert_eq!(a, b);
        assert_eq!(a.0.len(), 40);
        assert_eq!(a.1.len(), 10);
    }

    #[test]
    fn test_split_seed_changes_partition() {
        let samples = fake_samples(50);
        assert_ne!(split(&samples, 0.2, 1).1, split(&samples, 0.2, 2).1);
    }

    #[test]
    fn test_split_preserves_all_samples() {
        let samples = fake_samples(17);
        let (train, val) = split(&samples, 0.3, 9);
        assert_eq!(train.len() + val.len(), 17);
        assert_eq!(val.len(), 5);
        let mut all: Vec<_> = train.into_iter().chain(val).map(|s| s.path).collect();
        all.sort();
        let mut expected: Vec<_> = samples.into_iter().map(|s| s.path).collect();
        expected.sort();
        assert_eq!(all, expected);
    }

    #[test]
    fn test_split_single_sample_all_train() {
        let (train, val) = split(&fake_samples(1), 0.2, 42);
        assert_eq!(train.len(), 1);
        assert!(val.is_empty());
    }

    #[test]
    fn test_load_sample_corrupt_gives_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.jpg");
        fs::write(&path, b"definitely not a jpeg").unwrap();
        let img = load_sample(&path, 24);
        assert_eq!(img.dimensions(), (24, 24));
        assert!(img.pixels().all(|p| p.0 == [0, 0, 0]));
    }

    #[test]
    fn test_load_sample_reads_valid_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ok.png");
        RgbImage::from_pixel(5, 7, Rgb([1, 2, 3])).save(&path).unwrap();
        let img = load_sample(&path, 24);
        assert_eq!(img.dimensions(), (5, 7));
    }

    #[test]
    fn test_label_counts() {
        let dir = tree();
        let counts = label_counts(dir.path()).unwrap();
        assert_eq!(counts.get("happy"), Some(&2));
        assert_eq!(counts.get("sad"), Some(&1));
    }

    #[test]
    fn test_add_label_rejects_bad_names() {
        let dir = tempfile::tempdir().unwrap();
        assert!(add_label(dir.path(), "  ").is_err());
        assert!(add_label(dir.path(), "../escape").is_err());
        assert!(add_label(dir.path(), "..").is_err());
        let created = add_label(dir.path(), "happy").unwrap();
        assert!(created.is_dir());
    }

    #[test]
    fn test_import_image_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("uploads");
        add_label(&root, "happy").unwrap();
        let src = dir.path().join("smile.png");
        touch(&src);

        let first = import_image(&root, "happy", &src).unwrap();
        let second = import_image(&root, "happy", &src).unwrap();
        assert_ne!(first, second);
        assert_eq!(label_counts(&root).unwrap()["happy"], 2);
    }

    #[test]
    fn test_import_image_unknown_label() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("smile.png");
        touch(&src);
        assert!(matches!(
            import_image(dir.path(), "missing", &src),
            Err(DatasetError::UnknownLabel(_))
        ));
    }

    #[test]
    fn test_import_rejects_non_image() {
        let dir = tempfile::tempdir().unwrap();
        add_label(dir.path(), "happy").unwrap();
        let src = dir.path().join("notes.txt");
        touch(&src);
        assert!(matches!(
            import_image(dir.path(), "happy", &src),
            Err(DatasetError::NotAnImage(_))
        ));
    }
}
