use super::adapter::SourceAdapter;
use crate::config::DataLayout;
use crate::record::{ClassLabel, ImageRecord, RecordStore};
use indicatif::ProgressBar;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum NormalizeError {
    /// A staged path matched no class-mapping rule and the source configures
    /// no default. Surfaced rather than dropped: silent drops would skew the
    /// class balance undetectably.
    #[error("no class mapping for '{path}' in source '{source_name}'")]
    UnmappableLabel { source_name: String, path: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Rewrites staged source trees into the canonical
/// `processed/{class}/{source}_{id}.{ext}` layout.
pub struct Normalizer<'a> {
    layout: &'a DataLayout,
}

impl<'a> Normalizer<'a> {
    pub fn new(layout: &'a DataLayout) -> Self {
        Self { layout }
    }

    /// Normalize one source, emitting one record per placed file into the
    /// store. The adapter's sequence is fully resolved first so that label
    /// gaps surface before any file is written.
    pub fn normalize_source(
        &self,
        adapter: &SourceAdapter<'_>,
        store: &mut RecordStore,
    ) -> Result<usize, NormalizeError> {
        let files: Vec<(PathBuf, ClassLabel)> =
            adapter.enumerate().collect::<Result<Vec<_>, _>>()?;
        let source = adapter.descriptor().name.clone();
        info!(source = %source, files = files.len(), "normalizing source");

        let bar = ProgressBar::new(files.len() as u64);
        let mut added = 0usize;
        for (index, (raw_path, label)) in files.iter().enumerate() {
            let record = self.place(&source, index + 1, raw_path, *label)?;
            store.insert(record);
            added += 1;
            bar.inc(1);
        }
        bar.finish_and_clear();
        Ok(added)
    }

    fn place(
        &self,
        source: &str,
        id: usize,
        raw_path: &Path,
        label: ClassLabel,
    ) -> Result<ImageRecord, NormalizeError> {
        let ext = raw_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("img")
            .to_lowercase();
        let file_name = format!("{}_{:06}.{}", source, id, ext);
        let relative = PathBuf::from(label.as_str()).join(&file_name);
        let dest = self.layout.processed_dir().join(&relative);

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        if !dest.exists() {
            // Hard links keep the corpus single-copy on disk; staging areas
            // on another filesystem get a byte copy instead.
            if fs::hard_link(raw_path, &dest).is_err() {
                fs::copy(raw_path, &dest)?;
            }
        }
        let byte_size = fs::metadata(&dest)?.len();
        debug!(from = %raw_path.display(), to = %dest.display(), "placed file");

        Ok(ImageRecord {
            source: source.to_string(),
            original_path: raw_path.to_path_buf(),
            canonical_path: relative,
            class_label: label,
            byte_size,
            content_fingerprint: None,
            perceptual_fingerprint: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ArchiveFormat, ClassMappingRules, SourceDescriptor, SourceLayout,
    };
    use tempfile::TempDir;

    fn descriptor(name: &str, layout: SourceLayout) -> SourceDescriptor {
        SourceDescriptor {
            name: name.to_string(),
            origin: "http://localhost/archive.zip".to_string(),
            archive: ArchiveFormat::Zip,
            layout,
            checksum: None,
            expected_size: None,
            rules: ClassMappingRules::default(),
        }
    }

    #[test]
    fn test_normalize_places_files_in_canonical_layout() {
        let staging = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();

        fs::create_dir_all(staging.path().join("Tomato___Leaf_Mold")).unwrap();
        fs::create_dir_all(staging.path().join("Tomato___healthy")).unwrap();
        fs::write(
            staging.path().join("Tomato___Leaf_Mold/0001.jpg"),
            b"moldy leaf",
        )
        .unwrap();
        fs::write(
            staging.path().join("Tomato___healthy/0002.JPG"),
            b"healthy leaf",
        )
        .unwrap();

        let desc = descriptor("plantdoc", SourceLayout::PlantDoc);
        let adapter = SourceAdapter::new(&desc, staging.path());
        let layout = DataLayout::new(data.path());
        let mut store = RecordStore::new();

        let added = Normalizer::new(&layout)
            .normalize_source(&adapter, &mut store)
            .unwrap();
        assert_eq!(added, 2);

        let records: Vec<_> = store.iter().collect();
        let unhealthy = records
            .iter()
            .find(|r| r.class_label == ClassLabel::Unhealthy)
            .unwrap();
        assert!(unhealthy
            .canonical_path
            .starts_with(ClassLabel::Unhealthy.as_str()));
        assert!(layout.processed_dir().join(&unhealthy.canonical_path).is_file());
        assert_eq!(unhealthy.byte_size, "moldy leaf".len() as u64);

        // Extensions are lowercased and names carry the source prefix.
        let healthy = records
            .iter()
            .find(|r| r.class_label == ClassLabel::Healthy)
            .unwrap();
        let name = healthy.canonical_path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("plantdoc_"), "got {name}");
        assert!(name.ends_with(".jpg"), "got {name}");
    }

    #[test]
    fn test_normalize_is_deterministic_across_reruns() {
        let staging = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();

        for i in 0..4 {
            let dir = staging.path().join("leaf_spot");
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join(format!("img_{i}.png")), format!("pixels {i}")).unwrap();
        }

        let desc = descriptor("diamos", SourceLayout::MegaPlant);
        let adapter = SourceAdapter::new(&desc, staging.path());
        let layout = DataLayout::new(data.path());

        let mut first = RecordStore::new();
        Normalizer::new(&layout)
            .normalize_source(&adapter, &mut first)
            .unwrap();
        let mut second = RecordStore::new();
        Normalizer::new(&layout)
            .normalize_source(&adapter, &mut second)
            .unwrap();

        let a: Vec<_> = first.iter().map(|r| r.canonical_path.clone()).collect();
        let b: Vec<_> = second.iter().map(|r| r.canonical_path.clone()).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_unmappable_label_aborts_before_writing() {
        let staging = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();

        // MegaPlant layout has no default label; a stray folder is fatal.
        fs::create_dir_all(staging.path().join("mystery")).unwrap();
        fs::write(staging.path().join("mystery/0001.jpg"), b"???").unwrap();

        let desc = descriptor("megaplant", SourceLayout::MegaPlant);
        let adapter = SourceAdapter::new(&desc, staging.path());
        let layout = DataLayout::new(data.path());
        let mut store = RecordStore::new();

        let result = Normalizer::new(&layout).normalize_source(&adapter, &mut store);
        assert!(matches!(
            result,
            Err(NormalizeError::UnmappableLabel { .. })
        ));
        assert!(store.is_empty());
        assert!(!layout.processed_dir().exists());
    }
}
