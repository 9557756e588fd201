use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Class taxonomy every normalized image resolves into.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ClassLabel {
    Healthy,
    Unhealthy,
}

impl ClassLabel {
    pub const ALL: [ClassLabel; 2] = [ClassLabel::Healthy, ClassLabel::Unhealthy];

    pub fn as_str(&self) -> &'static str {
        match self {
            ClassLabel::Healthy => "healthy",
            ClassLabel::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for ClassLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Split a record can be assigned to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SplitName {
    Train,
    Val,
    Test,
}

impl SplitName {
    pub fn as_str(&self) -> &'static str {
        match self {
            SplitName::Train => "train",
            SplitName::Val => "val",
            SplitName::Test => "test",
        }
    }
}

impl fmt::Display for SplitName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The split layout matching a ratio list of length 2 or 3.
pub fn split_names(count: usize) -> &'static [SplitName] {
    match count {
        2 => &[SplitName::Train, SplitName::Val],
        _ => &[SplitName::Train, SplitName::Val, SplitName::Test],
    }
}

/// One normalized image. Uniquely identified by `canonical_path`, which is
/// relative to the processed root (`{class}/{source}_{id}.{ext}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub source: String,
    pub original_path: PathBuf,
    pub canonical_path: PathBuf,
    pub class_label: ClassLabel,
    pub byte_size: u64,
    /// BLAKE3 hash of the file bytes, set by the deduplicator.
    pub content_fingerprint: Option<String>,
    /// Base64 perceptual hash, set by the deduplicator for the
    /// representative of each exact-equality class.
    pub perceptual_fingerprint: Option<String>,
}

/// Arena of [`ImageRecord`]s keyed by canonical path, owned by the pipeline
/// controller and passed explicitly between stages. Ordered so that every
/// iteration over the corpus is deterministic.
#[derive(Debug, Clone, Default)]
pub struct RecordStore {
    records: BTreeMap<PathBuf, ImageRecord>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record under its canonical path, returning any displaced one.
    pub fn insert(&mut self, record: ImageRecord) -> Option<ImageRecord> {
        self.records.insert(record.canonical_path.clone(), record)
    }

    pub fn get(&self, canonical_path: &Path) -> Option<&ImageRecord> {
        self.records.get(canonical_path)
    }

    pub fn get_mut(&mut self, canonical_path: &Path) -> Option<&mut ImageRecord> {
        self.records.get_mut(canonical_path)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ImageRecord> {
        self.records.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ImageRecord> {
        self.records.values_mut()
    }

    /// Record count per class label.
    pub fn class_counts(&self) -> BTreeMap<ClassLabel, usize> {
        let mut counts = BTreeMap::new();
        for record in self.records.values() {
            *counts.entry(record.class_label).or_insert(0) += 1;
        }
        counts
    }
}

/// Equivalence class of images considered the same underlying photograph,
/// with a designated survivor. Groups partition the corpus; unique images
/// form singleton groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub id: String,
    /// Canonical paths of all members, sorted.
    pub members: Vec<PathBuf>,
    /// The single member retained in the final dataset.
    pub survivor: PathBuf,
}

impl DuplicateGroup {
    pub fn is_singleton(&self) -> bool {
        self.members.len() == 1
    }

    /// Members other than the survivor.
    pub fn excluded(&self) -> impl Iterator<Item = &PathBuf> {
        self.members.iter().filter(move |m| **m != self.survivor)
    }
}

/// Assignment of one record to one split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitAssignment {
    pub canonical_path: PathBuf,
    pub class_label: ClassLabel,
    pub split: SplitName,
}

/// Ordered record → split mapping produced by the splitter. All members of a
/// duplicate group carry the same split name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitManifest {
    pub assignments: Vec<SplitAssignment>,
}

impl SplitManifest {
    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Record count per (split, class) pair.
    pub fn counts(&self) -> BTreeMap<(SplitName, ClassLabel), usize> {
        let mut counts = BTreeMap::new();
        for assignment in &self.assignments {
            *counts
                .entry((assignment.split, assignment.class_label))
                .or_insert(0) += 1;
        }
        counts
    }

    pub fn split_of(&self, canonical_path: &Path) -> Option<SplitName> {
        self.assignments
            .iter()
            .find(|a| a.canonical_path == canonical_path)
            .map(|a| a.split)
    }
}
