use crate::record::ClassLabel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Folder-name keywords that mark a class folder as unhealthy, matched
/// case-insensitively as substrings.
pub const UNHEALTHY_KEYWORDS: [&str; 9] = [
    "rust", "scab", "spot", "blight", "rot", "mold", "mildew", "measles", "mites",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read configuration file {path}: {cause}")]
    Read {
        path: PathBuf,
        #[source]
        cause: std::io::Error,
    },

    #[error("malformed configuration file {path}: {cause}")]
    Parse {
        path: PathBuf,
        #[source]
        cause: serde_json::Error,
    },

    #[error("no source named '{0}' is configured")]
    UnknownSource(String),
}

/// How a source's archive is packaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    Zip,
    /// Single-file payload staged as-is.
    #[serde(rename = "none")]
    Plain,
}

/// On-disk layout of an integrated dataset. One variant per source; adding a
/// dataset means adding a variant here, not touching shared walking logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceLayout {
    /// Ships `color`, `grayscale` and `segmented` re-processings of the same
    /// photographs; only the `color` tree contributes.
    PlantVillage,
    /// Per-disease folders with no healthy marker in folder names; anything
    /// without a symptom keyword is a healthy leaf photo.
    PlantDoc,
    /// Ships fruit and annotation subtrees next to `leaves`; only `leaves`
    /// contributes, and its folder names need explicit label overrides.
    DiaMos,
    /// Already organized as `healthy/` and `unhealthy/` trees.
    MegaPlant,
}

impl SourceLayout {
    /// Path component that must be present for a file to contribute.
    pub fn include_subtree(&self) -> Option<&'static str> {
        match self {
            SourceLayout::PlantVillage => Some("color"),
            SourceLayout::DiaMos => Some("leaves"),
            SourceLayout::PlantDoc | SourceLayout::MegaPlant => None,
        }
    }

    /// Intrinsic folder-name overrides for layouts whose class folders carry
    /// no recognizable keyword.
    pub fn overrides(&self) -> &'static [(&'static str, ClassLabel)] {
        match self {
            SourceLayout::DiaMos => &[
                ("curl", ClassLabel::Unhealthy),
                ("slug", ClassLabel::Unhealthy),
            ],
            _ => &[],
        }
    }

    /// Label applied when no rule matches a folder name.
    pub fn default_label(&self) -> Option<ClassLabel> {
        match self {
            SourceLayout::PlantVillage | SourceLayout::PlantDoc => Some(ClassLabel::Healthy),
            SourceLayout::DiaMos | SourceLayout::MegaPlant => None,
        }
    }
}

/// Per-source class-mapping configuration layered over the layout's
/// intrinsic rules. Configured values win.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassMappingRules {
    /// Restrict enumeration to paths containing this component.
    #[serde(default)]
    pub include_subtree: Option<String>,
    /// Folder name (lowercased) → label, consulted before keyword matching.
    #[serde(default)]
    pub overrides: BTreeMap<String, ClassLabel>,
    /// Fallback when no rule matches; `None` makes unmatched folders an error.
    #[serde(default)]
    pub default_label: Option<ClassLabel>,
}

/// Immutable description of one integrated dataset, defined at
/// configuration time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub name: String,
    /// Archive URL.
    pub origin: String,
    pub archive: ArchiveFormat,
    pub layout: SourceLayout,
    /// Expected SHA-256 of the archive, hex-encoded, verified when present.
    #[serde(default)]
    pub checksum: Option<String>,
    /// Expected archive byte size, verified when present.
    #[serde(default)]
    pub expected_size: Option<u64>,
    #[serde(default)]
    pub rules: ClassMappingRules,
}

impl SourceDescriptor {
    /// Classify a single folder name: configured overrides, then layout
    /// overrides, then the keyword set, then the healthy/unhealthy markers.
    /// `None` means no rule matched.
    pub fn classify_folder(&self, folder: &str) -> Option<ClassLabel> {
        let lower = folder.to_lowercase();

        if let Some(label) = self.rules.overrides.get(&lower) {
            return Some(*label);
        }
        if let Some((_, label)) = self
            .layout
            .overrides()
            .iter()
            .find(|(name, _)| *name == lower)
        {
            return Some(*label);
        }
        if UNHEALTHY_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
            return Some(ClassLabel::Unhealthy);
        }
        // "unhealthy" must be tested first since it contains "healthy".
        if lower.contains("unhealthy") {
            return Some(ClassLabel::Unhealthy);
        }
        if lower.contains("healthy") {
            return Some(ClassLabel::Healthy);
        }
        None
    }

    pub fn default_label(&self) -> Option<ClassLabel> {
        self.rules.default_label.or(self.layout.default_label())
    }

    pub fn include_subtree(&self) -> Option<&str> {
        self.rules
            .include_subtree
            .as_deref()
            .or(self.layout.include_subtree())
    }
}

/// Bounded retry budget with exponential backoff for network fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// Per-request timeout, so no fetch blocks indefinitely.
    pub request_timeout_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            request_timeout_secs: 120,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based), doubling per
    /// attempt from the base delay.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

/// Deduplicator tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupSettings {
    /// Maximum Hamming distance (bits out of 64) for two perceptual hashes
    /// to count as near-duplicates.
    pub hamming_threshold: u32,
    /// Decode budget: files whose pixel count exceeds this are excluded
    /// instead of decoded.
    pub max_pixels: u64,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            hamming_threshold: 5,
            max_pixels: 100_000_000,
        }
    }
}

/// Directory layout contract shared by all stages:
/// `staging/{source}/...` raw, `processed/{class}/{source}_{id}.{ext}`
/// canonical, `manifests/{run_id}/` persisted stage outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataLayout {
    pub root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn staging_dir(&self, source: &str) -> PathBuf {
        self.root.join("staging").join(source)
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.root.join("processed")
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.root.join("manifests")
    }

    pub fn splits_dir(&self) -> PathBuf {
        self.root.join("splits")
    }
}

fn default_fetch_concurrency() -> usize {
    3
}

/// Top-level pipeline configuration, loaded once per run and treated as
/// immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "PipelineConfig::default_sources")]
    pub sources: Vec<SourceDescriptor>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub dedup: DedupSettings,
    /// Bound on concurrent source fetches.
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sources: Self::default_sources(),
            retry: RetryPolicy::default(),
            dedup: DedupSettings::default(),
            fetch_concurrency: default_fetch_concurrency(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a JSON file, or fall back to the built-in
    /// descriptors when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path).map_err(|cause| ConfigError::Read {
            path: path.to_path_buf(),
            cause,
        })?;
        serde_json::from_str(&text).map_err(|cause| ConfigError::Parse {
            path: path.to_path_buf(),
            cause,
        })
    }

    pub fn source(&self, name: &str) -> Result<&SourceDescriptor, ConfigError> {
        self.sources
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| ConfigError::UnknownSource(name.to_string()))
    }

    /// The four integrated datasets.
    pub fn default_sources() -> Vec<SourceDescriptor> {
        vec![
            SourceDescriptor {
                name: "plantvillage".to_string(),
                origin:
                    "https://www.kaggle.com/api/v1/datasets/download/abdallahalidev/plantvillage-dataset"
                        .to_string(),
                archive: ArchiveFormat::Zip,
                layout: SourceLayout::PlantVillage,
                checksum: None,
                expected_size: None,
                rules: ClassMappingRules::default(),
            },
            SourceDescriptor {
                name: "plantdoc".to_string(),
                origin:
                    "https://www.kaggle.com/api/v1/datasets/download/nirmalsankalana/plantdoc-dataset"
                        .to_string(),
                archive: ArchiveFormat::Zip,
                layout: SourceLayout::PlantDoc,
                checksum: None,
                expected_size: None,
                rules: ClassMappingRules::default(),
            },
            SourceDescriptor {
                name: "diamos".to_string(),
                origin: "https://huggingface.co/datasets/chrisandrei/diamos/resolve/main/leaves.zip"
                    .to_string(),
                archive: ArchiveFormat::Zip,
                layout: SourceLayout::DiaMos,
                checksum: None,
                expected_size: None,
                rules: ClassMappingRules::default(),
            },
            SourceDescriptor {
                name: "megaplant".to_string(),
                origin:
                    "https://huggingface.co/datasets/chrisandrei/MegaPlant/resolve/main/leaves.zip"
                        .to_string(),
                archive: ArchiveFormat::Zip,
                layout: SourceLayout::MegaPlant,
                checksum: None,
                expected_size: None,
                rules: ClassMappingRules::default(),
            },
        ]
    }
}
