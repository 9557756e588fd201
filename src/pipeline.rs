use crate::config::{ConfigError, DataLayout, PipelineConfig};
use crate::core::adapter::SourceAdapter;
use crate::core::deduplicator::{DedupOutcome, Deduplicator};
use crate::core::fetcher::{FetchError, FetchOutcome, Fetcher};
use crate::core::normalizer::{NormalizeError, Normalizer};
use crate::core::splitter::{self, SplitError};
use crate::manifest::{
    new_run_id, DedupRow, ExclusionReason, ManifestError, ManifestStore, NormalizedRow, SplitRow,
    DEDUP_MANIFEST, NORMALIZED_MANIFEST, SPLIT_MANIFEST,
};
use crate::record::{ClassLabel, DuplicateGroup, RecordStore, SplitManifest, SplitName};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    #[error(transparent)]
    Split(#[from] SplitError),

    #[error("failed to persist or load the {stage} manifest: {cause}")]
    Manifest {
        stage: &'static str,
        #[source]
        cause: ManifestError,
    },

    #[error("no source could be staged; nothing to normalize")]
    NothingStaged,
}

impl PipelineError {
    fn manifest(stage: &'static str, cause: ManifestError) -> Self {
        PipelineError::Manifest { stage, cause }
    }

    /// Stage-identifying process exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Config(_) => 2,
            PipelineError::Fetch(_) | PipelineError::NothingStaged => 3,
            PipelineError::Normalize(_) => 4,
            PipelineError::Split(_) => 6,
            PipelineError::Manifest { stage, .. } => match *stage {
                "normalized" => 4,
                "dedup" => 5,
                _ => 6,
            },
        }
    }
}

/// Counts reported at the end of every run, partial failures included, so an
/// incomplete run is still actionable.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub run_id: String,
    pub staged_sources: Vec<String>,
    pub failed_sources: Vec<(String, String)>,
    pub normalized: usize,
    pub duplicate_groups: usize,
    pub excluded_duplicate: usize,
    pub excluded_corrupt: usize,
    pub split_counts: BTreeMap<(SplitName, ClassLabel), usize>,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.run_id.is_empty() {
            writeln!(f, "📋 Run summary")?;
        } else {
            writeln!(f, "📋 Run summary ({})", self.run_id)?;
        }
        writeln!(f, "   staged sources:   {}", self.staged_sources.len())?;
        for (name, reason) in &self.failed_sources {
            writeln!(f, "     ✗ {name}: {reason}")?;
        }
        writeln!(f, "   normalized:       {} record(s)", self.normalized)?;
        writeln!(
            f,
            "   duplicate groups: {} ({} duplicate(s) excluded)",
            self.duplicate_groups, self.excluded_duplicate
        )?;
        writeln!(f, "   corrupt excluded: {}", self.excluded_corrupt)?;
        if !self.split_counts.is_empty() {
            writeln!(f, "   split totals:")?;
            let mut by_split: BTreeMap<SplitName, Vec<(ClassLabel, usize)>> = BTreeMap::new();
            for (&(split, class), count) in &self.split_counts {
                by_split.entry(split).or_default().push((class, *count));
            }
            for (split, classes) in by_split {
                let detail = classes
                    .iter()
                    .map(|(class, count)| format!("{class} {count}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                writeln!(f, "     {split}: {detail}")?;
            }
        }
        Ok(())
    }
}

/// Orchestrates Fetch → Normalize → Dedup → Split in order, persisting each
/// stage's manifest before the next starts so any stage can be re-run
/// against a previous stage's saved output. Owns the record store and the
/// directory layout; nothing here is process-global.
pub struct PipelineController {
    config: PipelineConfig,
    layout: DataLayout,
    manifests: ManifestStore,
}

impl PipelineController {
    pub fn new(config: PipelineConfig, layout: DataLayout) -> Self {
        let manifests = ManifestStore::new(layout.manifests_dir());
        Self {
            config,
            layout,
            manifests,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    pub fn manifests(&self) -> &ManifestStore {
        &self.manifests
    }

    /// Stage every configured source. Per-source failures are collected, not
    /// propagated: one bad archive must not abort the others.
    pub fn fetch_all(&self) -> Result<FetchOutcome, PipelineError> {
        let fetcher = Fetcher::new(self.config.retry)?;
        let outcome =
            fetcher.fetch_all(&self.config.sources, &self.layout, self.config.fetch_concurrency)?;
        info!(
            staged = outcome.staged.len(),
            failed = outcome.failures.len(),
            "fetch stage finished"
        );
        Ok(outcome)
    }

    /// Normalize every staged source into a fresh run. Sources that were
    /// never staged are skipped with a warning, so a partially failed fetch
    /// still yields a usable corpus.
    pub fn normalize(&self) -> Result<(String, RecordStore), PipelineError> {
        let run_id = new_run_id(Utc::now());
        let mut store = RecordStore::new();
        let normalizer = Normalizer::new(&self.layout);

        for descriptor in &self.config.sources {
            let staging = self.layout.staging_dir(&descriptor.name);
            if !staging.is_dir() {
                warn!(source = %descriptor.name, "skipping source that was never staged");
                continue;
            }
            let adapter = SourceAdapter::new(descriptor, &staging);
            let added = normalizer.normalize_source(&adapter, &mut store)?;
            info!(source = %descriptor.name, records = added, "source normalized");
        }
        if store.is_empty() {
            return Err(PipelineError::NothingStaged);
        }

        let recorded_at = Utc::now().to_rfc3339();
        let rows: Vec<NormalizedRow> = store
            .iter()
            .map(|record| NormalizedRow {
                run_id: run_id.clone(),
                recorded_at: recorded_at.clone(),
                record: record.clone(),
            })
            .collect();
        self.manifests
            .append_rows(&run_id, NORMALIZED_MANIFEST, &rows)
            .map_err(|cause| PipelineError::manifest("normalized", cause))?;
        self.manifests
            .mark_latest(&run_id)
            .map_err(|cause| PipelineError::manifest("normalized", cause))?;

        Ok((run_id, store))
    }

    /// Rebuild the record store from a run's normalized manifest.
    pub fn load_normalized(&self, run_id: &str) -> Result<RecordStore, PipelineError> {
        let rows: Vec<NormalizedRow> = self
            .manifests
            .read_rows(run_id, NORMALIZED_MANIFEST)
            .map_err(|cause| PipelineError::manifest("normalized", cause))?;
        let mut store = RecordStore::new();
        for row in rows {
            store.insert(row.record);
        }
        Ok(store)
    }

    /// Fingerprint the corpus, group duplicates and persist the annotated
    /// manifest. Corrupt files are excluded per-file, never fatal.
    pub fn dedup(
        &self,
        run_id: &str,
        store: &mut RecordStore,
    ) -> Result<DedupOutcome, PipelineError> {
        let deduplicator = Deduplicator::new(self.config.dedup);
        let outcome = deduplicator.deduplicate(store, &self.layout.processed_dir());

        let mut membership: BTreeMap<PathBuf, (String, bool)> = BTreeMap::new();
        for group in &outcome.groups {
            for member in &group.members {
                membership.insert(
                    member.clone(),
                    (group.id.clone(), *member == group.survivor),
                );
            }
        }
        let corrupt: BTreeSet<PathBuf> = outcome.corrupt.iter().map(|c| c.path.clone()).collect();

        let rows: Vec<DedupRow> = store
            .iter()
            .map(|record| {
                let (group_id, survivor) = match membership.get(&record.canonical_path) {
                    Some((id, survivor)) => (Some(id.clone()), *survivor),
                    None => (None, false),
                };
                let excluded = if corrupt.contains(&record.canonical_path) {
                    Some(ExclusionReason::Corrupt)
                } else if group_id.is_some() && !survivor {
                    Some(ExclusionReason::Duplicate)
                } else {
                    None
                };
                DedupRow {
                    run_id: run_id.to_string(),
                    canonical_path: record.canonical_path.clone(),
                    content_fingerprint: record.content_fingerprint.clone(),
                    perceptual_fingerprint: record.perceptual_fingerprint.clone(),
                    group_id,
                    survivor,
                    excluded,
                }
            })
            .collect();
        self.manifests
            .append_rows(run_id, DEDUP_MANIFEST, &rows)
            .map_err(|cause| PipelineError::manifest("dedup", cause))?;

        Ok(outcome)
    }

    /// Rebuild duplicate groups (and the store's fingerprint columns) from a
    /// run's dedup manifest. Returns the groups and the corrupt count.
    pub fn load_dedup(
        &self,
        run_id: &str,
        store: &mut RecordStore,
    ) -> Result<(Vec<DuplicateGroup>, usize), PipelineError> {
        let rows: Vec<DedupRow> = self
            .manifests
            .read_rows(run_id, DEDUP_MANIFEST)
            .map_err(|cause| PipelineError::manifest("dedup", cause))?;

        let mut members: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
        let mut survivors: BTreeMap<String, PathBuf> = BTreeMap::new();
        let mut corrupt = 0usize;
        for row in rows {
            if let Some(record) = store.get_mut(&row.canonical_path) {
                record.content_fingerprint = row.content_fingerprint.clone();
                record.perceptual_fingerprint = row.perceptual_fingerprint.clone();
            }
            match row.group_id {
                Some(group_id) => {
                    if row.survivor {
                        survivors.insert(group_id.clone(), row.canonical_path.clone());
                    }
                    members.entry(group_id).or_default().push(row.canonical_path);
                }
                None => corrupt += 1,
            }
        }

        let mut groups = Vec::new();
        for (id, mut group_members) in members {
            group_members.sort();
            let survivor = survivors
                .get(&id)
                .cloned()
                .unwrap_or_else(|| group_members[0].clone());
            groups.push(DuplicateGroup {
                id,
                members: group_members,
                survivor,
            });
        }
        Ok((groups, corrupt))
    }

    /// Assign groups to splits, persist the split manifest, and optionally
    /// write the hard-linked split tree for survivors.
    pub fn split(
        &self,
        run_id: &str,
        store: &RecordStore,
        groups: &[DuplicateGroup],
        ratios: &[f64],
        seed: u64,
        materialize: bool,
    ) -> Result<SplitManifest, PipelineError> {
        let manifest = splitter::split(store, groups, ratios, seed)?;

        let rows: Vec<SplitRow> = manifest
            .assignments
            .iter()
            .map(|assignment| SplitRow {
                run_id: run_id.to_string(),
                canonical_path: assignment.canonical_path.clone(),
                class_label: assignment.class_label,
                split: assignment.split,
            })
            .collect();
        self.manifests
            .append_rows(run_id, SPLIT_MANIFEST, &rows)
            .map_err(|cause| PipelineError::manifest("split", cause))?;

        if materialize {
            let survivors: BTreeSet<PathBuf> =
                groups.iter().map(|g| g.survivor.clone()).collect();
            let linked = splitter::materialize(
                &manifest,
                &survivors,
                &self.layout.processed_dir(),
                &self.layout.splits_dir(),
            )?;
            info!(linked, "materialized split tree");
        }

        Ok(manifest)
    }

    /// The full pipeline in fixed order. Always returns a summary; a failed
    /// run carries the error that stopped it alongside the counts gathered
    /// up to that point.
    pub fn run(
        &self,
        ratios: &[f64],
        seed: u64,
        materialize: bool,
    ) -> (RunSummary, Option<PipelineError>) {
        let mut summary = RunSummary::default();

        let fetch = match self.fetch_all() {
            Ok(outcome) => outcome,
            Err(error) => return (summary, Some(error)),
        };
        summary.staged_sources = fetch.staged.iter().map(|(name, _)| name.clone()).collect();
        summary.failed_sources = fetch
            .failures
            .iter()
            .map(|(name, error)| (name.clone(), error.to_string()))
            .collect();

        let (run_id, mut store) = match self.normalize() {
            Ok(result) => result,
            Err(error) => return (summary, Some(error)),
        };
        summary.run_id = run_id.clone();
        summary.normalized = store.len();

        let outcome = match self.dedup(&run_id, &mut store) {
            Ok(outcome) => outcome,
            Err(error) => return (summary, Some(error)),
        };
        summary.duplicate_groups = outcome.groups.len();
        summary.excluded_duplicate = outcome.excluded_duplicates();
        summary.excluded_corrupt = outcome.corrupt.len();

        match self.split(&run_id, &store, &outcome.groups, ratios, seed, materialize) {
            Ok(manifest) => {
                summary.split_counts = manifest.counts();
                (summary, None)
            }
            Err(error) => (summary, Some(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ArchiveFormat, ClassMappingRules, RetryPolicy, SourceDescriptor, SourceLayout,
    };
    use image::{ImageBuffer, Rgb};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    /// Build an image whose 64-bit gradient hash is exactly `row_bits`
    /// repeated per row: column brightness steps up for a 1 bit and down
    /// for a 0 bit, so distinct bit patterns are far apart in Hamming
    /// distance.
    fn pattern_image(row_bits: [bool; 8]) -> ImageBuffer<Rgb<u8>, Vec<u8>> {
        let mut levels = [0u8; 9];
        levels[0] = 128;
        for (index, bit) in row_bits.iter().enumerate() {
            let step: i16 = if *bit { 14 } else { -14 };
            levels[index + 1] = (levels[index] as i16 + step) as u8;
        }
        ImageBuffer::from_fn(72, 64, move |x, _| {
            let level = levels[(x / 8) as usize];
            Rgb([level, level, level])
        })
    }

    const HEALTHY_PATTERNS: [[bool; 8]; 4] = [
        [true, true, true, true, true, true, true, true],
        [false, false, false, false, false, false, false, false],
        [true, true, true, true, false, false, false, false],
        [false, false, false, false, true, true, true, true],
    ];
    const UNHEALTHY_PATTERNS: [[bool; 8]; 3] = [
        [true, false, true, false, true, false, true, false],
        [false, true, false, true, false, true, false, true],
        [true, true, false, false, true, true, false, false],
    ];

    fn source(name: &str) -> SourceDescriptor {
        SourceDescriptor {
            name: name.to_string(),
            origin: format!("http://127.0.0.1:9/{name}.zip"),
            archive: ArchiveFormat::Zip,
            layout: SourceLayout::MegaPlant,
            checksum: None,
            expected_size: None,
            rules: ClassMappingRules::default(),
        }
    }

    /// Stage a source tree offline: 4 healthy images, 3 distinct unhealthy
    /// images plus one byte-identical duplicate of the first.
    fn stage_corpus(layout: &DataLayout, name: &str) {
        let staging = layout.staging_dir(name);
        for (index, bits) in HEALTHY_PATTERNS.iter().enumerate() {
            let dir = staging.join("healthy");
            fs::create_dir_all(&dir).unwrap();
            pattern_image(*bits)
                .save(dir.join(format!("h_{index}.png")))
                .unwrap();
        }
        for (index, bits) in UNHEALTHY_PATTERNS.iter().enumerate() {
            let dir = staging.join("unhealthy");
            fs::create_dir_all(&dir).unwrap();
            pattern_image(*bits)
                .save(dir.join(format!("u_{index}.png")))
                .unwrap();
        }
        let original = staging.join("unhealthy/u_0.png");
        fs::copy(&original, staging.join("unhealthy/u_copy.png")).unwrap();
    }

    fn controller(data_root: &Path, sources: Vec<SourceDescriptor>) -> PipelineController {
        let config = PipelineConfig {
            sources,
            retry: RetryPolicy {
                max_attempts: 1,
                base_delay_ms: 1,
                request_timeout_secs: 2,
            },
            ..PipelineConfig::default()
        };
        PipelineController::new(config, DataLayout::new(data_root))
    }

    #[test]
    fn test_stage_chain_persists_and_reloads_manifests() {
        let data = TempDir::new().unwrap();
        let ctl = controller(data.path(), vec![source("local")]);
        stage_corpus(ctl.layout(), "local");

        let (run_id, mut store) = ctl.normalize().unwrap();
        assert_eq!(store.len(), 8);
        assert_eq!(ctl.manifests().latest_run().unwrap(), run_id);

        let outcome = ctl.dedup(&run_id, &mut store).unwrap();
        assert_eq!(outcome.groups.len(), 7);
        assert_eq!(outcome.excluded_duplicates(), 1);
        assert!(outcome.corrupt.is_empty());

        let manifest = ctl
            .split(&run_id, &store, &outcome.groups, &[0.5, 0.5], 1, false)
            .unwrap();
        assert_eq!(manifest.len(), 8);

        // A later stage can be re-run against the persisted manifests alone.
        let mut reloaded = ctl.load_normalized(&run_id).unwrap();
        let (groups, corrupt) = ctl.load_dedup(&run_id, &mut reloaded).unwrap();
        assert_eq!(corrupt, 0);
        assert_eq!(groups, outcome.groups);
        for record in reloaded.iter() {
            assert!(record.content_fingerprint.is_some());
        }

        let replayed = splitter::split(&reloaded, &groups, &[0.5, 0.5], 1).unwrap();
        assert_eq!(replayed, manifest);
    }

    #[test]
    fn test_duplicate_pair_shares_group_and_split() {
        let data = TempDir::new().unwrap();
        let ctl = controller(data.path(), vec![source("local")]);
        stage_corpus(ctl.layout(), "local");

        let (run_id, mut store) = ctl.normalize().unwrap();
        let outcome = ctl.dedup(&run_id, &mut store).unwrap();

        let pair: Vec<_> = outcome
            .groups
            .iter()
            .filter(|g| !g.is_singleton())
            .collect();
        assert_eq!(pair.len(), 1);
        assert_eq!(pair[0].members.len(), 2);

        let manifest = ctl
            .split(&run_id, &store, &outcome.groups, &[0.5, 0.5], 9, false)
            .unwrap();
        let splits: BTreeSet<_> = pair[0]
            .members
            .iter()
            .map(|m| manifest.split_of(m).unwrap())
            .collect();
        assert_eq!(splits.len(), 1);
    }

    #[test]
    fn test_run_isolates_failed_source_and_reports_summary() {
        let data = TempDir::new().unwrap();
        let ctl = controller(data.path(), vec![source("local"), source("offline")]);
        let layout = ctl.layout().clone();

        stage_corpus(&layout, "local");
        // Make the staged source pass fetch without touching the network.
        let staging = layout.staging_dir("local");
        fs::write(staging.join("local.zip"), b"archive bytes").unwrap();
        let checksum = {
            use sha2::{Digest, Sha256};
            let mut hasher = Sha256::new();
            hasher.update(b"archive bytes");
            format!("{:x}", hasher.finalize())
        };
        fs::write(staging.join(".staged"), checksum).unwrap();

        let (summary, error) = ctl.run(&[0.5, 0.5], 42, false);
        assert!(error.is_none(), "run failed: {error:?}");
        assert_eq!(summary.staged_sources, vec!["local".to_string()]);
        assert_eq!(summary.failed_sources.len(), 1);
        assert_eq!(summary.failed_sources[0].0, "offline");
        assert_eq!(summary.normalized, 8);
        assert_eq!(summary.excluded_duplicate, 1);
        assert_eq!(summary.split_counts.values().sum::<usize>(), 8);

        let rendered = summary.to_string();
        assert!(rendered.contains("offline"));
        assert!(rendered.contains("split totals"));
    }

    #[test]
    fn test_normalize_without_staged_sources_fails() {
        let data = TempDir::new().unwrap();
        let ctl = controller(data.path(), vec![source("ghost")]);
        assert!(matches!(
            ctl.normalize(),
            Err(PipelineError::NothingStaged)
        ));
    }

    #[test]
    fn test_exit_codes_identify_stages() {
        assert_eq!(
            PipelineError::from(ConfigError::UnknownSource("x".into())).exit_code(),
            2
        );
        assert_eq!(PipelineError::NothingStaged.exit_code(), 3);
        assert_eq!(
            PipelineError::from(SplitError::BadRatioCount(4)).exit_code(),
            6
        );
    }
}
