use crate::config::DedupSettings;
use crate::record::{DuplicateGroup, RecordStore};
use image::ImageReader;
use image_hasher::{HashAlg, HasherConfig, Hasher, ImageHash};
use indicatif::ProgressBar;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use thiserror::Error;
use tracing::{info, warn};

/// Per-file failure during fingerprinting. Never aborts the scan: the file is
/// excluded from grouping and reported in the run summary.
#[derive(Debug, Clone, Error)]
#[error("corrupt or unreadable file '{path}': {reason}")]
pub struct CorruptFile {
    pub path: PathBuf,
    pub reason: String,
}

/// Result of a full dedup pass: groups partition every readable record
/// (unique images form singleton groups); corrupt records belong to no group.
#[derive(Debug, Clone, Default)]
pub struct DedupOutcome {
    pub groups: Vec<DuplicateGroup>,
    pub corrupt: Vec<CorruptFile>,
}

impl DedupOutcome {
    /// Number of records excluded as non-survivors.
    pub fn excluded_duplicates(&self) -> usize {
        self.groups.iter().map(|g| g.members.len() - 1).sum()
    }

    pub fn group_of(&self, canonical_path: &Path) -> Option<&DuplicateGroup> {
        self.groups
            .iter()
            .find(|g| g.members.iter().any(|m| m == canonical_path))
    }
}

/// Partitions the normalized corpus into duplicate groups with two-tier
/// detection: BLAKE3 content fingerprints for exact duplicates, then a
/// 64-bit gradient perceptual hash for near-duplicates, bucketed by the hash
/// prefix so the pairwise work stays near-linear in corpus size.
pub struct Deduplicator {
    settings: DedupSettings,
}

impl Deduplicator {
    pub fn new(settings: DedupSettings) -> Self {
        Self { settings }
    }

    pub fn deduplicate(&self, store: &mut RecordStore, processed_root: &Path) -> DedupOutcome {
        let mut corrupt = Vec::new();

        self.compute_content_fingerprints(store, processed_root, &mut corrupt);

        // Exact-equality classes; corrupt records carry no fingerprint and
        // never enter a class.
        let mut classes: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
        for record in store.iter() {
            if let Some(fingerprint) = &record.content_fingerprint {
                classes
                    .entry(fingerprint.clone())
                    .or_default()
                    .push(record.canonical_path.clone());
            }
        }

        let rep_hashes =
            self.compute_perceptual_fingerprints(store, processed_root, &classes, &mut corrupt);
        classes.retain(|key, _| rep_hashes.contains_key(key));

        let groups = self.merge_near_duplicates(store, &classes, &rep_hashes);

        info!(
            groups = groups.len(),
            excluded_duplicates = groups.iter().map(|g| g.members.len() - 1).sum::<usize>(),
            excluded_corrupt = corrupt.len(),
            "deduplication complete"
        );
        DedupOutcome { groups, corrupt }
    }

    /// Hash every file in parallel; results drain through a channel into this
    /// thread, the single writer of the record store.
    fn compute_content_fingerprints(
        &self,
        store: &mut RecordStore,
        processed_root: &Path,
        corrupt: &mut Vec<CorruptFile>,
    ) {
        let paths: Vec<PathBuf> = store.iter().map(|r| r.canonical_path.clone()).collect();
        let root = processed_root.to_path_buf();
        let bar = ProgressBar::new(paths.len() as u64);

        let (tx, rx) = mpsc::channel::<(PathBuf, Result<String, String>)>();
        let producer = thread::spawn(move || {
            paths.par_iter().for_each_with(tx, |tx, relative| {
                let result = content_fingerprint(&root.join(relative));
                let _ = tx.send((relative.clone(), result));
            });
        });

        for (relative, result) in rx {
            match result {
                Ok(fingerprint) => {
                    if let Some(record) = store.get_mut(&relative) {
                        record.content_fingerprint = Some(fingerprint);
                    }
                }
                Err(reason) => {
                    warn!(path = %relative.display(), %reason, "excluding unreadable file");
                    corrupt.push(CorruptFile {
                        path: relative,
                        reason,
                    });
                }
            }
            bar.inc(1);
        }
        bar.finish_and_clear();
        let _ = producer.join();
    }

    /// Perceptual hashes are only needed once per exact-equality class; the
    /// representative is the class's first member in canonical order. A class
    /// whose representative cannot be decoded is corrupt as a whole, since
    /// all members share the same bytes.
    fn compute_perceptual_fingerprints(
        &self,
        store: &mut RecordStore,
        processed_root: &Path,
        classes: &BTreeMap<String, Vec<PathBuf>>,
        corrupt: &mut Vec<CorruptFile>,
    ) -> BTreeMap<String, ImageHash> {
        let reps: Vec<(String, PathBuf)> = classes
            .iter()
            .map(|(key, members)| (key.clone(), members[0].clone()))
            .collect();
        let root = processed_root.to_path_buf();
        let max_pixels = self.settings.max_pixels;
        let bar = ProgressBar::new(reps.len() as u64);

        type RepResult = (String, PathBuf, Result<ImageHash, String>);
        let (tx, rx) = mpsc::channel::<RepResult>();
        let producer = thread::spawn(move || {
            let hasher = HasherConfig::new().hash_alg(HashAlg::Gradient).to_hasher();
            reps.par_iter().for_each_with(tx, |tx, (key, relative)| {
                let result = perceptual_fingerprint(&root.join(relative), &hasher, max_pixels);
                let _ = tx.send((key.clone(), relative.clone(), result));
            });
        });

        let mut rep_hashes = BTreeMap::new();
        for (key, relative, result) in rx {
            match result {
                Ok(hash) => {
                    if let Some(record) = store.get_mut(&relative) {
                        record.perceptual_fingerprint = Some(hash.to_base64());
                    }
                    rep_hashes.insert(key, hash);
                }
                Err(reason) => {
                    for member in &classes[&key] {
                        warn!(path = %member.display(), %reason, "excluding undecodable file");
                        corrupt.push(CorruptFile {
                            path: member.clone(),
                            reason: reason.clone(),
                        });
                    }
                }
            }
            bar.inc(1);
        }
        bar.finish_and_clear();
        let _ = producer.join();
        rep_hashes
    }

    /// Bucket class representatives by the leading hash byte, compare pairs
    /// within each bucket (one worker per bucket), and merge classes whose
    /// representatives fall within the Hamming threshold.
    fn merge_near_duplicates(
        &self,
        store: &RecordStore,
        classes: &BTreeMap<String, Vec<PathBuf>>,
        rep_hashes: &BTreeMap<String, ImageHash>,
    ) -> Vec<DuplicateGroup> {
        let keys: Vec<&String> = rep_hashes.keys().collect();

        let mut buckets: BTreeMap<u8, Vec<usize>> = BTreeMap::new();
        for (index, key) in keys.iter().enumerate() {
            let prefix = rep_hashes[*key].as_bytes().first().copied().unwrap_or(0);
            buckets.entry(prefix).or_default().push(index);
        }

        let threshold = self.settings.hamming_threshold;
        let bucket_list: Vec<&Vec<usize>> = buckets.values().collect();
        let mut edges: Vec<(usize, usize)> = bucket_list
            .par_iter()
            .flat_map_iter(|indices| {
                let mut local = Vec::new();
                for (position, &a) in indices.iter().enumerate() {
                    for &b in &indices[position + 1..] {
                        if rep_hashes[keys[a]].dist(&rep_hashes[keys[b]]) <= threshold {
                            local.push((a, b));
                        }
                    }
                }
                local.into_iter()
            })
            .collect();
        edges.sort_unstable();

        let mut dsu = DisjointSet::new(keys.len());
        for (a, b) in edges {
            dsu.union(a, b);
        }

        let mut components: BTreeMap<usize, Vec<PathBuf>> = BTreeMap::new();
        for (index, key) in keys.iter().enumerate() {
            let component = dsu.find(index);
            components
                .entry(component)
                .or_default()
                .extend(classes[*key].iter().cloned());
        }

        let mut groups: Vec<DuplicateGroup> = components
            .into_values()
            .map(|mut members| {
                members.sort();
                let survivor = select_survivor(&members, store);
                DuplicateGroup {
                    id: String::new(),
                    members,
                    survivor,
                }
            })
            .collect();
        groups.sort_by(|a, b| a.members[0].cmp(&b.members[0]));
        for (index, group) in groups.iter_mut().enumerate() {
            group.id = format!("grp-{:05}", index + 1);
        }
        groups
    }
}

/// Largest byte size wins; ties go to the lexicographically smallest
/// canonical path. `members` must be sorted.
fn select_survivor(members: &[PathBuf], store: &RecordStore) -> PathBuf {
    let mut best = members[0].clone();
    let mut best_size = store.get(&best).map(|r| r.byte_size).unwrap_or(0);
    for member in &members[1..] {
        let size = store.get(member).map(|r| r.byte_size).unwrap_or(0);
        if size > best_size {
            best = member.clone();
            best_size = size;
        }
    }
    best
}

fn content_fingerprint(path: &Path) -> Result<String, String> {
    let file = File::open(path).map_err(|e| e.to_string())?;
    let mut reader = BufReader::new(file);
    let mut hasher = blake3::Hasher::new();
    std::io::copy(&mut reader, &mut hasher).map_err(|e| e.to_string())?;
    Ok(hasher.finalize().to_hex().to_string())
}

fn perceptual_fingerprint(
    path: &Path,
    hasher: &Hasher,
    max_pixels: u64,
) -> Result<ImageHash, String> {
    let (width, height) = image::image_dimensions(path).map_err(|e| e.to_string())?;
    let pixels = u64::from(width) * u64::from(height);
    if pixels > max_pixels {
        return Err(format!(
            "{}x{} exceeds the {} pixel decode budget",
            width, height, max_pixels
        ));
    }
    let img = ImageReader::open(path)
        .map_err(|e| e.to_string())?
        .decode()
        .map_err(|e| e.to_string())?;
    Ok(hasher.hash_image(&img))
}

/// Union-find with the smallest index as component root, keeping the
/// partition deterministic regardless of edge order.
struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            let root = self.find(self.parent[x]);
            self.parent[x] = root;
        }
        self.parent[x]
    }

    fn union(&mut self, a: usize, b: usize) {
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a != root_b {
            let (low, high) = if root_a < root_b {
                (root_a, root_b)
            } else {
                (root_b, root_a)
            };
            self.parent[high] = low;
        }
    }
}
