use crate::record::{
    split_names, ClassLabel, DuplicateGroup, RecordStore, SplitAssignment, SplitManifest,
    SplitName,
};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

const RATIO_SUM_EPSILON: f64 = 1e-6;

#[derive(Debug, Error)]
pub enum SplitError {
    #[error("split ratios must sum to 1.0, but sum to {0}")]
    BadRatioSum(f64),

    #[error("split ratios must be greater than 0.0")]
    NonPositiveRatio,

    #[error("expected 2 or 3 split ratios, got {0}")]
    BadRatioCount(usize),

    #[error(
        "class '{class}' has {groups} duplicate group(s), too few to give each of {splits} splits at least one"
    )]
    Infeasible {
        class: ClassLabel,
        groups: usize,
        splits: usize,
    },

    #[error(
        "split '{split}' deviates from its target for class '{class}' by {deviation:.1} records (tolerance {tolerance:.1})"
    )]
    BalanceExceeded {
        split: SplitName,
        class: ClassLabel,
        deviation: f64,
        tolerance: f64,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Assign duplicate groups to splits, reproducibly for a given seed.
///
/// Groups are atomic: all members land in one split, so no duplicate or
/// near-duplicate can leak across splits. Within each class, groups are
/// shuffled in seeded order and assigned greedily to whichever split is
/// currently furthest below its target share of that class's records, which
/// keeps class balance tight even when group sizes vary. The resulting
/// balance is checked against a tolerance of the class's largest group size,
/// not assumed.
pub fn split(
    store: &RecordStore,
    groups: &[DuplicateGroup],
    ratios: &[f64],
    seed: u64,
) -> Result<SplitManifest, SplitError> {
    validate_ratios(ratios)?;
    let splits = split_names(ratios.len());

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut assignments: Vec<SplitAssignment> = Vec::new();

    for class in ClassLabel::ALL {
        let mut class_groups: Vec<&DuplicateGroup> = groups
            .iter()
            .filter(|g| group_class(g, store) == class)
            .collect();
        if class_groups.is_empty() {
            continue;
        }
        if class_groups.len() < splits.len() {
            return Err(SplitError::Infeasible {
                class,
                groups: class_groups.len(),
                splits: splits.len(),
            });
        }

        class_groups.shuffle(&mut rng);

        let class_total: usize = class_groups.iter().map(|g| g.members.len()).sum();
        let targets: Vec<f64> = ratios.iter().map(|r| r * class_total as f64).collect();
        let mut assigned = vec![0usize; splits.len()];
        let mut group_counts = vec![0usize; splits.len()];
        let mut remaining = class_groups.len();

        for group in &class_groups {
            let empty: Vec<usize> = (0..splits.len())
                .filter(|&i| group_counts[i] == 0)
                .collect();
            // Reserve the tail of the shuffle for splits that would
            // otherwise end up with nothing.
            let chosen = if !empty.is_empty() && remaining <= empty.len() {
                empty[0]
            } else {
                furthest_below_target(&targets, &assigned)
            };

            assigned[chosen] += group.members.len();
            group_counts[chosen] += 1;
            remaining -= 1;

            for member in &group.members {
                let class_label = store
                    .get(member)
                    .map(|r| r.class_label)
                    .unwrap_or(class);
                assignments.push(SplitAssignment {
                    canonical_path: member.clone(),
                    class_label,
                    split: splits[chosen],
                });
            }
        }

        let max_group = class_groups
            .iter()
            .map(|g| g.members.len())
            .max()
            .unwrap_or(1);
        let tolerance = max_group as f64 + 1.0;
        for (index, split) in splits.iter().enumerate() {
            let deviation = (assigned[index] as f64 - targets[index]).abs();
            if deviation > tolerance {
                return Err(SplitError::BalanceExceeded {
                    split: *split,
                    class,
                    deviation,
                    tolerance,
                });
            }
        }

        info!(
            class = %class,
            groups = class_groups.len(),
            records = class_total,
            ?assigned,
            "assigned class to splits"
        );
    }

    assignments.sort_by(|a, b| a.canonical_path.cmp(&b.canonical_path));
    Ok(SplitManifest { assignments })
}

/// Write the hard-linked `{split}/{class}/{filename}` tree for survivor
/// records. Returns the number of files linked.
pub fn materialize(
    manifest: &SplitManifest,
    survivors: &BTreeSet<PathBuf>,
    processed_root: &Path,
    splits_root: &Path,
) -> Result<usize, SplitError> {
    let mut linked = 0usize;
    for assignment in &manifest.assignments {
        if !survivors.contains(&assignment.canonical_path) {
            continue;
        }
        let file_name = assignment
            .canonical_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        let dest_dir = splits_root
            .join(assignment.split.as_str())
            .join(assignment.class_label.as_str());
        fs::create_dir_all(&dest_dir)?;

        let src = processed_root.join(&assignment.canonical_path);
        let dest = dest_dir.join(file_name);
        if !dest.exists() {
            if fs::hard_link(&src, &dest).is_err() {
                fs::copy(&src, &dest)?;
            }
        }
        linked += 1;
    }
    Ok(linked)
}

fn validate_ratios(ratios: &[f64]) -> Result<(), SplitError> {
    if !(2..=3).contains(&ratios.len()) {
        return Err(SplitError::BadRatioCount(ratios.len()));
    }
    if ratios.iter().any(|r| *r <= 0.0) {
        return Err(SplitError::NonPositiveRatio);
    }
    let sum: f64 = ratios.iter().sum();
    if (sum - 1.0).abs() > RATIO_SUM_EPSILON {
        return Err(SplitError::BadRatioSum(sum));
    }
    Ok(())
}

/// A group's class is its survivor's; members with a conflicting label (the
/// same photograph contributed under different labels) follow the survivor.
fn group_class(group: &DuplicateGroup, store: &RecordStore) -> ClassLabel {
    let class = store
        .get(&group.survivor)
        .map(|r| r.class_label)
        .unwrap_or(ClassLabel::Healthy);
    let conflicting = group
        .members
        .iter()
        .filter_map(|m| store.get(m))
        .any(|r| r.class_label != class);
    if conflicting {
        warn!(group = %group.id, "duplicate group spans class labels; using the survivor's");
    }
    class
}

fn furthest_below_target(targets: &[f64], assigned: &[usize]) -> usize {
    let mut best = 0;
    let mut best_deficit = f64::MIN;
    for (index, target) in targets.iter().enumerate() {
        let deficit = target - assigned[index] as f64;
        if deficit > best_deficit {
            best_deficit = deficit;
            best = index;
        }
    }
    best
}
