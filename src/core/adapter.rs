use super::normalizer::NormalizeError;
use crate::config::SourceDescriptor;
use crate::record::ClassLabel;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// File extensions the pipeline treats as images.
pub const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "gif", "bmp", "tiff"];

/// Maps one source's staged on-disk layout onto the shared class taxonomy.
/// The per-source behavior (subtree filters, folder overrides, default
/// label) comes from the descriptor's [`crate::config::SourceLayout`]
/// variant plus any configured rule extras.
pub struct SourceAdapter<'a> {
    descriptor: &'a SourceDescriptor,
    staging_root: PathBuf,
}

impl<'a> SourceAdapter<'a> {
    pub fn new(descriptor: &'a SourceDescriptor, staging_root: impl Into<PathBuf>) -> Self {
        Self {
            descriptor,
            staging_root: staging_root.into(),
        }
    }

    pub fn descriptor(&self) -> &SourceDescriptor {
        self.descriptor
    }

    /// Lazily enumerate `(raw_path, class_label)` pairs for every image file
    /// this source contributes, in sorted traversal order.
    pub fn enumerate(
        &self,
    ) -> impl Iterator<Item = Result<(PathBuf, ClassLabel), NormalizeError>> + '_ {
        WalkDir::new(&self.staging_root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(move |entry| self.visit(entry))
    }

    fn visit(
        &self,
        entry: walkdir::Result<walkdir::DirEntry>,
    ) -> Option<Result<(PathBuf, ClassLabel), NormalizeError>> {
        let entry = match entry {
            Ok(entry) => entry,
            Err(cause) => return Some(Err(NormalizeError::Io(cause.into()))),
        };
        if !entry.file_type().is_file() {
            return None;
        }

        let path = entry.path();
        let ext = path.extension()?.to_str()?.to_lowercase();
        if !IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            return None;
        }

        let relative = path.strip_prefix(&self.staging_root).ok()?;
        if let Some(subtree) = self.descriptor.include_subtree() {
            let inside = relative
                .components()
                .any(|c| c.as_os_str().to_string_lossy().eq_ignore_ascii_case(subtree));
            if !inside {
                return None;
            }
        }

        Some(self.classify(path, relative))
    }

    /// Walk the folder components deepest-first so the most specific folder
    /// name decides the label; fall back to the source's default label.
    fn classify(
        &self,
        path: &Path,
        relative: &Path,
    ) -> Result<(PathBuf, ClassLabel), NormalizeError> {
        for component in relative
            .parent()
            .into_iter()
            .flat_map(|p| p.components())
            .rev()
        {
            let folder = component.as_os_str().to_string_lossy();
            if let Some(label) = self.descriptor.classify_folder(&folder) {
                return Ok((path.to_path_buf(), label));
            }
        }

        if let Some(label) = self.descriptor.default_label() {
            return Ok((path.to_path_buf(), label));
        }

        Err(NormalizeError::UnmappableLabel {
            source_name: self.descriptor.name.clone(),
            path: path.to_path_buf(),
        })
    }
}
