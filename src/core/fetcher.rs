use crate::config::{ArchiveFormat, DataLayout, RetryPolicy, SourceDescriptor};
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::thread;
use thiserror::Error;
use tracing::{info, warn};

/// Per-source marker holding the verified archive checksum; its presence
/// makes re-runs reuse the staged tree instead of re-downloading.
const STAMP_FILE: &str = ".staged";

const USER_AGENT: &str = concat!("megaplant/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum FetchError {
    /// Transient transport failure, surfaced only once the retry budget is
    /// exhausted.
    #[error("network failure fetching '{name}' after {attempts} attempt(s): {cause}")]
    Network {
        name: String,
        attempts: u32,
        #[source]
        cause: reqwest::Error,
    },

    /// Integrity mismatch between the declared and downloaded archive.
    /// Fatal for this source; other sources are unaffected.
    #[error("integrity mismatch for '{name}': expected {expected}, got {actual}")]
    Download {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("archive error for '{name}': {cause}")]
    Archive {
        name: String,
        #[source]
        cause: zip::result::ZipError,
    },

    #[error("failed to build HTTP client: {0}")]
    Client(reqwest::Error),

    #[error("worker pool error: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of fetching all configured sources; failures are isolated per
/// source so one bad archive never aborts the rest.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub staged: Vec<(String, PathBuf)>,
    pub failures: Vec<(String, FetchError)>,
}

impl FetchOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Downloads and unpacks source archives into per-source staging
/// directories, with a bounded retry budget and exponential backoff.
pub struct Fetcher {
    client: reqwest::blocking::Client,
    retry: RetryPolicy,
}

impl Fetcher {
    pub fn new(retry: RetryPolicy) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(std::time::Duration::from_secs(retry.request_timeout_secs))
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self { client, retry })
    }

    /// Stage one source: download (unless already staged and checksum-valid),
    /// verify, unpack. Returns the staging directory. All writes stay inside
    /// `staging/{source}/`.
    pub fn fetch(
        &self,
        descriptor: &SourceDescriptor,
        layout: &DataLayout,
    ) -> Result<PathBuf, FetchError> {
        let staging = layout.staging_dir(&descriptor.name);
        fs::create_dir_all(&staging)?;

        let archive_path = staging.join(archive_file_name(descriptor));
        let stamp = staging.join(STAMP_FILE);

        if stamp.exists() && archive_path.exists() {
            match &descriptor.checksum {
                Some(expected) if sha256_hex(&archive_path)? != expected.to_lowercase() => {
                    warn!(source = %descriptor.name, "staged archive is stale, refetching");
                }
                _ => {
                    info!(source = %descriptor.name, "reusing staged archive");
                    return Ok(staging);
                }
            }
        }

        self.download_with_retry(&descriptor.name, &descriptor.origin, &archive_path)?;
        let checksum = self.verify(descriptor, &archive_path)?;
        self.unpack(descriptor, &archive_path, &staging)?;
        fs::write(&stamp, &checksum)?;

        info!(source = %descriptor.name, dir = %staging.display(), "source staged");
        Ok(staging)
    }

    /// Fetch every source on a bounded worker pool, collecting per-source
    /// results instead of failing fast.
    pub fn fetch_all(
        &self,
        sources: &[SourceDescriptor],
        layout: &DataLayout,
        concurrency: usize,
    ) -> Result<FetchOutcome, FetchError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(concurrency.max(1))
            .build()
            .map_err(|cause| FetchError::Worker(cause.to_string()))?;

        let results: Vec<(String, Result<PathBuf, FetchError>)> = pool.install(|| {
            sources
                .par_iter()
                .map(|descriptor| (descriptor.name.clone(), self.fetch(descriptor, layout)))
                .collect()
        });

        let mut outcome = FetchOutcome::default();
        for (name, result) in results {
            match result {
                Ok(path) => outcome.staged.push((name, path)),
                Err(error) => {
                    warn!(source = %name, %error, "source fetch failed");
                    outcome.failures.push((name, error));
                }
            }
        }
        Ok(outcome)
    }

    fn download_with_retry(&self, name: &str, url: &str, dest: &Path) -> Result<(), FetchError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self.try_download(name, url, dest, attempt);
            match result {
                Ok(()) => return Ok(()),
                Err(error @ FetchError::Network { .. }) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(source = name, attempt, ?delay, %error, "download failed, backing off");
                    thread::sleep(delay);
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn try_download(
        &self,
        name: &str,
        url: &str,
        dest: &Path,
        attempt: u32,
    ) -> Result<(), FetchError> {
        let network = |cause: reqwest::Error| FetchError::Network {
            name: name.to_string(),
            attempts: attempt,
            cause,
        };

        // Download into a scratch file first so an interrupted transfer
        // never masquerades as a staged archive.
        let scratch = dest.with_extension("part");
        let response = self.client.get(url).send().map_err(network)?;
        let mut response = response.error_for_status().map_err(network)?;

        let mut out = File::create(&scratch)?;
        response.copy_to(&mut out).map_err(network)?;
        drop(out);
        fs::rename(&scratch, dest)?;
        Ok(())
    }

    /// Check declared byte size and checksum when present; returns the
    /// archive's actual checksum. A mismatching archive is removed so the
    /// next run re-downloads instead of reusing it.
    fn verify(
        &self,
        descriptor: &SourceDescriptor,
        archive_path: &Path,
    ) -> Result<String, FetchError> {
        if let Some(expected) = descriptor.expected_size {
            let actual = fs::metadata(archive_path)?.len();
            if actual != expected {
                fs::remove_file(archive_path)?;
                return Err(FetchError::Download {
                    name: descriptor.name.clone(),
                    expected: format!("{expected} bytes"),
                    actual: format!("{actual} bytes"),
                });
            }
        }

        let actual = sha256_hex(archive_path)?;
        if let Some(expected) = &descriptor.checksum {
            if actual != expected.to_lowercase() {
                fs::remove_file(archive_path)?;
                return Err(FetchError::Download {
                    name: descriptor.name.clone(),
                    expected: expected.to_lowercase(),
                    actual,
                });
            }
        }
        Ok(actual)
    }

    fn unpack(
        &self,
        descriptor: &SourceDescriptor,
        archive_path: &Path,
        staging: &Path,
    ) -> Result<(), FetchError> {
        match descriptor.archive {
            ArchiveFormat::Zip => {
                let archive = |cause: zip::result::ZipError| FetchError::Archive {
                    name: descriptor.name.clone(),
                    cause,
                };
                let file = File::open(archive_path)?;
                let mut zip = zip::ZipArchive::new(file).map_err(archive)?;
                zip.extract(staging).map_err(archive)?;
                Ok(())
            }
            ArchiveFormat::Plain => Ok(()),
        }
    }
}

fn archive_file_name(descriptor: &SourceDescriptor) -> String {
    descriptor
        .origin
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}.archive", descriptor.name))
}

fn sha256_hex(path: &Path) -> Result<String, std::io::Error> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClassMappingRules, SourceLayout};
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 1,
            request_timeout_secs: 2,
        }
    }

    fn descriptor(name: &str, origin: &str) -> SourceDescriptor {
        SourceDescriptor {
            name: name.to_string(),
            origin: origin.to_string(),
            archive: ArchiveFormat::Zip,
            layout: SourceLayout::MegaPlant,
            checksum: None,
            expected_size: None,
            rules: ClassMappingRules::default(),
        }
    }

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, bytes) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_sha256_of_known_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("content.txt");
        fs::write(&path, b"Hello, World!").unwrap();
        assert_eq!(
            sha256_hex(&path).unwrap(),
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"
        );
    }

    #[test]
    fn test_archive_file_name_from_origin() {
        let desc = descriptor("diamos", "https://example.com/datasets/leaves.zip");
        assert_eq!(archive_file_name(&desc), "leaves.zip");

        let desc = descriptor("pv", "https://example.com/download/pv-dataset");
        assert_eq!(archive_file_name(&desc), "pv-dataset");
    }

    #[test]
    fn test_checksum_mismatch_is_a_download_error_and_discards_archive() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("leaves.zip");
        write_zip(&archive, &[("healthy/a.jpg", b"pixels")]);

        let mut desc = descriptor("diamos", "http://localhost/leaves.zip");
        desc.checksum = Some("0".repeat(64));

        let fetcher = Fetcher::new(quick_retry()).unwrap();
        let result = fetcher.verify(&desc, &archive);
        match result {
            Err(FetchError::Download { name, expected, .. }) => {
                assert_eq!(name, "diamos");
                assert_eq!(expected, "0".repeat(64));
            }
            other => panic!("expected download error, got {other:?}"),
        }
        assert!(!archive.exists(), "bad archive must not be reused");
    }

    #[test]
    fn test_unpack_zip_into_staging() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("leaves.zip");
        write_zip(
            &archive,
            &[
                ("healthy/a.jpg", b"pixels a"),
                ("unhealthy/b.jpg", b"pixels b"),
            ],
        );

        let desc = descriptor("megaplant", "http://localhost/leaves.zip");
        let fetcher = Fetcher::new(quick_retry()).unwrap();
        fetcher.unpack(&desc, &archive, dir.path()).unwrap();

        assert_eq!(
            fs::read(dir.path().join("healthy/a.jpg")).unwrap(),
            b"pixels a"
        );
        assert_eq!(
            fs::read(dir.path().join("unhealthy/b.jpg")).unwrap(),
            b"pixels b"
        );
    }

    #[test]
    fn test_unreachable_origin_exhausts_retry_budget() {
        let data = TempDir::new().unwrap();
        let layout = DataLayout::new(data.path());
        // Port 9 is the discard service; nothing listens there.
        let desc = descriptor("dead", "http://127.0.0.1:9/leaves.zip");

        let fetcher = Fetcher::new(quick_retry()).unwrap();
        match fetcher.fetch(&desc, &layout) {
            Err(FetchError::Network { name, attempts, .. }) => {
                assert_eq!(name, "dead");
                assert_eq!(attempts, 2);
            }
            other => panic!("expected network error, got {other:?}"),
        }
    }

    #[test]
    fn test_staged_checksum_valid_archive_is_reused_without_network() {
        let data = TempDir::new().unwrap();
        let layout = DataLayout::new(data.path());

        // Pre-stage the archive; the origin is unreachable, so success
        // proves no download was attempted.
        let mut desc = descriptor("prestaged", "http://127.0.0.1:9/leaves.zip");
        let staging = layout.staging_dir(&desc.name);
        fs::create_dir_all(&staging).unwrap();
        let archive = staging.join("leaves.zip");
        write_zip(&archive, &[("healthy/a.jpg", b"pixels")]);
        let checksum = sha256_hex(&archive).unwrap();
        fs::write(staging.join(STAMP_FILE), &checksum).unwrap();
        desc.checksum = Some(checksum);

        let fetcher = Fetcher::new(quick_retry()).unwrap();
        let staged = fetcher.fetch(&desc, &layout).unwrap();
        assert_eq!(staged, staging);
    }

    #[test]
    fn test_fetch_all_isolates_per_source_failures() {
        let data = TempDir::new().unwrap();
        let layout = DataLayout::new(data.path());

        let mut good = descriptor("good", "http://127.0.0.1:9/leaves.zip");
        let staging = layout.staging_dir(&good.name);
        fs::create_dir_all(&staging).unwrap();
        let archive = staging.join("leaves.zip");
        write_zip(&archive, &[("healthy/a.jpg", b"pixels")]);
        let checksum = sha256_hex(&archive).unwrap();
        fs::write(staging.join(STAMP_FILE), &checksum).unwrap();
        good.checksum = Some(checksum);

        let bad = descriptor("bad", "http://127.0.0.1:9/leaves.zip");

        let fetcher = Fetcher::new(quick_retry()).unwrap();
        let outcome = fetcher
            .fetch_all(&[good, bad], &layout, 2)
            .unwrap();

        assert_eq!(outcome.staged.len(), 1);
        assert_eq!(outcome.staged[0].0, "good");
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].0, "bad");
        assert!(!outcome.is_complete());
    }
}
