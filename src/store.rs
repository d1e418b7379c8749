use std::fs;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Local, NaiveDate};
use directories::BaseDirs;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{RefGenome, SuperPopulation};
use crate::error::GwasError;

/// On-disk layout for run artifacts and the HTTP response cache.
///
/// Reference downloads and per-run artifacts land in the working directory
/// (`.gwas-am` under the current directory by default); cached responses go
/// to the per-user cache directory so repeated runs in different working
/// directories still share them.
#[derive(Debug, Clone)]
pub struct WorkingStore {
    root: Utf8PathBuf,
    cache_root: Utf8PathBuf,
}

impl WorkingStore {
    pub fn new() -> Result<Self, GwasError> {
        let cwd = std::env::current_dir().map_err(|err| GwasError::Filesystem(err.to_string()))?;
        let root = Utf8PathBuf::from_path_buf(cwd.join(".gwas-am"))
            .map_err(|_| GwasError::Filesystem("invalid working path".to_string()))?;

        let cache_root = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(
                    dirs.home_dir().join(".cache").join("gwas-assoc-manager"),
                )
                .ok()
            })
            .ok_or_else(|| {
                GwasError::Filesystem("unable to resolve cache directory".to_string())
            })?;

        Ok(Self { root, cache_root })
    }

    pub fn new_with_paths(root: Utf8PathBuf, cache_root: Utf8PathBuf) -> Self {
        Self { root, cache_root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn cache_root(&self) -> &Utf8Path {
        &self.cache_root
    }

    pub fn response_cache_root(&self) -> Utf8PathBuf {
        self.cache_root.join("responses")
    }

    pub fn ensure_roots(&self) -> Result<(), GwasError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| GwasError::Filesystem(err.to_string()))?;
        fs::create_dir_all(self.cache_root.as_std_path())
            .map_err(|err| GwasError::Filesystem(err.to_string()))
    }

    // Full reference downloads, one copy per parameter combination.

    pub fn all_associations_path(&self, ref_gen: RefGenome) -> Utf8PathBuf {
        self.root.join(format!("allAssociations_{ref_gen}.json"))
    }

    pub fn study_snps_path(&self) -> Utf8PathBuf {
        self.root.join("traitStudyIDToSnps.json")
    }

    pub fn all_possible_alleles_path(&self) -> Utf8PathBuf {
        self.root.join("allPossibleAlleles.json")
    }

    pub fn maf_path(&self, cohort: &str, ref_gen: RefGenome) -> Utf8PathBuf {
        self.root.join(format!("{cohort}_maf_{ref_gen}.json"))
    }

    pub fn percentiles_path(&self, cohort: &str) -> Utf8PathBuf {
        self.root.join(format!("allPercentiles_{cohort}.json"))
    }

    pub fn clumps_path(&self, super_pop: SuperPopulation, ref_gen: RefGenome) -> Utf8PathBuf {
        self.root.join(format!("{super_pop}_clumps_{ref_gen}.json"))
    }

    pub fn ethnicities_path(&self) -> Utf8PathBuf {
        self.root.join("ethnicities.json")
    }

    // Filtered artifacts, keyed to the run by a content hash.

    pub fn filtered_associations_path(&self, hash: &str) -> Utf8PathBuf {
        self.root.join(format!("associations_{hash}.json"))
    }

    pub fn gwas_associations_path(&self, hash: &str) -> Utf8PathBuf {
        self.root.join(format!("GWASassociations_{hash}.json"))
    }

    pub fn study_snps_hashed_path(&self, hash: &str) -> Utf8PathBuf {
        self.root.join(format!("traitStudyIDToSnps_{hash}.json"))
    }

    pub fn possible_alleles_hashed_path(&self, hash: &str) -> Utf8PathBuf {
        self.root.join(format!("possibleAlleles_{hash}.json"))
    }

    pub fn maf_hashed_path(&self, hash: &str) -> Utf8PathBuf {
        self.root.join(format!("maf_{hash}.json"))
    }

    pub fn percentiles_hashed_path(&self, hash: &str) -> Utf8PathBuf {
        self.root.join(format!("percentiles_{hash}.json"))
    }

    pub fn clumps_hashed_path(&self, hash: &str) -> Utf8PathBuf {
        self.root.join(format!("clumps_{hash}.json"))
    }

    pub fn write_json<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), GwasError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| GwasError::Filesystem(err.to_string()))?;
        }
        let content =
            serde_json::to_vec_pretty(value).map_err(|err| GwasError::Json(err.to_string()))?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(tmp_path.as_std_path(), &content)
            .map_err(|err| GwasError::Filesystem(err.to_string()))?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path())
            .map_err(|err| GwasError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<T, GwasError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| GwasError::Filesystem(format!("{path}: {err}")))?;
        serde_json::from_str(&content).map_err(|err| GwasError::Json(format!("{path}: {err}")))
    }

    pub fn exists(path: &Utf8Path) -> bool {
        path.as_std_path().exists()
    }

    pub fn file_age(path: &Utf8Path) -> Option<Duration> {
        let metadata = fs::metadata(path.as_std_path()).ok()?;
        let modified = metadata.modified().ok()?;
        modified.elapsed().ok()
    }

    /// Local calendar date the file was last written, for comparison against
    /// the server's last-update dates.
    pub fn modified_date(path: &Utf8Path) -> Option<NaiveDate> {
        let metadata = fs::metadata(path.as_std_path()).ok()?;
        let modified = metadata.modified().ok()?;
        Some(DateTime::<Local>::from(modified).date_naive())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn temp_store() -> (tempfile::TempDir, WorkingStore) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().join("work")).unwrap();
        let cache = Utf8PathBuf::from_path_buf(dir.path().join("cache")).unwrap();
        (dir, WorkingStore::new_with_paths(root, cache))
    }

    #[test]
    fn artifact_layout() {
        let (_dir, store) = temp_store();
        assert!(
            store
                .all_associations_path(RefGenome::Hg19)
                .ends_with("allAssociations_hg19.json")
        );
        assert!(
            store
                .clumps_path(SuperPopulation::Eur, RefGenome::Hg38)
                .ends_with("EUR_clumps_hg38.json")
        );
        assert!(
            store
                .maf_path("ukbb", RefGenome::Hg19)
                .ends_with("ukbb_maf_hg19.json")
        );
        assert!(
            store
                .gwas_associations_path("abc123")
                .ends_with("GWASassociations_abc123.json")
        );
        assert!(store.response_cache_root().ends_with("cache/responses"));
    }

    #[test]
    fn json_round_trip_and_modified_date() {
        let (_dir, store) = temp_store();
        store.ensure_roots().unwrap();
        let path = store.ethnicities_path();

        assert!(!WorkingStore::exists(&path));
        assert!(WorkingStore::modified_date(&path).is_none());

        WorkingStore::write_json(&path, &json!(["european", "east asian"])).unwrap();
        let value: Vec<String> = WorkingStore::read_json(&path).unwrap();
        assert_eq!(value, vec!["european", "east asian"]);
        assert_eq!(
            WorkingStore::modified_date(&path),
            Some(Local::now().date_naive())
        );
        assert!(WorkingStore::file_age(&path).unwrap() < Duration::from_secs(60));
    }
}
