use std::collections::BTreeSet;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use md5::{Digest, Md5};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::alleles::{VariantAnnotationClient, possible_alleles_table};
use crate::associations::build_index;
use crate::backend::{PrsBackend, StudyDescriptor, UpdateKind};
use crate::cache::{DEFAULT_SWEEP_MAX_AGE, ResponseCache};
use crate::chunk::{
    DEFAULT_PAGE_SIZE, fetch_bundle_pages, fetch_merged_pages, group_sites_by_chromosome,
};
use crate::config::{ResolvedRun, validate_upload_cohort};
use crate::domain::{RefGenome, SiteKey, SuperPopulation, ValueKind};
use crate::error::GwasError;
use crate::input::{file_md5, open_table};
use crate::retry::{RetryPolicy, with_retry};
use crate::store::WorkingStore;

/// Reference downloads without a server-side update probe are refetched
/// after this long.
pub const REFERENCE_MAX_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug, Serialize)]
pub struct RefreshSummary {
    pub ref_gen: RefGenome,
    pub written: Vec<String>,
    pub reused: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct FilteredSummary {
    pub studies: usize,
    pub sites: usize,
    pub file_hash: String,
    pub artifacts: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct IngestSummary {
    pub file_hash: String,
    pub sites: usize,
    pub studies: usize,
    pub populations: Vec<SuperPopulation>,
    pub artifacts: Vec<String>,
}

/// Orchestrates the three flows: refreshing the full reference downloads,
/// fetching filter-scoped associations, and ingesting an uploaded GWAS
/// table. Backends are injected so tests can run against mocks.
pub struct Engine<B, V> {
    store: WorkingStore,
    backend: B,
    annotations: V,
    cache: ResponseCache,
    retry: RetryPolicy,
}

impl<B: PrsBackend, V: VariantAnnotationClient> Engine<B, V> {
    pub fn new(
        store: WorkingStore,
        backend: B,
        annotations: V,
        cache: ResponseCache,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            backend,
            annotations,
            cache,
            retry,
        }
    }

    pub fn store(&self) -> &WorkingStore {
        &self.store
    }

    fn start_run(&self) -> Result<(), GwasError> {
        self.store.ensure_roots()?;
        self.cache.sweep(DEFAULT_SWEEP_MAX_AGE);
        let stats = self.cache.stats();
        info!(
            "response cache: {} lookup entries, {} submission entries, {} bytes",
            stats.lookup_entries, stats.submission_entries, stats.total_bytes
        );
        Ok(())
    }

    /// The server's ethnicity list, kept on disk and refetched monthly. A
    /// corrupt local copy is refetched rather than failing the run.
    pub fn cached_ethnicities(&self) -> Result<Vec<String>, GwasError> {
        self.store.ensure_roots()?;
        let path = self.store.ethnicities_path();
        if WorkingStore::file_age(&path).is_some_and(|age| age <= REFERENCE_MAX_AGE) {
            match WorkingStore::read_json::<Vec<String>>(&path) {
                Ok(list) => return Ok(list),
                Err(err) => warn!("local ethnicity list unusable, refetching: {err}"),
            }
        }
        let list = with_retry(&self.retry, || self.backend.ethnicities())?;
        WorkingStore::write_json(&path, &list)?;
        Ok(list)
    }

    /// Brings the full reference downloads up to date for the run's
    /// parameters: the association tree, the study-snp map, the allele
    /// table, plus MAF, percentile and per-population clump tables.
    pub fn refresh_reference_data(&self, run: &ResolvedRun) -> Result<RefreshSummary, GwasError> {
        self.start_run()?;
        let mut summary = RefreshSummary {
            ref_gen: run.ref_gen,
            written: Vec::new(),
            reused: Vec::new(),
        };

        let associations = self.store.all_associations_path(run.ref_gen);
        self.refresh_by_age(&associations, &mut summary, || {
            self.backend.associations_download(run.ref_gen)
        })?;
        let study_snps = self.store.study_snps_path();
        self.refresh_by_age(&study_snps, &mut summary, || self.backend.study_snp_map())?;
        let alleles = self.store.all_possible_alleles_path();
        self.refresh_by_age(&alleles, &mut summary, || {
            self.backend.all_possible_alleles()
        })?;

        let maf_name = run.maf_cohort.maf_name().to_string();
        let maf = self.store.maf_path(&maf_name, run.ref_gen);
        if run.maf_cohort.is_user() {
            if WorkingStore::exists(&maf) {
                summary.reused.push(artifact_name(&maf));
            } else {
                WorkingStore::write_json(&maf, &json!({}))?;
                summary.written.push(artifact_name(&maf));
            }
        } else {
            let kind = UpdateKind::Maf {
                cohort: maf_name.clone(),
                ref_gen: run.ref_gen,
            };
            self.refresh_by_probe(&maf, &kind, &mut summary, || {
                self.backend.maf_download(&maf_name, run.ref_gen)
            })?;

            let cohort = run.percentiles_cohort().to_string();
            let percentiles = self.store.percentiles_path(&cohort);
            let kind = UpdateKind::Percentiles {
                cohort: cohort.clone(),
            };
            self.refresh_by_probe(&percentiles, &kind, &mut summary, || {
                self.backend.percentiles_download(&cohort)
            })?;
        }

        for super_pop in SuperPopulation::ALL {
            let clumps = self.store.clumps_path(super_pop, run.ref_gen);
            let kind = UpdateKind::Clumps {
                ref_gen: run.ref_gen,
                super_pop,
            };
            self.refresh_by_probe(&clumps, &kind, &mut summary, || {
                self.backend.clumps_download(run.ref_gen, super_pop)
            })?;
        }

        info!(
            "reference refresh complete: {} written, {} reused",
            summary.written.len(),
            summary.reused.len()
        );
        Ok(summary)
    }

    /// Fetches associations and every supporting table for the run's study
    /// filters, writing one hash-keyed artifact set.
    pub fn fetch_filtered_associations(
        &self,
        run: &ResolvedRun,
    ) -> Result<FilteredSummary, GwasError> {
        self.start_run()?;
        let descriptors = self.resolve_study_descriptors(run)?;
        if descriptors.is_empty() {
            return Err(GwasError::NoMatchingStudies);
        }
        info!("fetching associations for {} studies", descriptors.len());

        let hash = filter_hash(run);
        let mut artifacts = Vec::new();

        let sexes = run.filters.sexes.clone().unwrap_or_default();
        let value_types = run.filters.value_types.clone().unwrap_or_default();
        let bundle = fetch_bundle_pages(&descriptors, DEFAULT_PAGE_SIZE, &self.retry, |page| {
            self.backend
                .associations_for_studies(run.ref_gen, page, &sexes, &value_types)
        })?;
        let sites = bundle.site_keys();
        self.write_artifact(
            &self.store.filtered_associations_path(&hash),
            &bundle,
            &mut artifacts,
        )?;

        let clumps = self.clumps_by_chromosome(run.ref_gen, run.super_pop, &sites)?;
        self.write_artifact(&self.store.clumps_hashed_path(&hash), &clumps, &mut artifacts)?;

        if run.maf_cohort.is_user() {
            warn!("user cohort selected, writing an empty MAF table");
            self.write_artifact(
                &self.store.maf_hashed_path(&hash),
                &json!({}),
                &mut artifacts,
            )?;
        } else {
            let maf = self.maf_by_chromosome(run.maf_cohort.maf_name(), run.ref_gen, &sites)?;
            self.write_artifact(&self.store.maf_hashed_path(&hash), &maf, &mut artifacts)?;
        }

        let study_snps = fetch_merged_pages(&descriptors, DEFAULT_PAGE_SIZE, &self.retry, |page| {
            self.backend
                .study_snps_for_studies(page)
                .map(Value::Object)
        })?;
        self.write_artifact(
            &self.store.study_snps_hashed_path(&hash),
            &study_snps,
            &mut artifacts,
        )?;

        if !run.maf_cohort.is_user() {
            let cohort = run.percentiles_cohort();
            let percentiles =
                fetch_merged_pages(&descriptors, DEFAULT_PAGE_SIZE, &self.retry, |page| {
                    self.backend
                        .percentiles_for_studies(cohort, page)
                        .map(Value::Object)
                })?;
            self.write_artifact(
                &self.store.percentiles_hashed_path(&hash),
                &percentiles,
                &mut artifacts,
            )?;
        }

        let alleles = possible_alleles_table(&sites, &self.annotations);
        self.write_artifact(
            &self.store.possible_alleles_hashed_path(&hash),
            &alleles,
            &mut artifacts,
        )?;

        Ok(FilteredSummary {
            studies: descriptors.len(),
            sites: sites.len(),
            file_hash: hash,
            artifacts,
        })
    }

    /// Ingests an uploaded GWAS summary table and writes the artifact set
    /// downstream scoring needs, keyed by the file's content hash.
    pub fn ingest_gwas(
        &self,
        path: &Utf8Path,
        gwas_ref_gen: RefGenome,
        value_kind: ValueKind,
        run: &ResolvedRun,
    ) -> Result<IngestSummary, GwasError> {
        self.start_run()?;
        validate_upload_cohort(path, &run.maf_cohort)?;
        let hash = file_md5(path)?;

        let reader = open_table(path)?;
        let mut index = build_index(reader, value_kind, run.super_pop, &self.annotations)?;

        if gwas_ref_gen != run.ref_gen {
            let rsids: Vec<SiteKey> = index
                .bundle
                .associations
                .values()
                .filter_map(|record| record.original_rsid.as_deref())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .filter_map(|rsid| rsid.parse().ok())
                .filter(SiteKey::is_rsid)
                .collect();
            if !rsids.is_empty() {
                info!(
                    "remapping {} rsIDs from {gwas_ref_gen} to {}",
                    rsids.len(),
                    run.ref_gen
                );
                let remap = with_retry(&self.retry, || {
                    self.backend.snp_position_remap(&rsids, run.ref_gen)
                })?;
                let tree = std::mem::take(&mut index.bundle.associations);
                for (site, mut record) in tree {
                    let target = record
                        .original_rsid
                        .as_deref()
                        .and_then(|rsid| remap.get(rsid));
                    match target {
                        Some(position) => {
                            record.pos = position.as_str().to_string();
                            index.bundle.associations.insert(position.clone(), record);
                        }
                        // no position in the target genome: keep the
                        // reported coordinate
                        None => {
                            index.bundle.associations.insert(site, record);
                        }
                    }
                }
            }
        }

        let mut artifacts = Vec::new();
        self.write_artifact(
            &self.store.gwas_associations_path(&hash),
            &index.bundle,
            &mut artifacts,
        )?;

        let sites = index.bundle.site_keys();
        let mut clumps = Map::new();
        for super_pop in &index.preferred_populations {
            let per_pop = self.clumps_by_chromosome(run.ref_gen, *super_pop, &sites)?;
            clumps.insert(super_pop.to_string(), Value::Object(per_pop));
        }
        self.write_artifact(&self.store.clumps_hashed_path(&hash), &clumps, &mut artifacts)?;

        if run.maf_cohort.is_user() {
            warn!("user cohort selected, writing an empty MAF table");
            self.write_artifact(
                &self.store.maf_hashed_path(&hash),
                &json!({}),
                &mut artifacts,
            )?;
        } else {
            let maf = self.maf_by_chromosome(run.maf_cohort.maf_name(), run.ref_gen, &sites)?;
            self.write_artifact(&self.store.maf_hashed_path(&hash), &maf, &mut artifacts)?;
        }

        self.write_artifact(
            &self.store.study_snps_hashed_path(&hash),
            &index.study_snps,
            &mut artifacts,
        )?;

        let alleles = possible_alleles_table(&sites, &self.annotations);
        self.write_artifact(
            &self.store.possible_alleles_hashed_path(&hash),
            &alleles,
            &mut artifacts,
        )?;

        Ok(IngestSummary {
            file_hash: hash,
            sites: sites.len(),
            studies: index.bundle.study_metadata.len(),
            populations: index.preferred_populations.iter().copied().collect(),
            artifacts,
        })
    }

    /// Turns the run's filters and explicit IDs into one descriptor list.
    /// Filter matches carry their trait from the response map; explicit IDs
    /// the filters already matched are not requested twice.
    fn resolve_study_descriptors(
        &self,
        run: &ResolvedRun,
    ) -> Result<Vec<StudyDescriptor>, GwasError> {
        let mut descriptors: Vec<StudyDescriptor> = Vec::new();
        let mut seen: BTreeSet<String> = BTreeSet::new();

        if !run.filters.is_empty() {
            let by_trait = with_retry(&self.retry, || self.backend.studies_by_filter(&run.filters))?;
            for (trait_name, studies) in by_trait {
                for mut descriptor in studies {
                    descriptor.trait_name = trait_name.clone();
                    seen.insert(descriptor.study_id.clone());
                    descriptors.push(descriptor);
                }
            }
        }

        let missing: Vec<String> = run
            .study_ids
            .iter()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        if !missing.is_empty() {
            let found = with_retry(&self.retry, || self.backend.studies_by_id(&missing))?;
            for id in &missing {
                if !found.iter().any(|descriptor| descriptor.study_id == *id) {
                    warn!("study {id} was not found on the server");
                }
            }
            descriptors.extend(found);
        }

        Ok(descriptors)
    }

    fn clumps_by_chromosome(
        &self,
        ref_gen: RefGenome,
        super_pop: SuperPopulation,
        sites: &[SiteKey],
    ) -> Result<Map<String, Value>, GwasError> {
        let mut merged = Map::new();
        for (_, group) in group_sites_by_chromosome(sites) {
            let partial = with_retry(&self.retry, || {
                self.backend.clumping_by_position(ref_gen, super_pop, &group)
            })?;
            merged.extend(partial);
        }
        Ok(merged)
    }

    fn maf_by_chromosome(
        &self,
        cohort: &str,
        ref_gen: RefGenome,
        sites: &[SiteKey],
    ) -> Result<Map<String, Value>, GwasError> {
        let mut merged = Map::new();
        for (chrom, group) in group_sites_by_chromosome(sites) {
            let positions: Vec<String> = group
                .iter()
                .filter_map(|site| site.position().map(str::to_string))
                .collect();
            let partial = with_retry(&self.retry, || {
                self.backend
                    .maf_by_position(cohort, ref_gen, &chrom, &positions)
            })?;
            merged.extend(partial);
        }
        Ok(merged)
    }

    fn refresh_by_age<F>(
        &self,
        path: &Utf8PathBuf,
        summary: &mut RefreshSummary,
        fetch: F,
    ) -> Result<(), GwasError>
    where
        F: FnMut() -> Result<Value, GwasError>,
    {
        let stale = WorkingStore::file_age(path).is_none_or(|age| age > REFERENCE_MAX_AGE);
        if stale {
            let value = with_retry(&self.retry, fetch)?;
            WorkingStore::write_json(path, &value)?;
            summary.written.push(artifact_name(path));
        } else {
            summary.reused.push(artifact_name(path));
        }
        Ok(())
    }

    fn refresh_by_probe<F>(
        &self,
        path: &Utf8PathBuf,
        kind: &UpdateKind,
        summary: &mut RefreshSummary,
        fetch: F,
    ) -> Result<(), GwasError>
    where
        F: FnMut() -> Result<Value, GwasError>,
    {
        let stale = if WorkingStore::exists(path) {
            match (
                self.backend.last_update(kind),
                WorkingStore::modified_date(path),
            ) {
                (Some(server), Some(local)) => server > local,
                (Some(_), None) => true,
                // unreachable server: keep the local copy
                (None, _) => false,
            }
        } else {
            true
        };
        if stale {
            let value = with_retry(&self.retry, fetch)?;
            WorkingStore::write_json(path, &value)?;
            summary.written.push(artifact_name(path));
        } else {
            summary.reused.push(artifact_name(path));
        }
        Ok(())
    }

    fn write_artifact<T: Serialize>(
        &self,
        path: &Utf8PathBuf,
        value: &T,
        artifacts: &mut Vec<String>,
    ) -> Result<(), GwasError> {
        WorkingStore::write_json(path, value)?;
        artifacts.push(artifact_name(path));
        Ok(())
    }
}

fn artifact_name(path: &Utf8Path) -> String {
    path.file_name().unwrap_or(path.as_str()).to_string()
}

/// Content hash tying a filtered artifact set to the exact run parameters
/// that produced it.
fn filter_hash(run: &ResolvedRun) -> String {
    let canonical = json!({
        "refGen": run.ref_gen,
        "superPop": run.super_pop,
        "mafCohort": run.maf_cohort.as_str(),
        "filters": run.filters,
        "studyIDs": run.study_ids,
    });
    let mut hasher = Md5::new();
    hasher.update(canonical.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use crate::backend::StudyFilters;
    use crate::domain::MafCohort;

    use super::*;

    fn run_with(maf_cohort: &str) -> ResolvedRun {
        ResolvedRun {
            ref_gen: RefGenome::Hg19,
            super_pop: SuperPopulation::Eur,
            maf_cohort: maf_cohort.parse::<MafCohort>().unwrap(),
            filters: StudyFilters::default(),
            study_ids: Vec::new(),
        }
    }

    #[test]
    fn filter_hash_is_stable_and_parameter_sensitive() {
        let run = run_with("ukbb");
        assert_eq!(filter_hash(&run), filter_hash(&run));

        let mut other = run_with("ukbb");
        other.ref_gen = RefGenome::Hg38;
        assert_ne!(filter_hash(&run), filter_hash(&other));

        let mut other = run_with("ukbb");
        other.study_ids = vec!["GCST1".to_string()];
        assert_ne!(filter_hash(&run), filter_hash(&other));
    }

    #[test]
    fn artifact_names_are_file_names() {
        let path = Utf8PathBuf::from("/tmp/work/associations_abc.json");
        assert_eq!(artifact_name(&path), "associations_abc.json");
    }
}
