use camino::Utf8Path;
use tracing::debug;

use crate::backend::StudyFilters;
use crate::domain::{MafCohort, RefGenome, SuperPopulation, ValueKind};
use crate::error::GwasError;

/// Study type codes the study search understands: high-impact, large
/// cohort, other.
pub const STUDY_TYPES: [&str; 3] = ["HI", "LC", "O"];

/// Raw run parameters as they arrive from the command line.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub ref_gen: RefGenome,
    pub super_pop: SuperPopulation,
    pub maf_cohort: String,
    pub traits: Option<Vec<String>>,
    pub study_types: Option<Vec<String>>,
    pub ethnicities: Option<Vec<String>>,
    pub sexes: Option<Vec<String>>,
    pub value_types: Option<Vec<ValueKind>>,
    pub study_ids: Vec<String>,
}

/// Validated run parameters, ready for the engine.
#[derive(Debug, Clone)]
pub struct ResolvedRun {
    pub ref_gen: RefGenome,
    pub super_pop: SuperPopulation,
    pub maf_cohort: MafCohort,
    pub filters: StudyFilters,
    pub study_ids: Vec<String>,
}

impl ResolvedRun {
    /// Percentile tables keep the full cohort name, unlike the collapsed
    /// MAF name.
    pub fn percentiles_cohort(&self) -> &str {
        self.maf_cohort.as_str()
    }
}

/// Validates and normalizes run options. `available_ethnicities` is the
/// server's current list; an empty slice skips the ethnicity check (the
/// list is only fetched when ethnicity filters are present).
pub fn resolve(
    options: RunOptions,
    available_ethnicities: &[String],
) -> Result<ResolvedRun, GwasError> {
    let maf_cohort: MafCohort = options.maf_cohort.parse()?;
    let study_types = options
        .study_types
        .map(|raw| normalize_study_types(raw))
        .transpose()?;
    let ethnicities = options
        .ethnicities
        .map(|raw| clean_ethnicities(raw, available_ethnicities, options.study_ids.is_empty()))
        .transpose()?;

    let filters = StudyFilters {
        traits: options.traits,
        study_types,
        ethnicities,
        sexes: options.sexes,
        value_types: options.value_types,
    };
    debug!("resolved run filters: {filters:?}");

    Ok(ResolvedRun {
        ref_gen: options.ref_gen,
        super_pop: options.super_pop,
        maf_cohort,
        filters,
        study_ids: options.study_ids,
    })
}

fn normalize_study_types(raw: Vec<String>) -> Result<Vec<String>, GwasError> {
    raw.into_iter()
        .map(|value| {
            let upper = value.trim().to_uppercase();
            if STUDY_TYPES.contains(&upper.as_str()) {
                Ok(upper)
            } else {
                Err(GwasError::InvalidStudyType(value))
            }
        })
        .collect()
}

/// Lowercases and de-quotes the requested ethnicities and drops the ones
/// the server does not know. An empty intersection is fatal unless explicit
/// study IDs keep the run meaningful anyway.
fn clean_ethnicities(
    raw: Vec<String>,
    available: &[String],
    fatal_when_empty: bool,
) -> Result<Vec<String>, GwasError> {
    let cleaned: Vec<String> = raw
        .into_iter()
        .map(|value| {
            value
                .trim()
                .trim_matches('"')
                .trim_matches('\'')
                .replace('_', " ")
                .to_lowercase()
        })
        .filter(|value| available.is_empty() || available.contains(value))
        .collect();
    if cleaned.is_empty() && fatal_when_empty {
        return Err(GwasError::InvalidEthnicities {
            available: available.join(", "),
        });
    }
    Ok(cleaned)
}

/// The user MAF cohort reads allele frequencies out of the uploaded
/// genotype data itself; a plain .txt summary table carries none, so the
/// combination is rejected up front.
pub fn validate_upload_cohort(file_name: &Utf8Path, cohort: &MafCohort) -> Result<(), GwasError> {
    if cohort.is_user()
        && file_name
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("txt"))
    {
        return Err(GwasError::InvalidCohort(format!(
            "the user cohort requires a vcf upload, not a .txt file: {file_name}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use camino::Utf8PathBuf;

    use super::*;

    fn base_options() -> RunOptions {
        RunOptions {
            maf_cohort: "ukbb".to_string(),
            ..RunOptions::default()
        }
    }

    #[test]
    fn resolve_without_filters_is_empty() {
        let resolved = resolve(base_options(), &[]).unwrap();
        assert!(resolved.filters.is_empty());
        assert_eq!(resolved.maf_cohort.as_str(), "ukbb");
        assert_eq!(resolved.percentiles_cohort(), "ukbb");
    }

    #[test]
    fn study_types_are_uppercased_and_validated() {
        let mut options = base_options();
        options.study_types = Some(vec!["hi".to_string(), "LC".to_string()]);
        let resolved = resolve(options, &[]).unwrap();
        assert_eq!(
            resolved.filters.study_types,
            Some(vec!["HI".to_string(), "LC".to_string()])
        );

        let mut options = base_options();
        options.study_types = Some(vec!["XX".to_string()]);
        assert_matches!(
            resolve(options, &[]).unwrap_err(),
            GwasError::InvalidStudyType(value) if value == "XX"
        );
    }

    #[test]
    fn ethnicities_are_normalized_against_the_server_list() {
        let available = vec!["european".to_string(), "east asian".to_string()];
        let mut options = base_options();
        options.ethnicities = Some(vec![
            "\"European\"".to_string(),
            "East_Asian".to_string(),
            "martian".to_string(),
        ]);
        let resolved = resolve(options, &available).unwrap();
        assert_eq!(
            resolved.filters.ethnicities,
            Some(vec!["european".to_string(), "east asian".to_string()])
        );
    }

    #[test]
    fn empty_ethnicity_intersection_is_fatal_without_study_ids() {
        let available = vec!["european".to_string()];
        let mut options = base_options();
        options.ethnicities = Some(vec!["martian".to_string()]);
        assert_matches!(
            resolve(options, &available).unwrap_err(),
            GwasError::InvalidEthnicities { available } if available == "european"
        );

        let mut options = base_options();
        options.ethnicities = Some(vec!["martian".to_string()]);
        options.study_ids = vec!["GCST1".to_string()];
        let resolved = resolve(options, &available).unwrap();
        assert_eq!(resolved.filters.ethnicities, Some(Vec::new()));
    }

    #[test]
    fn invalid_cohort_is_rejected() {
        let mut options = base_options();
        options.maf_cohort = "  ".to_string();
        assert_matches!(
            resolve(options, &[]).unwrap_err(),
            GwasError::InvalidCohort(_)
        );
    }

    #[test]
    fn user_cohort_rejects_txt_uploads() {
        let cohort: MafCohort = "user".parse().unwrap();
        let err = validate_upload_cohort(&Utf8PathBuf::from("summary.txt"), &cohort).unwrap_err();
        assert_matches!(err, GwasError::InvalidCohort(_));
        validate_upload_cohort(&Utf8PathBuf::from("genome.vcf"), &cohort).unwrap();

        let ukbb: MafCohort = "ukbb".parse().unwrap();
        validate_upload_cohort(&Utf8PathBuf::from("summary.txt"), &ukbb).unwrap();
    }
}
