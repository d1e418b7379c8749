use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use clap::ValueEnum;
use regex::Regex;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::GwasError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RefGenome {
    Hg17,
    Hg18,
    #[default]
    Hg19,
    Hg38,
}

impl fmt::Display for RefGenome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefGenome::Hg17 => write!(f, "hg17"),
            RefGenome::Hg18 => write!(f, "hg18"),
            RefGenome::Hg19 => write!(f, "hg19"),
            RefGenome::Hg38 => write!(f, "hg38"),
        }
    }
}

impl FromStr for RefGenome {
    type Err = GwasError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "hg17" => Ok(RefGenome::Hg17),
            "hg18" => Ok(RefGenome::Hg18),
            "hg19" => Ok(RefGenome::Hg19),
            "hg38" => Ok(RefGenome::Hg38),
            _ => Err(GwasError::InvalidRefGenome(value.to_string())),
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    ValueEnum,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum SuperPopulation {
    Afr,
    Amr,
    Eas,
    #[default]
    Eur,
    Sas,
}

impl SuperPopulation {
    pub const ALL: [SuperPopulation; 5] = [
        SuperPopulation::Afr,
        SuperPopulation::Amr,
        SuperPopulation::Eas,
        SuperPopulation::Eur,
        SuperPopulation::Sas,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SuperPopulation::Afr => "AFR",
            SuperPopulation::Amr => "AMR",
            SuperPopulation::Eas => "EAS",
            SuperPopulation::Eur => "EUR",
            SuperPopulation::Sas => "SAS",
        }
    }
}

impl fmt::Display for SuperPopulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SuperPopulation {
    type Err = GwasError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_uppercase().as_str() {
            "AFR" => Ok(SuperPopulation::Afr),
            "AMR" => Ok(SuperPopulation::Amr),
            "EAS" => Ok(SuperPopulation::Eas),
            "EUR" => Ok(SuperPopulation::Eur),
            "SAS" => Ok(SuperPopulation::Sas),
            _ => Err(GwasError::InvalidSuperPopulation(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    #[serde(rename = "beta")]
    Beta,
    #[serde(rename = "OR")]
    OddsRatio,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Beta => "beta",
            ValueKind::OddsRatio => "OR",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ValueKind {
    type Err = GwasError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "beta" => Ok(ValueKind::Beta),
            "or" | "odds ratio" | "odds-ratio" => Ok(ValueKind::OddsRatio),
            _ => Err(GwasError::InvalidValueKind(value.to_string())),
        }
    }
}

impl ValueEnum for ValueKind {
    fn value_variants<'a>() -> &'a [Self] {
        &[ValueKind::Beta, ValueKind::OddsRatio]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        match self {
            ValueKind::Beta => Some(clap::builder::PossibleValue::new("beta")),
            ValueKind::OddsRatio => Some(clap::builder::PossibleValue::new("or")),
        }
    }
}

/// Primary variant identifier: either `chr<chrom>:<position>` or an rsID.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SiteKey(String);

impl SiteKey {
    /// Builds a positional key, normalizing the chromosome to carry the
    /// `chr` prefix.
    pub fn from_chrom_pos(chrom: &str, position: &str) -> Self {
        let chrom = chrom.trim();
        let position = position.trim();
        if chrom.starts_with("chr") {
            Self(format!("{chrom}:{position}"))
        } else {
            Self(format!("chr{chrom}:{position}"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_rsid(&self) -> bool {
        self.0.starts_with("rs")
    }

    /// Chromosome component (prefixed form, e.g. `chr7`) for positional keys.
    pub fn chromosome(&self) -> Option<&str> {
        self.0.split_once(':').map(|(chrom, _)| chrom)
    }

    /// Position component for positional keys.
    pub fn position(&self) -> Option<&str> {
        self.0.split_once(':').map(|(_, position)| position)
    }
}

impl fmt::Display for SiteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SiteKey {
    type Err = GwasError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        static RSID: OnceLock<Regex> = OnceLock::new();
        let trimmed = value.trim();
        let rsid = RSID.get_or_init(|| Regex::new(r"^rs\d+$").unwrap());
        if rsid.is_match(trimmed) {
            return Ok(Self(trimmed.to_string()));
        }
        if let Some((chrom, position)) = trimmed.split_once(':') {
            let has_position = !position.is_empty() && position.chars().all(|ch| ch.is_ascii_digit());
            let bare = chrom.strip_prefix("chr").unwrap_or(chrom);
            if !bare.is_empty() && has_position {
                return Ok(Self::from_chrom_pos(chrom, position));
            }
        }
        Err(GwasError::InvalidSiteKey(value.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StudyId(String);

impl StudyId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StudyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The annotation triple distinguishing several effect sets of one study:
/// p-value annotation, beta annotation and the value type the study reported.
/// Canonical text form is `pAnno|bAnno|valueType`, produced only at the
/// serialization boundary.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CompositeKey {
    pub p_value_annotation: String,
    pub beta_annotation: String,
    pub value_type: ValueKind,
}

impl CompositeKey {
    pub fn new(
        p_value_annotation: impl Into<String>,
        beta_annotation: impl Into<String>,
        value_type: ValueKind,
    ) -> Self {
        Self {
            p_value_annotation: p_value_annotation.into(),
            beta_annotation: beta_annotation.into(),
            value_type,
        }
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}",
            self.p_value_annotation, self.beta_annotation, self.value_type
        )
    }
}

impl FromStr for CompositeKey {
    type Err = GwasError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts = value.split('|').collect::<Vec<_>>();
        if parts.len() != 3 {
            return Err(GwasError::InvalidCompositeKey(value.to_string()));
        }
        Ok(Self {
            p_value_annotation: parts[0].to_string(),
            beta_annotation: parts[1].to_string(),
            value_type: parts[2].parse()?,
        })
    }
}

impl Serialize for CompositeKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CompositeKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

/// Key of the study-snp index: `trait|pAnno|bAnno|valueType|studyID`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StudySnpKey {
    pub trait_name: String,
    pub composite: CompositeKey,
    pub study_id: StudyId,
}

impl StudySnpKey {
    pub fn new(trait_name: impl Into<String>, composite: CompositeKey, study_id: StudyId) -> Self {
        Self {
            trait_name: trait_name.into(),
            composite,
            study_id,
        }
    }
}

impl fmt::Display for StudySnpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.trait_name, self.composite, self.study_id)
    }
}

impl FromStr for StudySnpKey {
    type Err = GwasError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts = value.split('|').collect::<Vec<_>>();
        if parts.len() != 5 {
            return Err(GwasError::InvalidStudySnpKey(value.to_string()));
        }
        Ok(Self {
            trait_name: parts[0].to_string(),
            composite: CompositeKey {
                p_value_annotation: parts[1].to_string(),
                beta_annotation: parts[2].to_string(),
                value_type: parts[3].parse()?,
            },
            study_id: StudyId::new(parts[4]),
        })
    }
}

impl Serialize for StudySnpKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StudySnpKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

/// Cohort whose minor-allele-frequency data backs a run. The percentile
/// endpoints keep the full cohort name while the MAF endpoints collapse the
/// ADNI sub-cohorts into one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MafCohort(String);

impl MafCohort {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_user(&self) -> bool {
        self.0 == "user"
    }

    /// Cohort name as the MAF endpoints expect it.
    pub fn maf_name(&self) -> &str {
        if self.0.starts_with("adni") {
            "adni"
        } else {
            &self.0
        }
    }
}

impl fmt::Display for MafCohort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MafCohort {
    type Err = GwasError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase().replace('-', "_");
        if normalized.is_empty() {
            return Err(GwasError::InvalidCohort(value.to_string()));
        }
        let normalized = if normalized == "adni_cn" {
            "adni_controls".to_string()
        } else {
            normalized
        };
        Ok(Self(normalized))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn site_key_normalizes_chromosome_prefix() {
        let bare = SiteKey::from_chrom_pos("7", "12345");
        let prefixed = SiteKey::from_chrom_pos("chr7", "12345");
        assert_eq!(bare, prefixed);
        assert_eq!(bare.as_str(), "chr7:12345");
        assert_eq!(bare.chromosome(), Some("chr7"));
        assert_eq!(bare.position(), Some("12345"));
        assert!(!bare.is_rsid());
    }

    #[test]
    fn site_key_parses_rsid() {
        let key: SiteKey = "rs6323".parse().unwrap();
        assert!(key.is_rsid());
        assert_eq!(key.chromosome(), None);
    }

    #[test]
    fn site_key_parses_positional_without_prefix() {
        let key: SiteKey = "X:1500".parse().unwrap();
        assert_eq!(key.as_str(), "chrX:1500");
    }

    #[test]
    fn site_key_rejects_garbage() {
        let err = "rsABC".parse::<SiteKey>().unwrap_err();
        assert_matches!(err, GwasError::InvalidSiteKey(_));
        let err = "chr7".parse::<SiteKey>().unwrap_err();
        assert_matches!(err, GwasError::InvalidSiteKey(_));
    }

    #[test]
    fn composite_key_round_trip() {
        let key = CompositeKey::new("low density", "per allele", ValueKind::Beta);
        assert_eq!(key.to_string(), "low density|per allele|beta");
        let parsed: CompositeKey = "low density|per allele|beta".parse().unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn composite_key_rejects_wrong_arity() {
        let err = "only|two".parse::<CompositeKey>().unwrap_err();
        assert_matches!(err, GwasError::InvalidCompositeKey(_));
    }

    #[test]
    fn study_snp_key_round_trip() {
        let key = StudySnpKey::new(
            "Acne",
            CompositeKey::new("NA", "NA", ValueKind::OddsRatio),
            StudyId::new("GCST000998"),
        );
        assert_eq!(key.to_string(), "Acne|NA|NA|OR|GCST000998");
        let parsed: StudySnpKey = "Acne|NA|NA|OR|GCST000998".parse().unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn value_kind_wire_strings() {
        assert_eq!(ValueKind::Beta.to_string(), "beta");
        assert_eq!(ValueKind::OddsRatio.to_string(), "OR");
        assert_eq!("OR".parse::<ValueKind>().unwrap(), ValueKind::OddsRatio);
    }

    #[test]
    fn super_population_parse_is_case_insensitive() {
        assert_eq!(
            "eur".parse::<SuperPopulation>().unwrap(),
            SuperPopulation::Eur
        );
        let err = "EUX".parse::<SuperPopulation>().unwrap_err();
        assert_matches!(err, GwasError::InvalidSuperPopulation(_));
    }

    #[test]
    fn maf_cohort_normalization() {
        let cohort: MafCohort = "adni-cn".parse().unwrap();
        assert_eq!(cohort.as_str(), "adni_controls");
        assert_eq!(cohort.maf_name(), "adni");

        let ukbb: MafCohort = "ukbb".parse().unwrap();
        assert_eq!(ukbb.maf_name(), "ukbb");
        assert!(!ukbb.is_user());

        let user: MafCohort = "user".parse().unwrap();
        assert!(user.is_user());
    }
}
