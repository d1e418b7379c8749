use std::collections::{BTreeMap, BTreeSet};
use std::io::BufRead;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::alleles::{self, VariantAnnotationClient};
use crate::domain::{CompositeKey, SiteKey, StudyId, StudySnpKey, SuperPopulation, ValueKind};
use crate::error::GwasError;
use crate::populations;

pub type AssociationTree = BTreeMap<SiteKey, SiteRecord>;
pub type StudyMap = BTreeMap<StudyId, VariantTypeMap>;
pub type VariantTypeMap = BTreeMap<CompositeKey, AlleleMap>;
pub type AlleleMap = BTreeMap<String, EffectRecord>;
pub type StudyMetadataMap = BTreeMap<StudyId, StudyMeta>;
pub type StudySnpIndex = BTreeMap<StudySnpKey, Vec<SiteKey>>;

/// One effect measurement: a p-value plus either a beta coefficient with its
/// unit or an odds ratio (whose unit slot is pinned to `NA`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectRecord {
    #[serde(rename = "pValue")]
    pub p_value: f64,
    pub sex: String,
    #[serde(rename = "ogValueType", alias = "ogValueTypes")]
    pub og_value_type: ValueKind,
    #[serde(flatten)]
    pub effect: EffectSize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EffectSize {
    Beta {
        #[serde(rename = "betaValue")]
        beta_value: f64,
        #[serde(rename = "betaUnit")]
        beta_unit: String,
    },
    OddsRatio {
        #[serde(rename = "oddsRatio")]
        odds_ratio: f64,
        #[serde(rename = "betaUnit")]
        beta_unit: String,
    },
}

impl EffectRecord {
    pub fn beta(p_value: f64, beta_value: f64, beta_unit: impl Into<String>) -> Self {
        Self {
            p_value,
            sex: "NA".to_string(),
            og_value_type: ValueKind::Beta,
            effect: EffectSize::Beta {
                beta_value,
                beta_unit: beta_unit.into(),
            },
        }
    }

    pub fn odds_ratio(p_value: f64, odds_ratio: f64) -> Self {
        Self {
            p_value,
            sex: "NA".to_string(),
            og_value_type: ValueKind::OddsRatio,
            effect: EffectSize::OddsRatio {
                odds_ratio,
                beta_unit: "NA".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteRecord {
    pub pos: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_rsid: Option<String>,
    #[serde(default)]
    pub traits: BTreeMap<String, StudyMap>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyMeta {
    #[serde(default)]
    pub citation: String,
    #[serde(rename = "reportedTrait", default)]
    pub reported_trait: String,
    #[serde(rename = "studyTypes", default)]
    pub study_types: Vec<String>,
    #[serde(default)]
    pub ethnicity: Vec<String>,
    #[serde(default)]
    pub traits: BTreeMap<String, TraitMeta>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraitMeta {
    #[serde(rename = "studyTypes", default)]
    pub study_types: Vec<String>,
    #[serde(
        rename = "pValBetaAnnoValTypes",
        alias = "pValBetaAnnoValType",
        default
    )]
    pub composite_keys: Vec<CompositeKey>,
    #[serde(rename = "superPopulations", default)]
    pub super_populations: Vec<String>,
}

/// The association tree plus study metadata, the unit every endpoint and
/// artifact traffics in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssociationBundle {
    #[serde(default)]
    pub associations: AssociationTree,
    #[serde(rename = "studyIDsToMetaData", default)]
    pub study_metadata: StudyMetadataMap,
}

impl AssociationBundle {
    pub fn is_empty(&self) -> bool {
        self.associations.is_empty() && self.study_metadata.is_empty()
    }

    pub fn site_keys(&self) -> Vec<SiteKey> {
        self.associations.keys().cloned().collect()
    }

    /// Inserts one effect at its five-coordinate slot. A second record at an
    /// occupied slot is a fatal input error.
    pub fn insert_effect(
        &mut self,
        site: &SiteKey,
        original_rsid: Option<&str>,
        trait_name: &str,
        study_id: &StudyId,
        composite: &CompositeKey,
        risk_allele: &str,
        record: EffectRecord,
    ) -> Result<(), GwasError> {
        let site_record = self
            .associations
            .entry(site.clone())
            .or_insert_with(|| SiteRecord {
                pos: site.as_str().to_string(),
                original_rsid: original_rsid.map(|rsid| rsid.to_string()),
                traits: BTreeMap::new(),
            });
        let allele_map = site_record
            .traits
            .entry(trait_name.to_string())
            .or_default()
            .entry(study_id.clone())
            .or_default()
            .entry(composite.clone())
            .or_default();
        if allele_map.contains_key(risk_allele) {
            return Err(GwasError::DuplicateAssociation {
                site: site.to_string(),
                trait_name: trait_name.to_string(),
                study_id: study_id.to_string(),
                composite: composite.to_string(),
            });
        }
        allele_map.insert(risk_allele.to_string(), record);
        Ok(())
    }

    /// Records study metadata for one input row. Citation and reported trait
    /// are first-seen-wins; the trait's composite-key list gets one entry per
    /// row; the raw population cell is kept from the trait's first row.
    pub fn record_study(
        &mut self,
        study_id: &StudyId,
        citation: &str,
        reported_trait: &str,
        trait_name: &str,
        composite: &CompositeKey,
        raw_population: &str,
    ) {
        let meta = self
            .study_metadata
            .entry(study_id.clone())
            .or_insert_with(|| StudyMeta {
                citation: citation.to_string(),
                reported_trait: reported_trait.to_string(),
                study_types: Vec::new(),
                ethnicity: Vec::new(),
                traits: BTreeMap::new(),
            });
        meta.traits
            .entry(trait_name.to_string())
            .and_modify(|trait_meta| trait_meta.composite_keys.push(composite.clone()))
            .or_insert_with(|| TraitMeta {
                study_types: Vec::new(),
                composite_keys: vec![composite.clone()],
                super_populations: vec![raw_population.to_string()],
            });
    }
}

#[derive(Debug, Clone)]
enum EffectColumns {
    Beta { value: usize, unit: usize },
    OddsRatio { ratio: usize },
}

/// Column layout of an uploaded GWAS table, resolved once from the header
/// line before any data row is read.
#[derive(Debug, Clone)]
pub struct GwasHeader {
    study_id: usize,
    trait_name: usize,
    rsid: usize,
    chromosome: usize,
    position: usize,
    risk_allele: usize,
    p_value: usize,
    super_population: usize,
    effect: EffectColumns,
    citation: Option<usize>,
    reported_trait: Option<usize>,
    p_value_annotation: Option<usize>,
    beta_annotation: Option<usize>,
}

impl GwasHeader {
    /// Resolves required and optional columns case-insensitively. All
    /// missing required columns are reported together.
    pub fn parse(header_line: &str, value_kind: ValueKind) -> Result<Self, GwasError> {
        let headers = header_line
            .to_lowercase()
            .split('\t')
            .map(|name| name.trim().to_string())
            .collect::<Vec<_>>();
        let find = |name: &str| headers.iter().position(|header| header == name);

        let mut missing: Vec<&'static str> = Vec::new();
        let mut require = |name: &'static str| -> usize {
            match find(name) {
                Some(index) => index,
                None => {
                    missing.push(name);
                    usize::MAX
                }
            }
        };

        let study_id = require("study id");
        let trait_name = require("trait");
        let rsid = require("rsid");
        let chromosome = require("chromosome");
        let position = require("position");
        let risk_allele = require("risk allele");
        let p_value = require("p-value");
        let super_population = require("super population");
        let effect = match value_kind {
            ValueKind::Beta => EffectColumns::Beta {
                value: require("beta coefficient"),
                unit: require("beta units"),
            },
            ValueKind::OddsRatio => EffectColumns::OddsRatio {
                ratio: require("odds ratio"),
            },
        };
        if !missing.is_empty() {
            return Err(GwasError::MissingColumns(missing.join(", ")));
        }

        Ok(Self {
            study_id,
            trait_name,
            rsid,
            chromosome,
            position,
            risk_allele,
            p_value,
            super_population,
            effect,
            citation: find("citation"),
            reported_trait: find("reported trait"),
            p_value_annotation: find("p-value annotation"),
            beta_annotation: find("beta annotation"),
        })
    }

    pub fn value_kind(&self) -> ValueKind {
        match self.effect {
            EffectColumns::Beta { .. } => ValueKind::Beta,
            EffectColumns::OddsRatio { .. } => ValueKind::OddsRatio,
        }
    }

    pub fn parse_row(&self, line_number: usize, raw: &str) -> Result<ParsedRow, GwasError> {
        let fields = raw.split('\t').collect::<Vec<_>>();
        let required = |index: usize, name: &str| -> Result<&str, GwasError> {
            fields
                .get(index)
                .copied()
                .map(str::trim)
                .ok_or_else(|| GwasError::InvalidRow {
                    line: line_number,
                    message: format!("missing value for the {name} column"),
                })
        };
        let optional = |index: Option<usize>, default: &str| -> String {
            index
                .and_then(|i| fields.get(i))
                .map(|value| value.trim().to_string())
                .unwrap_or_else(|| default.to_string())
        };
        let numeric = |index: usize, name: &str| -> Result<f64, GwasError> {
            let text = required(index, name)?;
            text.parse().map_err(|_| GwasError::InvalidRow {
                line: line_number,
                message: format!("{name} '{text}' is not a number"),
            })
        };

        let chromosome = required(self.chromosome, "chromosome")?;
        let position = required(self.position, "position")?;
        let site = SiteKey::from_chrom_pos(chromosome, position);
        let effect = match self.effect {
            EffectColumns::Beta { value, unit } => EffectSize::Beta {
                beta_value: numeric(value, "beta coefficient")?,
                beta_unit: required(unit, "beta units")?.to_string(),
            },
            EffectColumns::OddsRatio { ratio } => EffectSize::OddsRatio {
                odds_ratio: numeric(ratio, "odds ratio")?,
                beta_unit: "NA".to_string(),
            },
        };
        Ok(ParsedRow {
            study_id: StudyId::new(required(self.study_id, "study id")?),
            trait_name: required(self.trait_name, "trait")?.to_string(),
            rsid: required(self.rsid, "rsid")?.to_string(),
            site,
            reported_allele: required(self.risk_allele, "risk allele")?.to_string(),
            p_value: numeric(self.p_value, "p-value")?,
            raw_population: required(self.super_population, "super population")?.to_string(),
            composite: CompositeKey::new(
                optional(self.p_value_annotation, "NA"),
                optional(self.beta_annotation, "NA"),
                self.value_kind(),
            ),
            citation: optional(self.citation, ""),
            reported_trait: optional(self.reported_trait, ""),
            effect,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ParsedRow {
    pub study_id: StudyId,
    pub trait_name: String,
    pub rsid: String,
    pub site: SiteKey,
    pub reported_allele: String,
    pub p_value: f64,
    pub raw_population: String,
    pub composite: CompositeKey,
    pub citation: String,
    pub reported_trait: String,
    pub effect: EffectSize,
}

/// Everything derived from one uploaded GWAS table.
#[derive(Debug, Clone)]
pub struct GwasIndex {
    pub bundle: AssociationBundle,
    pub study_snps: StudySnpIndex,
    pub preferred_populations: BTreeSet<SuperPopulation>,
}

/// Single-pass ingestion of a tab-separated GWAS table: resolves the header,
/// normalizes chromosomes and risk alleles, and indexes every row into the
/// association tree, the study-snp index, and the set of preferred
/// populations.
pub fn build_index<R, V>(
    reader: R,
    value_kind: ValueKind,
    requested_pop: SuperPopulation,
    annotations: &V,
) -> Result<GwasIndex, GwasError>
where
    R: BufRead,
    V: VariantAnnotationClient + ?Sized,
{
    let mut lines = reader.lines();
    let mut line_number = 0usize;

    let mut header_line = String::new();
    for line in lines.by_ref() {
        let line = line.map_err(|err| GwasError::Filesystem(err.to_string()))?;
        line_number += 1;
        if !line.trim().is_empty() {
            header_line = line;
            break;
        }
    }
    let header = GwasHeader::parse(&header_line, value_kind)?;

    let mut bundle = AssociationBundle::default();
    let mut study_snps: StudySnpIndex = BTreeMap::new();
    let mut preferred_populations = BTreeSet::new();
    let mut allele_memo: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for line in lines {
        let line = line.map_err(|err| GwasError::Filesystem(err.to_string()))?;
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }
        let row = header.parse_row(line_number, &line)?;

        let tags = populations::parse_population_tags(&row.raw_population);
        preferred_populations.insert(populations::preferred_population(&tags, requested_pop));

        let known = if row.rsid.starts_with("rs") {
            allele_memo
                .entry(row.rsid.clone())
                .or_insert_with(|| alleles::known_alleles_or_empty(annotations, &row.rsid))
                .clone()
        } else {
            BTreeSet::new()
        };
        let risk_allele = alleles::normalize_allele(&row.site, &row.reported_allele, &known);

        let record = EffectRecord {
            p_value: row.p_value,
            sex: "NA".to_string(),
            og_value_type: value_kind,
            effect: row.effect.clone(),
        };
        bundle.insert_effect(
            &row.site,
            Some(&row.rsid),
            &row.trait_name,
            &row.study_id,
            &row.composite,
            &risk_allele,
            record,
        )?;
        bundle.record_study(
            &row.study_id,
            &row.citation,
            &row.reported_trait,
            &row.trait_name,
            &row.composite,
            &row.raw_population,
        );
        study_snps
            .entry(StudySnpKey::new(
                row.trait_name.clone(),
                row.composite.clone(),
                row.study_id.clone(),
            ))
            .or_default()
            .push(row.site.clone());
    }

    info!(
        "parsed GWAS table: {} sites, {} studies, {} trait/study combinations, {} preferred populations",
        bundle.associations.len(),
        bundle.study_metadata.len(),
        study_snps.len(),
        preferred_populations.len()
    );

    Ok(GwasIndex {
        bundle,
        study_snps,
        preferred_populations,
    })
}
