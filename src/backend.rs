use std::collections::BTreeMap;
use std::time::Duration;

use chrono::NaiveDate;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::associations::AssociationBundle;
use crate::cache::{RequestDescriptor, ResponseCache};
use crate::domain::{RefGenome, SiteKey, SuperPopulation, ValueKind};
use crate::error::GwasError;

pub const DEFAULT_BASE_URL: &str = "https://prs.byu.edu";

/// Filters for the study search endpoint. All lists are optional; `None`
/// means "no constraint" and is sent as an explicit null so equal filter
/// sets always canonicalize to the same request body.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StudyFilters {
    pub traits: Option<Vec<String>>,
    #[serde(rename = "studyTypes")]
    pub study_types: Option<Vec<String>>,
    pub ethnicities: Option<Vec<String>>,
    pub sexes: Option<Vec<String>>,
    #[serde(rename = "ogValueTypes")]
    pub value_types: Option<Vec<ValueKind>>,
}

impl StudyFilters {
    pub fn is_empty(&self) -> bool {
        self.traits.is_none()
            && self.study_types.is_none()
            && self.ethnicities.is_none()
            && self.sexes.is_none()
            && self.value_types.is_none()
    }
}

/// One study as the server identifies it: the trait it was indexed under,
/// its accession, and the annotation fields that distinguish its effect
/// sets. The study search endpoint omits the trait (it is the response map
/// key); submissions always carry it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyDescriptor {
    #[serde(rename = "trait", default)]
    pub trait_name: String,
    #[serde(rename = "studyID")]
    pub study_id: String,
    #[serde(rename = "pValueAnnotation", default)]
    pub p_value_annotation: String,
    #[serde(rename = "betaAnnotation", default)]
    pub beta_annotation: String,
    #[serde(rename = "ogValueTypes", default)]
    pub og_value_types: Value,
}

/// Which reference table a last-update probe asks about.
#[derive(Debug, Clone)]
pub enum UpdateKind {
    Clumps {
        ref_gen: RefGenome,
        super_pop: SuperPopulation,
    },
    Maf {
        cohort: String,
        ref_gen: RefGenome,
    },
    Percentiles {
        cohort: String,
    },
}

impl UpdateKind {
    fn path(&self) -> &'static str {
        match self {
            UpdateKind::Clumps { .. } => "/last_clumps_update",
            UpdateKind::Maf { .. } => "/last_maf_update",
            UpdateKind::Percentiles { .. } => "/last_percentiles_update",
        }
    }

    fn params(&self) -> Vec<(&'static str, String)> {
        match self {
            UpdateKind::Clumps { ref_gen, super_pop } => vec![
                ("refGen", ref_gen.to_string()),
                ("superPop", super_pop.to_string()),
            ],
            UpdateKind::Maf { cohort, ref_gen } => vec![
                ("cohort", cohort.clone()),
                ("refGen", ref_gen.to_string()),
            ],
            UpdateKind::Percentiles { cohort } => vec![("cohort", cohort.clone())],
        }
    }
}

/// The PRS reference server, one method per logical operation. Download
/// endpoints return the server's JSON verbatim (they are persisted as-is);
/// submission endpoints return typed partial results the orchestrator folds
/// together.
pub trait PrsBackend: Send + Sync {
    fn associations_download(&self, ref_gen: RefGenome) -> Result<Value, GwasError>;
    fn clumps_download(
        &self,
        ref_gen: RefGenome,
        super_pop: SuperPopulation,
    ) -> Result<Value, GwasError>;
    fn maf_download(&self, cohort: &str, ref_gen: RefGenome) -> Result<Value, GwasError>;
    fn percentiles_download(&self, cohort: &str) -> Result<Value, GwasError>;
    fn study_snp_map(&self) -> Result<Value, GwasError>;
    fn all_possible_alleles(&self) -> Result<Value, GwasError>;
    fn ethnicities(&self) -> Result<Vec<String>, GwasError>;
    /// `None` when the server is unreachable or answers with something that
    /// is not a date; callers then keep their local copy.
    fn last_update(&self, kind: &UpdateKind) -> Option<NaiveDate>;

    fn studies_by_filter(
        &self,
        filters: &StudyFilters,
    ) -> Result<BTreeMap<String, Vec<StudyDescriptor>>, GwasError>;
    fn studies_by_id(&self, ids: &[String]) -> Result<Vec<StudyDescriptor>, GwasError>;
    fn associations_for_studies(
        &self,
        ref_gen: RefGenome,
        descriptors: &[StudyDescriptor],
        sexes: &[String],
        value_types: &[ValueKind],
    ) -> Result<AssociationBundle, GwasError>;
    fn clumping_by_position(
        &self,
        ref_gen: RefGenome,
        super_pop: SuperPopulation,
        positions: &[SiteKey],
    ) -> Result<Map<String, Value>, GwasError>;
    fn maf_by_position(
        &self,
        cohort: &str,
        ref_gen: RefGenome,
        chrom: &str,
        positions: &[String],
    ) -> Result<Map<String, Value>, GwasError>;
    fn percentiles_for_studies(
        &self,
        cohort: &str,
        descriptors: &[StudyDescriptor],
    ) -> Result<Map<String, Value>, GwasError>;
    fn study_snps_for_studies(
        &self,
        descriptors: &[StudyDescriptor],
    ) -> Result<Map<String, Value>, GwasError>;
    /// Positions of the given rsIDs in `ref_gen`. rsIDs the server does
    /// not know are absent from the result.
    fn snp_position_remap(
        &self,
        snps: &[SiteKey],
        ref_gen: RefGenome,
    ) -> Result<BTreeMap<String, SiteKey>, GwasError>;
}

/// Blocking HTTP implementation, with every GET cached in the lookup
/// partition and every POST in the submission partition.
#[derive(Clone)]
pub struct PrsHttpClient {
    client: Client,
    base_url: String,
    cache: ResponseCache,
}

impl PrsHttpClient {
    pub fn new(cache: ResponseCache) -> Result<Self, GwasError> {
        Self::with_base_url(DEFAULT_BASE_URL, cache)
    }

    pub fn with_base_url(base_url: &str, cache: ResponseCache) -> Result<Self, GwasError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("gwas-am/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| GwasError::BackendHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| GwasError::BackendHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            cache,
        })
    }

    fn get_json(&self, path: &str, params: &[(&str, String)]) -> Result<Value, GwasError> {
        let url = format!("{}{path}", self.base_url);
        let descriptor = RequestDescriptor::lookup(&url, params);
        if let Some(cached) = self.cache.get(&descriptor) {
            return Ok(cached);
        }
        debug!("GET {url}");
        let response = self
            .client
            .get(&url)
            .query(params)
            .send()
            .map_err(|err| GwasError::BackendHttp(err.to_string()))?;
        let value = Self::json_body(response)?;
        self.cache.put(&descriptor, &value);
        Ok(value)
    }

    fn post_json(&self, path: &str, body: Value) -> Result<Value, GwasError> {
        let url = format!("{}{path}", self.base_url);
        let descriptor = RequestDescriptor::submission(&url, &body);
        if let Some(cached) = self.cache.get(&descriptor) {
            return Ok(cached);
        }
        debug!("POST {url}");
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .map_err(|err| GwasError::BackendHttp(err.to_string()))?;
        let value = Self::json_body(response)?;
        self.cache.put(&descriptor, &value);
        Ok(value)
    }

    fn json_body(response: reqwest::blocking::Response) -> Result<Value, GwasError> {
        let status = response.status().as_u16();
        if status == 504 {
            return Err(GwasError::ServerTimeout(
                "the PRS server took too long to answer; try narrowing the filter scope or \
                 splitting the request into smaller runs"
                    .to_string(),
            ));
        }
        if status == 204 {
            return Ok(Value::Object(Map::new()));
        }
        if !response.status().is_success() {
            let message = response
                .text()
                .unwrap_or_else(|_| "PRS server request failed".to_string());
            return Err(GwasError::BackendStatus { status, message });
        }
        response
            .json()
            .map_err(|err| GwasError::Json(err.to_string()))
    }
}

fn object_from(value: Value, context: &str) -> Result<Map<String, Value>, GwasError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(GwasError::Json(format!(
            "{context}: expected a JSON object, got {other}"
        ))),
    }
}

impl PrsBackend for PrsHttpClient {
    fn associations_download(&self, ref_gen: RefGenome) -> Result<Value, GwasError> {
        self.get_json(
            "/get_associations_download_file",
            &[("refGen", ref_gen.to_string())],
        )
    }

    fn clumps_download(
        &self,
        ref_gen: RefGenome,
        super_pop: SuperPopulation,
    ) -> Result<Value, GwasError> {
        self.get_json(
            "/get_clumps_download_file",
            &[
                ("refGen", ref_gen.to_string()),
                ("superPop", super_pop.to_string()),
            ],
        )
    }

    fn maf_download(&self, cohort: &str, ref_gen: RefGenome) -> Result<Value, GwasError> {
        self.get_json(
            "/get_maf_download_file",
            &[
                ("cohort", cohort.to_string()),
                ("refGen", ref_gen.to_string()),
            ],
        )
    }

    fn percentiles_download(&self, cohort: &str) -> Result<Value, GwasError> {
        self.get_json(
            "/get_percentiles_download_file",
            &[("cohort", cohort.to_string())],
        )
    }

    fn study_snp_map(&self) -> Result<Value, GwasError> {
        self.get_json("/get_traitStudyID_to_snp", &[])
    }

    fn all_possible_alleles(&self) -> Result<Value, GwasError> {
        self.get_json("/get_all_possible_alleles", &[])
    }

    fn ethnicities(&self) -> Result<Vec<String>, GwasError> {
        let value = self.get_json("/ethnicities", &[])?;
        serde_json::from_value(value).map_err(|err| GwasError::Json(err.to_string()))
    }

    fn last_update(&self, kind: &UpdateKind) -> Option<NaiveDate> {
        let url = format!("{}{}", self.base_url, kind.path());
        let response = match self
            .client
            .get(&url)
            .query(&kind.params())
            .timeout(Duration::from_secs(10))
            .send()
        {
            Ok(response) => response,
            Err(err) => {
                warn!("could not contact server ({url}): {err}");
                return None;
            }
        };
        if !response.status().is_success() {
            warn!(
                "last-update probe {url} returned status {}",
                response.status().as_u16()
            );
            return None;
        }
        let text = response.text().ok()?;
        match NaiveDate::parse_from_str(text.trim().trim_matches('"'), "%Y-%m-%d") {
            Ok(date) => Some(date),
            Err(err) => {
                warn!("unparsable last-update date from {url}: {err}");
                None
            }
        }
    }

    fn studies_by_filter(
        &self,
        filters: &StudyFilters,
    ) -> Result<BTreeMap<String, Vec<StudyDescriptor>>, GwasError> {
        let body =
            serde_json::to_value(filters).map_err(|err| GwasError::Json(err.to_string()))?;
        let value = self.post_json("/get_studies", body)?;
        serde_json::from_value(value).map_err(|err| GwasError::Json(err.to_string()))
    }

    fn studies_by_id(&self, ids: &[String]) -> Result<Vec<StudyDescriptor>, GwasError> {
        let params: Vec<(&str, String)> = ids.iter().map(|id| ("studyIDs", id.clone())).collect();
        let value = self.get_json("/get_studies_by_id", &params)?;
        serde_json::from_value(value).map_err(|err| GwasError::Json(err.to_string()))
    }

    fn associations_for_studies(
        &self,
        ref_gen: RefGenome,
        descriptors: &[StudyDescriptor],
        sexes: &[String],
        value_types: &[ValueKind],
    ) -> Result<AssociationBundle, GwasError> {
        let body = json!({
            "refGen": ref_gen,
            "studyIDObjs": descriptors,
            "sexes": sexes,
            "ogValueType": value_types,
        });
        let value = self.post_json("/get_associations", body)?;
        serde_json::from_value(value).map_err(|err| GwasError::Json(err.to_string()))
    }

    fn clumping_by_position(
        &self,
        ref_gen: RefGenome,
        super_pop: SuperPopulation,
        positions: &[SiteKey],
    ) -> Result<Map<String, Value>, GwasError> {
        let body = json!({
            "refGen": ref_gen,
            "superPop": super_pop,
            "positions": positions,
        });
        let value = self.post_json("/ld_clumping_by_pos", body)?;
        object_from(value, "clumping response")
    }

    fn maf_by_position(
        &self,
        cohort: &str,
        ref_gen: RefGenome,
        chrom: &str,
        positions: &[String],
    ) -> Result<Map<String, Value>, GwasError> {
        let body = json!({
            "cohort": cohort,
            "refGen": ref_gen,
            "chrom": chrom,
            "pos": positions,
        });
        let value = self.post_json("/get_maf", body)?;
        object_from(value, "maf response")
    }

    fn percentiles_for_studies(
        &self,
        cohort: &str,
        descriptors: &[StudyDescriptor],
    ) -> Result<Map<String, Value>, GwasError> {
        let body = json!({
            "cohort": cohort,
            "studyIDObjs": descriptors,
        });
        let value = self.post_json("/get_percentiles", body)?;
        object_from(value, "percentiles response")
    }

    fn study_snps_for_studies(
        &self,
        descriptors: &[StudyDescriptor],
    ) -> Result<Map<String, Value>, GwasError> {
        let body = json!({ "studyIDObjs": descriptors });
        let value = self.post_json("/snps_to_trait_studyID", body)?;
        object_from(value, "study-snp response")
    }

    fn snp_position_remap(
        &self,
        snps: &[SiteKey],
        ref_gen: RefGenome,
    ) -> Result<BTreeMap<String, SiteKey>, GwasError> {
        let mut params: Vec<(&str, String)> = snps
            .iter()
            .map(|snp| ("snps", snp.as_str().to_string()))
            .collect();
        params.push(("refGen", ref_gen.to_string()));
        let value = self.get_json("/snps_to_chrom_pos", &params)?;
        parse_remap(value)
    }
}

/// The remap endpoint answers `{rsid: {"chrom": .., "pos": ..}}`; `pos`
/// arrives as a number or a string depending on the table it came from.
fn parse_remap(value: Value) -> Result<BTreeMap<String, SiteKey>, GwasError> {
    let map = object_from(value, "snp remap response")?;
    let mut remap = BTreeMap::new();
    for (rsid, entry) in map {
        let chrom = entry
            .get("chrom")
            .and_then(Value::as_str)
            .ok_or_else(|| GwasError::Json(format!("snp remap entry for {rsid} has no chrom")))?
            .to_string();
        let pos = match entry.get("pos") {
            Some(Value::Number(number)) => number.to_string(),
            Some(Value::String(text)) => text.clone(),
            _ => {
                return Err(GwasError::Json(format!(
                    "snp remap entry for {rsid} has no pos"
                )));
            }
        };
        remap.insert(rsid, SiteKey::from_chrom_pos(&chrom, &pos));
    }
    Ok(remap)
}
