use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::domain::SiteKey;
use crate::error::GwasError;

const MYVARIANT_BASE: &str = "https://myvariant.info/v1";
const ANNOTATION_FIELDS: &str = "dbsnp.alleles.allele,dbsnp.ref,dbsnp.alt";

pub fn complement(base: char) -> char {
    match base {
        'A' => 'T',
        'T' => 'A',
        'C' => 'G',
        'G' => 'C',
        'a' => 't',
        't' => 'a',
        'c' => 'g',
        'g' => 'c',
        other => other,
    }
}

pub fn reverse_complement(allele: &str) -> String {
    allele.chars().rev().map(complement).collect()
}

/// Resolves the strand of a reported risk allele against the alleles known
/// for the variant. Known alleles win as reported; otherwise the reverse
/// complement is substituted when it is known; otherwise the reported allele
/// passes through unchanged.
pub fn normalize_allele(site: &SiteKey, reported: &str, known: &BTreeSet<String>) -> String {
    if known.contains(reported) {
        return reported.to_string();
    }
    let flipped = reverse_complement(reported);
    if known.contains(&flipped) {
        info!("strand flip for {site}: {reported} -> {flipped}");
        return flipped;
    }
    debug!("risk allele {reported} for {site} not among known alleles, keeping as reported");
    reported.to_string()
}

pub trait VariantAnnotationClient: Send + Sync {
    fn known_alleles(&self, rsid: &str) -> Result<BTreeSet<String>, GwasError>;
}

#[derive(Clone)]
pub struct MyVariantHttpClient {
    client: Client,
}

impl MyVariantHttpClient {
    pub fn new() -> Result<Self, GwasError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("gwas-am/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| GwasError::AnnotationHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| GwasError::AnnotationHttp(err.to_string()))?;
        Ok(Self { client })
    }
}

impl VariantAnnotationClient for MyVariantHttpClient {
    fn known_alleles(&self, rsid: &str) -> Result<BTreeSet<String>, GwasError> {
        let response = self
            .client
            .get(format!("{MYVARIANT_BASE}/query"))
            .query(&[
                ("q", format!("dbsnp.rsid:{rsid}")),
                ("fields", ANNOTATION_FIELDS.to_string()),
            ])
            .send()
            .map_err(|err| GwasError::AnnotationHttp(err.to_string()))?;
        if !response.status().is_success() {
            return Err(GwasError::AnnotationHttp(format!(
                "myvariant.info returned status {} for {rsid}",
                response.status().as_u16()
            )));
        }
        let payload: Value = response
            .json()
            .map_err(|err| GwasError::AnnotationHttp(err.to_string()))?;
        Ok(collect_alleles(&payload))
    }
}

fn collect_alleles(payload: &Value) -> BTreeSet<String> {
    let mut alleles = BTreeSet::new();
    let hit = payload
        .get("hits")
        .and_then(|v| v.as_array())
        .and_then(|hits| hits.first());
    let Some(dbsnp) = hit.and_then(|h| h.get("dbsnp")) else {
        return alleles;
    };
    if let Some(entries) = dbsnp.get("alleles").and_then(|v| v.as_array()) {
        for entry in entries {
            if let Some(allele) = entry.get("allele").and_then(|v| v.as_str()) {
                alleles.insert(allele.to_string());
            }
        }
    }
    for field in ["ref", "alt"] {
        if let Some(value) = dbsnp.get(field).and_then(|v| v.as_str()) {
            if !value.is_empty() {
                alleles.insert(value.to_string());
            }
        }
    }
    alleles
}

/// Annotation lookups are best-effort: a failed query degrades to an empty
/// allele set so ingestion can continue with the reported strand.
pub fn known_alleles_or_empty<V: VariantAnnotationClient + ?Sized>(
    client: &V,
    rsid: &str,
) -> BTreeSet<String> {
    match client.known_alleles(rsid) {
        Ok(alleles) => alleles,
        Err(err) => {
            warn!("variant annotation lookup failed for {rsid}: {err}");
            BTreeSet::new()
        }
    }
}

/// Known-allele table for a set of sites: rsIDs are queried, positional keys
/// map to an empty list, anything else is skipped.
pub fn possible_alleles_table<V: VariantAnnotationClient + ?Sized>(
    sites: &[SiteKey],
    client: &V,
) -> BTreeMap<SiteKey, Vec<String>> {
    let mut table = BTreeMap::new();
    for site in sites {
        if site.is_rsid() {
            let alleles = known_alleles_or_empty(client, site.as_str());
            table.insert(site.clone(), alleles.into_iter().collect());
        } else if site.chromosome().is_some() {
            table.insert(site.clone(), Vec::new());
        }
    }
    table
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn known(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn reverse_complement_reverses_and_flips() {
        assert_eq!(reverse_complement("G"), "C");
        assert_eq!(reverse_complement("AT"), "AT");
        assert_eq!(reverse_complement("ACG"), "CGT");
        assert_eq!(reverse_complement(""), "");
    }

    #[test]
    fn known_allele_is_kept() {
        let site: SiteKey = "rs123".parse().unwrap();
        assert_eq!(normalize_allele(&site, "A", &known(&["A", "G"])), "A");
    }

    #[test]
    fn complemented_allele_is_substituted() {
        let site: SiteKey = "rs123".parse().unwrap();
        assert_eq!(normalize_allele(&site, "G", &known(&["A", "C"])), "C");
    }

    #[test]
    fn unknown_allele_passes_through() {
        let site: SiteKey = "rs123".parse().unwrap();
        assert_eq!(normalize_allele(&site, "T", &known(&["G", "C"])), "T");
        assert_eq!(normalize_allele(&site, "T", &BTreeSet::new()), "T");
    }

    #[test]
    fn collect_alleles_reads_first_hit() {
        let payload = json!({
            "hits": [{
                "dbsnp": {
                    "alleles": [{"allele": "A"}, {"allele": "G"}],
                    "ref": "A",
                    "alt": "G"
                }
            }]
        });
        assert_eq!(collect_alleles(&payload), known(&["A", "G"]));
    }

    #[test]
    fn collect_alleles_handles_missing_hits() {
        assert!(collect_alleles(&json!({"hits": []})).is_empty());
        assert!(collect_alleles(&json!({})).is_empty());
    }
}
