use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::associations::AssociationBundle;
use crate::domain::SiteKey;
use crate::error::GwasError;
use crate::merge::merge_bundles;
use crate::retry::{RetryPolicy, with_retry};

/// Keys per remote page, chosen to stay under the server's request size
/// limit.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Fetches `items` in sequential pages of at most `page_size` and folds the
/// per-page JSON objects into one map. Pages are partitioned on primary
/// keys, so collisions across pages are not expected; if they occur anyway
/// the later page wins.
pub fn fetch_merged_pages<T, F>(
    items: &[T],
    page_size: usize,
    policy: &RetryPolicy,
    mut fetch_page: F,
) -> Result<Map<String, Value>, GwasError>
where
    F: FnMut(&[T]) -> Result<Value, GwasError>,
{
    let total_pages = items.len().div_ceil(page_size);
    let mut merged = Map::new();
    for (index, page) in items.chunks(page_size).enumerate() {
        debug!("fetching page {}/{total_pages}", index + 1);
        let partial = with_retry(policy, || fetch_page(page))?;
        let Value::Object(partial) = partial else {
            return Err(GwasError::Json(format!(
                "page {} of {total_pages} is not a JSON object",
                index + 1
            )));
        };
        merged.extend(partial);
    }
    Ok(merged)
}

/// Same pagination as [`fetch_merged_pages`], folding the partial
/// association bundles with the deep merge instead of a shallow union.
pub fn fetch_bundle_pages<T, F>(
    items: &[T],
    page_size: usize,
    policy: &RetryPolicy,
    mut fetch_page: F,
) -> Result<AssociationBundle, GwasError>
where
    F: FnMut(&[T]) -> Result<AssociationBundle, GwasError>,
{
    let total_pages = items.len().div_ceil(page_size);
    if total_pages > 1 {
        info!("fetching {} items in {total_pages} pages", items.len());
    }
    let mut merged = AssociationBundle::default();
    for (index, page) in items.chunks(page_size).enumerate() {
        debug!("fetching page {}/{total_pages}", index + 1);
        let partial = with_retry(policy, || fetch_page(page))?;
        merge_bundles(&mut merged, partial);
    }
    Ok(merged)
}

/// Partitions positional site keys by chromosome for the per-chromosome
/// clump and MAF submissions. rsID keys carry no coordinates and are
/// skipped.
pub fn group_sites_by_chromosome(sites: &[SiteKey]) -> BTreeMap<String, Vec<SiteKey>> {
    let mut groups: BTreeMap<String, Vec<SiteKey>> = BTreeMap::new();
    for site in sites {
        if let Some(chrom) = site.chromosome() {
            groups.entry(chrom.to_string()).or_default().push(site.clone());
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::associations::EffectRecord;
    use crate::domain::{CompositeKey, StudyId, ValueKind};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    #[test]
    fn page_count_is_ceiling_of_items_over_page_size() {
        let items: Vec<u32> = (0..2500).collect();
        let calls = Cell::new(0usize);
        let merged = fetch_merged_pages(&items, 1000, &fast_policy(), |page| {
            calls.set(calls.get() + 1);
            assert!(page.len() <= 1000);
            Ok(json!({ format!("page{}", calls.get()): page.len() }))
        })
        .unwrap();
        assert_eq!(calls.get(), 3);
        assert_eq!(merged.get("page3"), Some(&json!(500)));
    }

    #[test]
    fn empty_input_makes_no_calls() {
        let items: Vec<u32> = Vec::new();
        let calls = Cell::new(0usize);
        let merged = fetch_merged_pages(&items, 1000, &fast_policy(), |_| {
            calls.set(calls.get() + 1);
            Ok(json!({}))
        })
        .unwrap();
        assert_eq!(calls.get(), 0);
        assert!(merged.is_empty());
    }

    #[test]
    fn paged_union_equals_single_fused_call() {
        let items: Vec<u32> = (0..5).collect();
        let fetch = |page: &[u32]| {
            let mut map = Map::new();
            for item in page {
                map.insert(format!("key{item}"), json!(*item));
            }
            Ok(Value::Object(map))
        };
        let paged = fetch_merged_pages(&items, 2, &fast_policy(), fetch).unwrap();
        let fused = fetch_merged_pages(&items, 1000, &fast_policy(), fetch).unwrap();
        assert_eq!(paged, fused);
        assert_eq!(paged.len(), 5);
    }

    #[test]
    fn later_page_wins_on_key_collision() {
        let items: Vec<u32> = vec![1, 2];
        let merged = fetch_merged_pages(&items, 1, &fast_policy(), |page| {
            Ok(json!({ "shared": page[0] }))
        })
        .unwrap();
        assert_eq!(merged.get("shared"), Some(&json!(2)));
    }

    #[test]
    fn non_object_page_is_an_error() {
        let items = vec![1u32];
        let err =
            fetch_merged_pages(&items, 1000, &fast_policy(), |_| Ok(json!([1, 2]))).unwrap_err();
        assert!(matches!(err, GwasError::Json(_)));
    }

    #[test]
    fn page_failures_are_retried_before_propagating() {
        let items = vec![1u32];
        let calls = Cell::new(0u32);
        let err = fetch_merged_pages(&items, 1000, &fast_policy(), |_| {
            calls.set(calls.get() + 1);
            Err(GwasError::BackendHttp("connection reset".to_string()))
        })
        .unwrap_err();
        assert_eq!(calls.get(), 3);
        assert!(matches!(err, GwasError::BackendHttp(_)));
    }

    #[test]
    fn bundle_pages_fold_with_deep_merge() {
        let items: Vec<u32> = (0..4).collect();
        let composite = CompositeKey::new("NA", "NA", ValueKind::Beta);
        let merged = fetch_bundle_pages(&items, 2, &fast_policy(), |page| {
            let mut bundle = AssociationBundle::default();
            for item in page {
                let site = format!("rs{item}").parse().unwrap();
                bundle
                    .insert_effect(
                        &site,
                        None,
                        "Acne",
                        &StudyId::new("GCST1"),
                        &composite,
                        "A",
                        EffectRecord::beta(1e-8, 0.1, "cm"),
                    )
                    .unwrap();
            }
            Ok(bundle)
        })
        .unwrap();
        assert_eq!(merged.associations.len(), 4);
    }

    #[test]
    fn chromosome_grouping_skips_rsids() {
        let sites: Vec<SiteKey> = ["chr1:100", "chr1:200", "chr2:300", "rs55"]
            .iter()
            .map(|raw| raw.parse().unwrap())
            .collect();
        let groups = group_sites_by_chromosome(&sites);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups.get("chr1").unwrap().len(), 2);
        assert_eq!(groups.get("chr2").unwrap().len(), 1);
    }
}
