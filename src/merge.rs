use std::collections::btree_map::Entry;

use crate::associations::AssociationBundle;

/// Folds `incoming` into `base` without ever duplicating a leaf record.
///
/// Study metadata merges at the trait level: unknown studies are inserted
/// wholesale, known studies only gain traits they did not have yet. The
/// association tree merges deeper, but only under rsID keys; positional
/// `chrom:pos` keys are opaque once present. Under a shared rsID the descent
/// stops at the composite key: an existing composite key under a shared
/// study is never re-merged at the allele level, because separate pages can
/// contribute a composite key at most once per (site, trait, study).
pub fn merge_bundles(base: &mut AssociationBundle, incoming: AssociationBundle) {
    let AssociationBundle {
        associations,
        study_metadata,
    } = incoming;

    for (study_id, meta) in study_metadata {
        match base.study_metadata.entry(study_id) {
            Entry::Vacant(slot) => {
                slot.insert(meta);
            }
            Entry::Occupied(mut slot) => {
                let known = slot.get_mut();
                for (trait_name, trait_meta) in meta.traits {
                    known.traits.entry(trait_name).or_insert(trait_meta);
                }
            }
        }
    }

    for (site, record) in associations {
        match base.associations.entry(site) {
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
            Entry::Occupied(mut slot) => {
                if !slot.key().is_rsid() {
                    continue;
                }
                let known = slot.get_mut();
                for (trait_name, study_map) in record.traits {
                    match known.traits.entry(trait_name) {
                        Entry::Vacant(slot) => {
                            slot.insert(study_map);
                        }
                        Entry::Occupied(mut slot) => {
                            for (study_id, variant_map) in study_map {
                                match slot.get_mut().entry(study_id) {
                                    Entry::Vacant(slot) => {
                                        slot.insert(variant_map);
                                    }
                                    Entry::Occupied(mut slot) => {
                                        for (composite, alleles) in variant_map {
                                            slot.get_mut().entry(composite).or_insert(alleles);
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::associations::EffectRecord;
    use crate::domain::{CompositeKey, SiteKey, StudyId, ValueKind};

    fn bundle_with(site: &str, trait_name: &str, study: &str, allele: &str) -> AssociationBundle {
        let mut bundle = AssociationBundle::default();
        let site: SiteKey = site.parse().unwrap();
        let study = StudyId::new(study);
        let composite = CompositeKey::new("NA", "NA", ValueKind::Beta);
        bundle
            .insert_effect(
                &site,
                Some("rs1"),
                trait_name,
                &study,
                &composite,
                allele,
                EffectRecord::beta(1e-8, 0.2, "cm"),
            )
            .unwrap();
        bundle.record_study(&study, "", "", trait_name, &composite, "EUR");
        bundle
    }

    #[test]
    fn empty_incoming_is_identity() {
        let mut base = bundle_with("rs1", "Acne", "GCST1", "A");
        let snapshot = base.clone();
        merge_bundles(&mut base, AssociationBundle::default());
        assert_eq!(base, snapshot);
    }

    #[test]
    fn empty_base_takes_incoming_wholesale() {
        let incoming = bundle_with("rs1", "Acne", "GCST1", "A");
        let mut base = AssociationBundle::default();
        merge_bundles(&mut base, incoming.clone());
        assert_eq!(base, incoming);
    }

    #[test]
    fn disjoint_merges_are_associative() {
        let a = bundle_with("rs1", "Acne", "GCST1", "A");
        let b = bundle_with("rs2", "Height", "GCST2", "G");
        let c = bundle_with("rs3", "Asthma", "GCST3", "T");

        let mut left = a.clone();
        merge_bundles(&mut left, b.clone());
        merge_bundles(&mut left, c.clone());

        let mut inner = b;
        merge_bundles(&mut inner, c);
        let mut right = a;
        merge_bundles(&mut right, inner);

        assert_eq!(left, right);
        assert_eq!(left.associations.len(), 3);
        assert_eq!(left.study_metadata.len(), 3);
    }

    #[test]
    fn positional_keys_are_merge_opaque() {
        let mut base = bundle_with("chr7:100", "Acne", "GCST1", "A");
        let incoming = bundle_with("chr7:100", "Height", "GCST2", "G");
        merge_bundles(&mut base, incoming);

        let record = base.associations.values().next().unwrap();
        assert_eq!(record.traits.len(), 1);
        assert!(record.traits.contains_key("Acne"));
        // metadata still merges by study, independent of the site key shape
        assert_eq!(base.study_metadata.len(), 2);
    }

    #[test]
    fn shared_rsid_gains_new_traits_studies_and_composites() {
        let mut base = bundle_with("rs1", "Acne", "GCST1", "A");
        merge_bundles(&mut base, bundle_with("rs1", "Height", "GCST1", "G"));
        merge_bundles(&mut base, bundle_with("rs1", "Acne", "GCST2", "G"));

        let record = base.associations.values().next().unwrap();
        assert_eq!(record.traits.len(), 2);
        assert_eq!(record.traits.get("Acne").unwrap().len(), 2);
    }

    #[test]
    fn existing_composite_key_is_never_remerged() {
        let mut base = bundle_with("rs1", "Acne", "GCST1", "A");
        // same composite slot, different allele and effect
        let incoming = bundle_with("rs1", "Acne", "GCST1", "G");
        merge_bundles(&mut base, incoming);

        let composite = CompositeKey::new("NA", "NA", ValueKind::Beta);
        let alleles = base
            .associations
            .values()
            .next()
            .unwrap()
            .traits
            .get("Acne")
            .unwrap()
            .get(&StudyId::new("GCST1"))
            .unwrap()
            .get(&composite)
            .unwrap();
        assert_eq!(alleles.len(), 1);
        assert!(alleles.contains_key("A"));
    }

    #[test]
    fn study_metadata_traits_are_first_writer_wins() {
        let mut base = bundle_with("rs1", "Acne", "GCST1", "A");
        let mut incoming = bundle_with("rs2", "Acne", "GCST1", "G");
        incoming
            .study_metadata
            .get_mut(&StudyId::new("GCST1"))
            .unwrap()
            .traits
            .get_mut("Acne")
            .unwrap()
            .super_populations = vec!["AFR".to_string()];
        merge_bundles(&mut base, incoming);

        let meta = base.study_metadata.get(&StudyId::new("GCST1")).unwrap();
        assert_eq!(
            meta.traits.get("Acne").unwrap().super_populations,
            vec!["EUR"]
        );
    }
}
