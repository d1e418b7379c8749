use crate::domain::SuperPopulation;

/// Parses the super-population cell of a GWAS row: uppercased, bar-split
/// when several populations are listed.
pub fn parse_population_tags(raw: &str) -> Vec<String> {
    let upper = raw.trim().to_uppercase();
    if upper.contains('|') {
        upper.split('|').map(|tag| tag.trim().to_string()).collect()
    } else {
        vec![upper]
    }
}

fn hierarchy(requested: SuperPopulation) -> [SuperPopulation; 5] {
    use SuperPopulation::*;
    match requested {
        Eur => [Eur, Amr, Sas, Eas, Afr],
        Amr => [Amr, Eur, Sas, Eas, Afr],
        Sas => [Sas, Eas, Amr, Eur, Afr],
        Eas => [Eas, Sas, Amr, Eur, Afr],
        Afr => [Afr, Amr, Sas, Eur, Eas],
    }
}

/// Picks the population whose LD data should back a study's associations:
/// the highest-ranked entry of the requested population's hierarchy that the
/// study observed. A lone `NA` tag and an empty intersection both fall back
/// to the requested population.
pub fn preferred_population(tags: &[String], requested: SuperPopulation) -> SuperPopulation {
    if tags.len() == 1 && tags[0].eq_ignore_ascii_case("na") {
        return requested;
    }
    for candidate in hierarchy(requested) {
        if tags.iter().any(|tag| tag == candidate.as_str()) {
            return candidate;
        }
    }
    requested
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn na_tag_falls_back_to_request() {
        let tags = parse_population_tags("NA");
        assert_eq!(
            preferred_population(&tags, SuperPopulation::Sas),
            SuperPopulation::Sas
        );
    }

    #[test]
    fn eur_request_prefers_eas_over_afr() {
        let tags = parse_population_tags("EAS|AFR");
        assert_eq!(
            preferred_population(&tags, SuperPopulation::Eur),
            SuperPopulation::Eas
        );
    }

    #[test]
    fn exact_match_wins() {
        let tags = parse_population_tags("AFR|EUR");
        assert_eq!(
            preferred_population(&tags, SuperPopulation::Eur),
            SuperPopulation::Eur
        );
    }

    #[test]
    fn unknown_tags_fall_back_to_request() {
        let tags = parse_population_tags("OCEANIC");
        assert_eq!(
            preferred_population(&tags, SuperPopulation::Amr),
            SuperPopulation::Amr
        );
    }

    #[test]
    fn tags_are_uppercased_and_split() {
        assert_eq!(parse_population_tags("eas|sas"), vec!["EAS", "SAS"]);
        assert_eq!(parse_population_tags("afr"), vec!["AFR"]);
    }

    #[test]
    fn afr_hierarchy_order() {
        let tags = parse_population_tags("EUR|EAS");
        assert_eq!(
            preferred_population(&tags, SuperPopulation::Afr),
            SuperPopulation::Eur
        );
    }
}
