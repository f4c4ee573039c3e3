use std::collections::HashMap;

use spacetimedb::SpacetimeType;

use crate::settings::points_for;
use crate::{Competition, CompetitionResult};

/// House standing for one year; no tie breaking, order unspecified
#[derive(SpacetimeType, Debug, Clone, PartialEq, Eq)]
pub struct HousePoints {
    pub year: u32,
    pub house_id: String,
    pub points: u32,
}

/// Sum house points per (year, house) through each result's competition
/// points table. Award rows, houseless rows and results of unknown
/// competitions contribute nothing.
pub fn house_points(results: &[CompetitionResult], competitions: &[Competition]) -> Vec<HousePoints> {
    let tables: HashMap<&str, &Competition> = competitions.iter()
        .map(|c| (c.id.as_str(), c))
        .collect();

    let mut totals: HashMap<(u32, &str), u32> = HashMap::new();
    for result in results.iter().filter(|r| r.place > 0) {
        let (Some(house_id), Some(competition)) = (result.house_id.as_deref(), tables.get(result.competition_id.as_str())) else {
            continue;
        };
        *totals.entry((result.year, house_id)).or_insert(0) += points_for(&competition.points_config, result.place);
    }

    totals.into_iter()
        .map(|((year, house_id), points)| HousePoints {
            year,
            house_id: house_id.to_string(),
            points,
        })
        .collect()
}
