// Pipeline configuration: named defaults seeded into the singleton
// pipeline_settings row at init. Pure code takes &PipelineSettings so
// tests can inject their own values.

use crate::error::{CompetitionError, PipelineResult};
use crate::{PipelineSettings, PlacePoints, SelectionEntry};

/// Primary key of the singleton settings row
pub const SETTINGS_ROW_ID: u32 = 0;

/// Quota fallback when no house rule override exists
pub const DEFAULT_MAX_PER_HOUSE_PER_GRADE: u32 = 2;
pub const DEFAULT_MAX_TOTAL_PER_GRADE: u32 = 8;

/// A student may appear in at most this many competitions of one selection
pub const DEFAULT_MAX_COMPETITIONS_PER_STUDENT: u32 = 3;

/// Selection points above the house meet: 1st..5th
const DEFAULT_PLACEMENT_SCORES: [u32; 5] = [5, 4, 3, 2, 1];

/// House points when a competition carries no points table: 1st..5th
const DEFAULT_HOUSE_POINTS: [u32; 5] = [15, 10, 5, 0, 0];

/// Places 1..=5 paired with the given points
fn ladder(points: &[u32; 5]) -> Vec<PlacePoints> {
    points.iter()
        .enumerate()
        .map(|(i, &points)| PlacePoints { place: i as u8 + 1, points })
        .collect()
}

/// Look a place up in a place -> points table; missing places score 0
pub fn points_for(table: &[PlacePoints], place: u8) -> u32 {
    table.iter()
        .find(|p| p.place == place)
        .map(|p| p.points)
        .unwrap_or(0)
}

impl Default for PipelineSettings {
    fn default() -> Self {
        PipelineSettings {
            id: SETTINGS_ROW_ID,
            default_max_per_house_per_grade: DEFAULT_MAX_PER_HOUSE_PER_GRADE,
            default_max_total_per_grade: DEFAULT_MAX_TOTAL_PER_GRADE,
            max_competitions_per_student: DEFAULT_MAX_COMPETITIONS_PER_STUDENT,
            placement_scores: ladder(&DEFAULT_PLACEMENT_SCORES),
            default_house_points: ladder(&DEFAULT_HOUSE_POINTS),
        }
    }
}

impl PipelineSettings {
    /// Selection score of one entry; unplaced or unmapped places score 0
    pub fn placement_score(&self, place: Option<u8>) -> u32 {
        place.map_or(0, |p| points_for(&self.placement_scores, p))
    }

    /// Sum of placement scores; depends only on the multiset of places
    pub fn total_marks(&self, entries: &[SelectionEntry]) -> u32 {
        entries.iter()
            .map(|e| self.placement_score(e.place))
            .sum()
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.default_max_per_house_per_grade == 0 || self.default_max_total_per_grade == 0 {
            return Err(CompetitionError::validation("default quota ceilings must be positive"));
        }
        if self.max_competitions_per_student == 0 {
            return Err(CompetitionError::validation("max competitions per student must be positive"));
        }
        for table in [&self.placement_scores, &self.default_house_points] {
            if let Some(p) = table.iter().find(|p| p.place == 0 || p.place > 5) {
                return Err(CompetitionError::validation(format!(
                    "points table place {} outside 1-5", p.place
                )));
            }
        }
        Ok(())
    }
}
