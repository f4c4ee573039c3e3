// House rule resolution: stored per-competition-per-year override,
// or the configured defaults marked as synthetic.

use spacetimedb::SpacetimeType;

use crate::error::{CompetitionError, PipelineResult};
use crate::{HouseRule, PipelineSettings};

/// Quota in force for one competition/year.
/// `is_default = true` means no override exists; never persist it.
#[derive(SpacetimeType, Debug, Clone, PartialEq, Eq)]
pub struct ResolvedHouseRule {
    pub competition_id: String,
    pub year: u32,
    pub max_per_house_per_grade: u32,
    pub max_total_per_grade: u32,
    pub notes: Option<String>,
    pub is_default: bool,
}

/// Field values an upsert will write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleFields {
    pub max_per_house_per_grade: u32,
    pub max_total_per_grade: u32,
    pub notes: Option<String>,
}

pub fn rule_key(school_id: &str, competition_id: &str, year: u32) -> String {
    format!("{}:{}:{}", school_id, competition_id, year)
}

pub fn resolve(
    stored: Option<&HouseRule>,
    competition_id: &str,
    year: u32,
    settings: &PipelineSettings,
) -> ResolvedHouseRule {
    match stored {
        Some(rule) => ResolvedHouseRule {
            competition_id: competition_id.to_string(),
            year,
            max_per_house_per_grade: rule.max_per_house_per_grade,
            max_total_per_grade: rule.max_total_per_grade,
            notes: rule.notes.clone(),
            is_default: false,
        },
        None => ResolvedHouseRule {
            competition_id: competition_id.to_string(),
            year,
            max_per_house_per_grade: settings.default_max_per_house_per_grade,
            max_total_per_grade: settings.default_max_total_per_grade,
            notes: None,
            is_default: true,
        },
    }
}

/// Merge an upsert request over the existing override (or the defaults).
/// Both ceilings must end up positive.
pub fn merge_override(
    existing: Option<&HouseRule>,
    max_per_house_per_grade: Option<u32>,
    max_total_per_grade: Option<u32>,
    notes: Option<String>,
    settings: &PipelineSettings,
) -> PipelineResult<RuleFields> {
    let (base_house, base_total, base_notes) = match existing {
        Some(rule) => (rule.max_per_house_per_grade, rule.max_total_per_grade, rule.notes.clone()),
        None => (settings.default_max_per_house_per_grade, settings.default_max_total_per_grade, None),
    };

    let fields = RuleFields {
        max_per_house_per_grade: max_per_house_per_grade.unwrap_or(base_house),
        max_total_per_grade: max_total_per_grade.unwrap_or(base_total),
        notes: notes.or(base_notes),
    };

    if fields.max_per_house_per_grade == 0 {
        return Err(CompetitionError::validation("maxPerHousePerGrade must be a positive integer"));
    }
    if fields.max_total_per_grade == 0 {
        return Err(CompetitionError::validation("maxTotalPerGrade must be a positive integer"));
    }
    Ok(fields)
}
