// Result recording: batch validation and row planning.
// Places 1-5 are unique per competition/year; place 0 rows carry personal
// awards and are unconstrained.

use std::collections::HashSet;

use crate::error::{CompetitionError, PipelineResult};
use crate::{ResultEntry, Student, Team};

pub const MAX_PLACE: u8 = 5;

/// One row the recorder will insert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedResult {
    pub place: u8,
    pub student_id: Option<String>,
    pub team_id: Option<u64>,
    pub house_id: Option<String>,
    pub grade_id: Option<String>,
    pub award_name: Option<String>,
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Validate a batch on its own, before touching storage
pub fn validate_batch(entries: &[ResultEntry]) -> PipelineResult<()> {
    if entries.is_empty() {
        return Err(CompetitionError::validation("results batch is empty"));
    }

    let mut places = HashSet::new();
    for entry in entries {
        if entry.place > MAX_PLACE {
            return Err(CompetitionError::validation(format!(
                "place {} outside 0-{}", entry.place, MAX_PLACE
            )));
        }

        for winner in &entry.personal_award_winners {
            if present(&winner.student_id).is_none() || present(&winner.award_name).is_none() {
                return Err(CompetitionError::validation(
                    "personal awards need both a student and an award name",
                ));
            }
        }

        if entry.place == 0 {
            if entry.personal_award_winners.is_empty() {
                return Err(CompetitionError::validation(
                    "place 0 entries must list personal award winners",
                ));
            }
            continue;
        }

        let has_subject = present(&entry.student_id).is_some()
            || entry.team_id.is_some()
            || present(&entry.house_id).is_some();
        if !has_subject {
            return Err(CompetitionError::validation(format!(
                "place {} needs a student, team or house", entry.place
            )));
        }
        if !places.insert(entry.place) {
            return Err(CompetitionError::validation(format!(
                "place {} appears more than once in this batch", entry.place
            )));
        }
    }
    Ok(())
}

/// Expand a validated batch into rows, deriving house and grade:
/// house = explicit, else team house, else student's roster house;
/// grade = student's roster grade, else team grade.
pub fn plan_rows(
    competition_id: &str,
    entries: &[ResultEntry],
    teams: &[Team],
    students: &[Student],
) -> PipelineResult<Vec<PlannedResult>> {
    let student = |id: &str| students.iter().find(|s| s.id == id);
    let mut rows = Vec::new();

    for entry in entries {
        if entry.place > 0 {
            let team = match entry.team_id {
                Some(team_id) => {
                    let team = teams.iter()
                        .find(|t| t.id == team_id)
                        .ok_or_else(|| CompetitionError::not_found(format!("team {} not found", team_id)))?;
                    if team.competition_id != competition_id {
                        return Err(CompetitionError::validation(format!(
                            "team {} belongs to another competition", team_id
                        )));
                    }
                    Some(team)
                }
                None => None,
            };
            let student_id = present(&entry.student_id).map(str::to_string);
            let roster = student_id.as_deref().and_then(student);

            let house_id = present(&entry.house_id)
                .map(str::to_string)
                .or_else(|| team.and_then(|t| t.house_id.clone()))
                .or_else(|| roster.and_then(|s| s.house_id.clone()));
            let grade_id = roster.map(|s| s.grade_id.clone())
                .or_else(|| team.map(|t| t.grade_id.clone()));

            rows.push(PlannedResult {
                place: entry.place,
                student_id,
                team_id: entry.team_id,
                house_id,
                grade_id,
                award_name: None,
            });
        }

        for winner in &entry.personal_award_winners {
            let (Some(student_id), Some(award)) = (present(&winner.student_id), present(&winner.award_name)) else {
                continue;
            };
            let roster = student(student_id);
            rows.push(PlannedResult {
                place: 0,
                student_id: Some(student_id.to_string()),
                team_id: None,
                house_id: roster.and_then(|s| s.house_id.clone()),
                grade_id: roster.map(|s| s.grade_id.clone()),
                award_name: Some(award.to_string()),
            });
        }
    }
    Ok(rows)
}

/// Unique key of a placed row: one row per place per competition/year
pub fn place_key(school_id: &str, competition_id: &str, year: u32, place: u8) -> String {
    format!("{}:{}:{}:{}", school_id, competition_id, year, place)
}

/// Final key of an award row. Embeds the row's own id, so award rows never
/// collide with each other or with a place.
pub fn award_key(school_id: &str, competition_id: &str, year: u32, result_id: u64) -> String {
    format!("{}:{}:{}:award:{}", school_id, competition_id, year, result_id)
}

/// Key a planned row is inserted under. Award rows get a provisional key,
/// distinct within the batch, that the recorder swaps for `award_key` once
/// the auto-inc id is known; it never outlives the transaction.
pub fn insert_key(school_id: &str, competition_id: &str, year: u32, row: &PlannedResult, batch_index: usize) -> String {
    if row.place > 0 {
        place_key(school_id, competition_id, year, row.place)
    } else {
        format!("{}:{}:{}:award-pending:{}", school_id, competition_id, year, batch_index)
    }
}

/// Conflict raised when a place was recorded by an earlier request
pub fn place_taken(competition_name: &str, year: u32, place: u8) -> CompetitionError {
    CompetitionError::conflict(format!(
        "place {} already recorded for {} ({})", place, competition_name, year
    ))
}
