// Team selection engine: zonal -> district -> allisland.
//
// A selection is one document per (school, level, year) whose entries are
// replaced wholesale on every save. Promotion copies the first places of a
// level into the next one, unplaced.

use std::collections::{BTreeMap, HashMap};

use spacetimedb::Timestamp;

use crate::error::{CompetitionError, PipelineResult};
use crate::results::MAX_PLACE;
use crate::{Competition, CompetitionResult, PipelineSettings, Registration, Selection, SelectionEntry, SelectionLevel};

impl SelectionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionLevel::Zonal => "zonal",
            SelectionLevel::District => "district",
            SelectionLevel::AllIsland => "allisland",
        }
    }

    /// Level whose first places feed this one
    pub fn previous(&self) -> Option<SelectionLevel> {
        match self {
            SelectionLevel::Zonal => None,
            SelectionLevel::District => Some(SelectionLevel::Zonal),
            SelectionLevel::AllIsland => Some(SelectionLevel::District),
        }
    }
}

pub fn selection_key(school_id: &str, level: SelectionLevel, year: u32) -> String {
    format!("{}:{}:{}", school_id, level.as_str(), year)
}

/// Candidate entry for a selection (not committed)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub competition_id: String,
    pub student_id: String,
    pub place: Option<u8>,
}

/// Reject the whole entry list if any student appears more than `max` times
pub fn enforce_max_per_student(entries: &[SelectionEntry], max: u32) -> PipelineResult<()> {
    let mut counts: HashMap<&str, u32> = HashMap::new();
    for entry in entries {
        let count = counts.entry(entry.student_id.as_str()).or_insert(0);
        *count += 1;
        if *count > max {
            return Err(CompetitionError::validation(format!(
                "student {} is entered in more than {} competitions", entry.student_id, max
            )));
        }
    }
    Ok(())
}

/// Who is writing a selection, and when
pub struct Author<'a> {
    pub school_id: &'a str,
    pub staff_id: &'a str,
    pub at: Timestamp,
}

/// Next state of the (level, year) selection document: `current` with its
/// entries replaced wholesale, or a fresh document. Fails before anything is
/// built if a student exceeds the per-student ceiling, so the stored
/// document stays as it was.
pub fn replace_selection(
    current: Option<&Selection>,
    author: &Author,
    level: SelectionLevel,
    year: u32,
    entries: Vec<SelectionEntry>,
    team_position: Option<u32>,
    settings: &PipelineSettings,
) -> PipelineResult<Selection> {
    enforce_max_per_student(&entries, settings.max_competitions_per_student)?;
    let total_marks = settings.total_marks(&entries);

    Ok(match current {
        Some(existing) => Selection {
            entries,
            total_marks,
            team_position,
            updated_by: author.staff_id.to_string(),
            updated_at: author.at,
            ..existing.clone()
        },
        None => Selection {
            id: 0, // auto_inc
            selection_key: selection_key(author.school_id, level, year),
            school_id: author.school_id.to_string(),
            level,
            year,
            entries,
            total_marks,
            team_position,
            updated_by: author.staff_id.to_string(),
            updated_at: author.at,
        },
    })
}

/// Entries carried into the next level: first places only, place cleared.
/// Unplaced entries are not promoted.
pub fn promotable_entries(entries: &[SelectionEntry]) -> Vec<SelectionEntry> {
    entries.iter()
        .filter(|e| e.place == Some(1))
        .map(|e| SelectionEntry { place: None, ..e.clone() })
        .collect()
}

fn defined_for_year(competition: &Competition, year: u32) -> bool {
    competition.year.map_or(true, |y| y == year)
}

/// Zonal suggestions from placed results with a student
pub fn zonal_candidates(results: &[CompetitionResult], competitions: &[Competition], year: u32) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = results.iter()
        .filter(|r| r.year == year && r.place >= 1 && r.place <= MAX_PLACE)
        .filter(|r| competitions.iter().any(|c| c.id == r.competition_id && defined_for_year(c, year)))
        .filter_map(|r| {
            r.student_id.as_ref().map(|student_id| Candidate {
                competition_id: r.competition_id.clone(),
                student_id: student_id.clone(),
                place: Some(r.place),
            })
        })
        .collect();
    candidates.sort_by(|a, b| {
        a.competition_id.cmp(&b.competition_id)
            .then(a.place.cmp(&b.place))
    });
    candidates
}

/// Fallback when no results exist yet: the earliest registrant per
/// competition, unplaced
pub fn registration_candidates(registrations: &[Registration], competitions: &[Competition], year: u32) -> Vec<Candidate> {
    let mut earliest: BTreeMap<&str, &Registration> = BTreeMap::new();
    for registration in registrations.iter().filter(|r| r.year == year) {
        let defined = competitions.iter()
            .any(|c| c.id == registration.competition_id && defined_for_year(c, year));
        if !defined {
            continue;
        }
        earliest.entry(registration.competition_id.as_str())
            .and_modify(|current| {
                if registration.id < current.id {
                    *current = registration;
                }
            })
            .or_insert(registration);
    }
    earliest.into_values()
        .map(|r| Candidate {
            competition_id: r.competition_id.clone(),
            student_id: r.student_id.clone(),
            place: None,
        })
        .collect()
}

/// District/allisland suggestions: the previous level's first places, unplaced
pub fn carried_candidates(prior_entries: &[SelectionEntry]) -> Vec<Candidate> {
    promotable_entries(prior_entries)
        .into_iter()
        .map(|e| Candidate {
            competition_id: e.competition_id,
            student_id: e.student_id,
            place: e.place,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CompetitionScope, Participation, RegistrationMode};

    const YEAR: u32 = 2031;

    fn entry(competition: &str, student: &str, place: Option<u8>) -> SelectionEntry {
        SelectionEntry {
            competition_id: competition.to_string(),
            student_id: student.to_string(),
            place,
        }
    }

    fn competition(id: &str, year: Option<u32>) -> Competition {
        Competition {
            id: id.to_string(),
            school_id: "school".to_string(),
            name: id.to_string(),
            scope: CompetitionScope::Grade,
            participation: Participation::Individual,
            team_config: None,
            points_config: Vec::new(),
            year,
        }
    }

    fn result(competition: &str, place: u8, student: Option<&str>, year: u32) -> CompetitionResult {
        CompetitionResult {
            id: 0,
            slot_key: format!("school:{}:{}:{}", competition, year, place),
            school_id: "school".to_string(),
            competition_id: competition.to_string(),
            year,
            place,
            student_id: student.map(|s| s.to_string()),
            team_id: None,
            house_id: None,
            grade_id: None,
            award_name: None,
            recorded_by: "staff".to_string(),
            recorded_at: Timestamp::from_micros_since_unix_epoch(0),
        }
    }

    fn registration(id: u64, competition: &str, student: &str) -> Registration {
        Registration {
            id,
            registration_key: format!("school:{}:{}:{}", competition, student, YEAR),
            school_id: "school".to_string(),
            competition_id: competition.to_string(),
            student_id: student.to_string(),
            grade_id: "g6".to_string(),
            house_id: None,
            mode: RegistrationMode::Independent,
            year: YEAR,
            registered_by: "staff".to_string(),
            registered_at: Timestamp::from_micros_since_unix_epoch(0),
        }
    }

    #[test]
    fn test_three_competitions_allowed_four_rejected() {
        let three = vec![entry("a", "s1", Some(1)), entry("b", "s1", None), entry("c", "s1", Some(2))];
        assert!(enforce_max_per_student(&three, 3).is_ok());

        let mut four = three.clone();
        four.push(entry("d", "s1", None));
        let err = enforce_max_per_student(&four, 3).unwrap_err();
        assert_eq!(err.status(), 400);
        assert!(err.to_string().contains("s1"));
    }

    #[test]
    fn test_ceiling_counts_students_independently() {
        let entries = vec![
            entry("a", "s1", None), entry("b", "s1", None), entry("c", "s1", None),
            entry("a", "s2", None), entry("b", "s2", None), entry("c", "s2", None),
        ];
        assert!(enforce_max_per_student(&entries, 3).is_ok());
    }

    fn author(micros: i64) -> Author<'static> {
        Author {
            school_id: "school",
            staff_id: "staff",
            at: Timestamp::from_micros_since_unix_epoch(micros),
        }
    }

    #[test]
    fn test_saved_selection_reads_back_unchanged() {
        let settings = PipelineSettings::default();
        let entries = vec![entry("b", "s2", Some(2)), entry("a", "s1", Some(1)), entry("c", "s3", None)];

        let created = replace_selection(None, &author(1), SelectionLevel::Zonal, YEAR, entries.clone(), Some(4), &settings).unwrap();
        assert_eq!(created.selection_key, "school:zonal:2031");
        assert_eq!(created.entries, entries);
        assert_eq!(created.total_marks, 9);
        assert_eq!(created.total_marks, settings.total_marks(&created.entries));
        assert_eq!(created.team_position, Some(4));

        let stored = Selection { id: 12, ..created };
        let resaved = replace_selection(Some(&stored), &author(2), SelectionLevel::Zonal, YEAR, stored.entries.clone(), stored.team_position, &settings).unwrap();
        assert_eq!(resaved.id, 12);
        assert_eq!(resaved.entries, stored.entries);
        assert_eq!(resaved.total_marks, stored.total_marks);
        assert_eq!(resaved.updated_at, Timestamp::from_micros_since_unix_epoch(2));
    }

    #[test]
    fn test_replacement_drops_previous_entries() {
        let settings = PipelineSettings::default();
        let stored = Selection {
            id: 3,
            ..replace_selection(None, &author(1), SelectionLevel::District, YEAR, vec![entry("a", "s1", Some(1))], Some(2), &settings).unwrap()
        };
        let next = replace_selection(Some(&stored), &author(2), SelectionLevel::District, YEAR, vec![entry("b", "s2", Some(3))], None, &settings).unwrap();
        assert_eq!(next.entries, vec![entry("b", "s2", Some(3))]);
        assert_eq!(next.total_marks, 3);
        assert_eq!(next.team_position, None);
    }

    #[test]
    fn test_fourth_competition_leaves_stored_selection_alone() {
        let settings = PipelineSettings::default();
        let stored = replace_selection(None, &author(1), SelectionLevel::Zonal, YEAR, vec![entry("a", "s1", Some(1))], None, &settings).unwrap();
        let before = stored.clone();

        let four = vec![entry("a", "s1", Some(1)), entry("b", "s1", None), entry("c", "s1", None), entry("d", "s1", None)];
        let err = replace_selection(Some(&stored), &author(2), SelectionLevel::Zonal, YEAR, four, None, &settings).unwrap_err();
        assert_eq!(err.status(), 400);
        assert_eq!(stored, before);
        assert_eq!(stored.entries, vec![entry("a", "s1", Some(1))]);
    }

    #[test]
    fn test_promotion_keeps_first_places_unplaced() {
        let zonal = vec![
            entry("a", "s1", Some(1)),
            entry("b", "s2", Some(2)),
            entry("c", "s3", None),
            entry("d", "s4", Some(1)),
        ];
        let promoted = promotable_entries(&zonal);
        assert_eq!(promoted, vec![entry("a", "s1", None), entry("d", "s4", None)]);
    }

    #[test]
    fn test_promoted_selection_scores_zero() {
        let settings = PipelineSettings::default();
        let promoted = promotable_entries(&[entry("a", "s1", Some(1))]);
        assert_eq!(promoted.len(), 1);
        assert_eq!(settings.total_marks(&promoted), 0);
    }

    #[test]
    fn test_level_pipeline() {
        assert_eq!(SelectionLevel::Zonal.previous(), None);
        assert_eq!(SelectionLevel::District.previous(), Some(SelectionLevel::Zonal));
        assert_eq!(SelectionLevel::AllIsland.previous(), Some(SelectionLevel::District));
        assert_eq!(selection_key("s", SelectionLevel::AllIsland, YEAR), "s:allisland:2031");
    }

    #[test]
    fn test_zonal_candidates_from_results() {
        let competitions = vec![competition("chess", Some(YEAR)), competition("relay", None), competition("old", Some(2020))];
        let results = vec![
            result("chess", 2, Some("s2"), YEAR),
            result("chess", 1, Some("s1"), YEAR),
            result("chess", 0, Some("s9"), YEAR),
            result("relay", 1, None, YEAR),
            result("relay", 3, Some("s3"), YEAR),
            result("old", 1, Some("s4"), YEAR),
            result("chess", 1, Some("s5"), YEAR - 1),
        ];
        let candidates = zonal_candidates(&results, &competitions, YEAR);
        let picked: Vec<(&str, &str, Option<u8>)> = candidates.iter()
            .map(|c| (c.competition_id.as_str(), c.student_id.as_str(), c.place))
            .collect();
        assert_eq!(picked, vec![
            ("chess", "s1", Some(1)),
            ("chess", "s2", Some(2)),
            ("relay", "s3", Some(3)),
        ]);
    }

    #[test]
    fn test_registration_fallback_one_per_competition() {
        let competitions = vec![competition("chess", Some(YEAR)), competition("relay", None)];
        let registrations = vec![
            registration(5, "chess", "s5"),
            registration(2, "chess", "s2"),
            registration(3, "relay", "s3"),
            registration(1, "unknown", "s1"),
        ];
        let candidates = registration_candidates(&registrations, &competitions, YEAR);
        assert_eq!(candidates, vec![
            Candidate { competition_id: "chess".to_string(), student_id: "s2".to_string(), place: None },
            Candidate { competition_id: "relay".to_string(), student_id: "s3".to_string(), place: None },
        ]);
    }

    #[test]
    fn test_carried_candidates_are_first_places() {
        let prior = vec![entry("a", "s1", Some(1)), entry("b", "s2", Some(3))];
        let candidates = carried_candidates(&prior);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].student_id, "s1");
        assert_eq!(candidates[0].place, None);
    }
}
