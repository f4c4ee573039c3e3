// Registration admission control.
//
// A house-mode registration is counted against the registrations of the same
// house inside its "bucket", which depends on the competition scope:
//   Open    -> every registration of the competition/year
//   Section -> registrations whose grade shares the registrant's section
//   Grade   -> registrations of exactly the registrant's grade
// Independent registrations only face the per-grade total.
//
// These functions decide; the reducer reads and writes inside one
// transaction, so the decision cannot go stale before the insert.

use crate::error::{CompetitionError, PipelineResult};
use crate::rules::ResolvedHouseRule;
use crate::{Competition, CompetitionScope, Grade, Participation, Registration, RegistrationMode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bucket {
    Competition,
    Section(String),
    Grade(String),
}

impl Bucket {
    /// Unit named in quota messages
    pub fn unit_name(&self) -> &'static str {
        match self {
            Bucket::Competition => "competition",
            Bucket::Section(_) => "section",
            Bucket::Grade(_) => "grade",
        }
    }

    fn describe(&self) -> String {
        match self {
            Bucket::Competition => "the competition".to_string(),
            Bucket::Section(id) => format!("section {}", id),
            Bucket::Grade(id) => format!("grade {}", id),
        }
    }
}

pub struct AdmissionRequest<'a> {
    pub student_id: &'a str,
    pub grade_id: &'a str,
    pub house_id: Option<&'a str>,
    pub mode: RegistrationMode,
    pub year: u32,
}

/// What the admission was counted against (for logging)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub bucket: Bucket,
    pub count: u32,
    pub ceiling: u32,
}

pub fn registration_key(school_id: &str, competition_id: &str, student_id: &str, year: u32) -> String {
    format!("{}:{}:{}:{}", school_id, competition_id, student_id, year)
}

pub fn already_registered(student_id: &str, competition_name: &str, year: u32) -> CompetitionError {
    CompetitionError::conflict(format!(
        "already registered: student {} is already entered in {} for {}",
        student_id, competition_name, year
    ))
}

/// Enforce mode/house consistency; an empty house id counts as absent.
/// Returns the normalized house id.
pub fn validate_mode(mode: RegistrationMode, house_id: Option<String>) -> PipelineResult<Option<String>> {
    let house_id = house_id.filter(|h| !h.trim().is_empty());
    match (mode, house_id) {
        (RegistrationMode::Independent, Some(_)) => Err(CompetitionError::validation(
            "independent registrations must not name a house",
        )),
        (RegistrationMode::House, None) => Err(CompetitionError::validation(
            "house registrations require a house",
        )),
        (_, house_id) => Ok(house_id),
    }
}

/// House ceiling: team max size for team competitions, else the rule
pub fn house_ceiling(competition: &Competition, rule: &ResolvedHouseRule) -> u32 {
    match (competition.participation, competition.team_config) {
        (Participation::Team, Some(team)) => team.max_size,
        _ => rule.max_per_house_per_grade,
    }
}

/// Bucket for a registrant's grade. A section-scoped competition falls back
/// to the grade bucket when the grade belongs to no section.
pub fn counting_bucket(scope: CompetitionScope, grade_id: &str, grades: &[Grade]) -> Bucket {
    match scope {
        CompetitionScope::Open => Bucket::Competition,
        CompetitionScope::Section => match section_of(grade_id, grades) {
            Some(section) => Bucket::Section(section.to_string()),
            None => Bucket::Grade(grade_id.to_string()),
        },
        CompetitionScope::Grade => Bucket::Grade(grade_id.to_string()),
    }
}

fn section_of<'a>(grade_id: &str, grades: &'a [Grade]) -> Option<&'a str> {
    grades.iter()
        .find(|g| g.id == grade_id)
        .and_then(|g| g.section_id.as_deref())
}

fn in_bucket(bucket: &Bucket, registration: &Registration, grades: &[Grade]) -> bool {
    match bucket {
        Bucket::Competition => true,
        Bucket::Section(section) => section_of(&registration.grade_id, grades) == Some(section.as_str()),
        Bucket::Grade(grade) => registration.grade_id == *grade,
    }
}

/// Decide whether a registration may be admitted.
/// `existing` may hold any registrations; only those of this competition and
/// year are counted. A student already entered is refused as a duplicate
/// before any quota is looked at.
pub fn admit(
    request: &AdmissionRequest,
    competition: &Competition,
    rule: &ResolvedHouseRule,
    existing: &[Registration],
    grades: &[Grade],
) -> PipelineResult<Admission> {
    let relevant = existing.iter()
        .filter(|r| r.competition_id == competition.id && r.year == request.year);

    if relevant.clone().any(|r| r.student_id == request.student_id) {
        return Err(already_registered(request.student_id, &competition.name, request.year));
    }

    match (request.mode, request.house_id) {
        (RegistrationMode::House, Some(house_id)) => {
            let bucket = counting_bucket(competition.scope, request.grade_id, grades);
            let ceiling = house_ceiling(competition, rule);
            let count = relevant
                .filter(|r| r.mode == RegistrationMode::House && r.house_id.as_deref() == Some(house_id))
                .filter(|r| in_bucket(&bucket, r, grades))
                .count() as u32;

            if count >= ceiling {
                return Err(CompetitionError::conflict(format!(
                    "quota exceeded: house {} already has {} of {} allowed entries in {} for {} ({})",
                    house_id, count, ceiling, bucket.describe(), competition.name, request.year
                )));
            }
            Ok(Admission { bucket, count, ceiling })
        }
        (RegistrationMode::Independent, None) => {
            let ceiling = rule.max_total_per_grade;
            let count = relevant
                .filter(|r| r.grade_id == request.grade_id)
                .count() as u32;

            if count >= ceiling {
                return Err(CompetitionError::conflict(format!(
                    "quota exceeded: grade {} already has {} of {} allowed entries for {} ({})",
                    request.grade_id, count, ceiling, competition.name, request.year
                )));
            }
            Ok(Admission { bucket: Bucket::Grade(request.grade_id.to_string()), count, ceiling })
        }
        _ => Err(CompetitionError::validation("registration mode does not match house")),
    }
}
