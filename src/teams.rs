use std::collections::HashSet;

use crate::admission;
use crate::error::{CompetitionError, PipelineResult};
use crate::{Competition, Participation, RegistrationMode};

/// Check a team against its competition: team participation only, kind/house
/// consistency, unique members, size within the team bounds.
/// Returns the normalized house id.
pub fn validate_team(
    competition: &Competition,
    kind: RegistrationMode,
    house_id: Option<String>,
    member_ids: &[String],
) -> PipelineResult<Option<String>> {
    if competition.participation != Participation::Team {
        return Err(CompetitionError::validation(format!(
            "{} is not a team competition", competition.name
        )));
    }
    let house_id = admission::validate_mode(kind, house_id)?;

    let mut seen = HashSet::new();
    if let Some(dup) = member_ids.iter().find(|id| !seen.insert(id.as_str())) {
        return Err(CompetitionError::validation(format!("student {} listed twice in team", dup)));
    }

    if let Some(bounds) = competition.team_config {
        let size = member_ids.len() as u32;
        if size < bounds.min_size || size > bounds.max_size {
            return Err(CompetitionError::validation(format!(
                "team size {} outside {}-{} for {}",
                size, bounds.min_size, bounds.max_size, competition.name
            )));
        }
    } else if member_ids.is_empty() {
        return Err(CompetitionError::validation("team needs at least one member"));
    }

    Ok(house_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CompetitionScope, TeamConfig};

    fn team_competition() -> Competition {
        Competition {
            id: "quiz".to_string(),
            school_id: "school".to_string(),
            name: "Quiz".to_string(),
            scope: CompetitionScope::Grade,
            participation: Participation::Team,
            team_config: Some(TeamConfig { min_size: 2, max_size: 3 }),
            points_config: Vec::new(),
            year: None,
        }
    }

    fn members(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_valid_house_team() {
        let house = validate_team(&team_competition(), RegistrationMode::House, Some("red".to_string()), &members(&["a", "b"]));
        assert_eq!(house.unwrap(), Some("red".to_string()));
    }

    #[test]
    fn test_size_bounds() {
        let comp = team_competition();
        assert!(validate_team(&comp, RegistrationMode::Independent, None, &members(&["a"])).is_err());
        assert!(validate_team(&comp, RegistrationMode::Independent, None, &members(&["a", "b", "c", "d"])).is_err());
        assert!(validate_team(&comp, RegistrationMode::Independent, None, &members(&["a", "b", "c"])).is_ok());
    }

    #[test]
    fn test_duplicate_member_rejected() {
        let err = validate_team(&team_competition(), RegistrationMode::Independent, None, &members(&["a", "a"])).unwrap_err();
        assert!(err.to_string().contains("listed twice"));
    }

    #[test]
    fn test_individual_competition_rejected() {
        let mut comp = team_competition();
        comp.participation = Participation::Individual;
        assert!(validate_team(&comp, RegistrationMode::Independent, None, &members(&["a", "b"])).is_err());
    }

    #[test]
    fn test_kind_house_mismatch_rejected() {
        let err = validate_team(&team_competition(), RegistrationMode::House, None, &members(&["a", "b"])).unwrap_err();
        assert_eq!(err.status(), 400);
    }
}
