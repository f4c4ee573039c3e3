// List filters behind the my_* views.
// Unset filter fields match everything.

use crate::{CompetitionResult, ListFilter, Registration, SelectionLevel, Team};

/// Grades a registration listing may show
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GradeScope {
    Any,
    Only(Vec<String>),
}

impl GradeScope {
    fn allows(&self, grade_id: &str) -> bool {
        match self {
            GradeScope::Any => true,
            GradeScope::Only(grades) => grades.iter().any(|g| g == grade_id),
        }
    }
}

/// Intersect the requested grade with the caller's restriction.
/// An empty intersection is `Only([])`: no rows, not an error.
pub fn grade_scope(requested: Option<&str>, restricted: Option<&[String]>) -> GradeScope {
    match (requested, restricted) {
        (None, None) => GradeScope::Any,
        (Some(grade), None) => GradeScope::Only(vec![grade.to_string()]),
        (None, Some(allowed)) => GradeScope::Only(allowed.to_vec()),
        (Some(grade), Some(allowed)) => GradeScope::Only(
            allowed.iter().filter(|g| *g == grade).cloned().collect()
        ),
    }
}

fn matches<T: PartialEq + ?Sized>(wanted: Option<&T>, actual: &T) -> bool {
    wanted.map_or(true, |w| w == actual)
}

fn matches_opt(wanted: Option<&str>, actual: Option<&str>) -> bool {
    wanted.map_or(true, |w| actual == Some(w))
}

impl ListFilter {
    /// Grade is handled by `scope`, which already folds in the filter's grade
    pub fn matches_registration(&self, registration: &Registration, scope: &GradeScope) -> bool {
        matches(self.competition_id.as_deref(), registration.competition_id.as_str())
            && matches(self.year.as_ref(), &registration.year)
            && matches(self.mode.as_ref(), &registration.mode)
            && matches_opt(self.house_id.as_deref(), registration.house_id.as_deref())
            && scope.allows(&registration.grade_id)
    }

    pub fn matches_result(&self, result: &CompetitionResult) -> bool {
        matches(self.competition_id.as_deref(), result.competition_id.as_str())
            && matches(self.year.as_ref(), &result.year)
            && matches(self.place.as_ref(), &result.place)
            && matches_opt(self.grade_id.as_deref(), result.grade_id.as_deref())
            && matches_opt(self.house_id.as_deref(), result.house_id.as_deref())
    }

    pub fn matches_team(&self, team: &Team) -> bool {
        matches(self.competition_id.as_deref(), team.competition_id.as_str())
            && matches(self.year.as_ref(), &team.year)
            && matches(self.grade_id.as_deref(), team.grade_id.as_str())
            && matches_opt(self.house_id.as_deref(), team.house_id.as_deref())
    }

    pub fn matches_selection(&self, level: SelectionLevel, year: u32) -> bool {
        matches(self.level.as_ref(), &level) && matches(self.year.as_ref(), &year)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RegistrationMode;
    use spacetimedb::Timestamp;

    fn registration(grade: &str, house: Option<&str>, year: u32) -> Registration {
        Registration {
            id: 0,
            registration_key: String::new(),
            school_id: "school".to_string(),
            competition_id: "chess".to_string(),
            student_id: "s1".to_string(),
            grade_id: grade.to_string(),
            house_id: house.map(|h| h.to_string()),
            mode: if house.is_some() { RegistrationMode::House } else { RegistrationMode::Independent },
            year,
            registered_by: "staff".to_string(),
            registered_at: Timestamp::from_micros_since_unix_epoch(0),
        }
    }

    fn grades(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_grade_scope_intersection() {
        let allowed = grades(&["g6", "g7"]);
        assert_eq!(grade_scope(None, None), GradeScope::Any);
        assert_eq!(grade_scope(Some("g6"), None), GradeScope::Only(grades(&["g6"])));
        assert_eq!(grade_scope(None, Some(allowed.as_slice())), GradeScope::Only(allowed.clone()));
        assert_eq!(grade_scope(Some("g7"), Some(allowed.as_slice())), GradeScope::Only(grades(&["g7"])));
        assert_eq!(grade_scope(Some("g9"), Some(allowed.as_slice())), GradeScope::Only(Vec::new()));
    }

    #[test]
    fn test_empty_intersection_yields_no_rows() {
        let allowed = grades(&["g6"]);
        let scope = grade_scope(Some("g9"), Some(allowed.as_slice()));
        let filter = ListFilter { grade_id: Some("g9".to_string()), ..ListFilter::default() };
        assert!(!filter.matches_registration(&registration("g9", None, 2031), &scope));
        assert!(!filter.matches_registration(&registration("g6", None, 2031), &scope));
    }

    #[test]
    fn test_registration_filters() {
        let filter = ListFilter {
            year: Some(2031),
            mode: Some(RegistrationMode::House),
            house_id: Some("red".to_string()),
            ..ListFilter::default()
        };
        let scope = GradeScope::Any;
        assert!(filter.matches_registration(&registration("g6", Some("red"), 2031), &scope));
        assert!(!filter.matches_registration(&registration("g6", Some("blue"), 2031), &scope));
        assert!(!filter.matches_registration(&registration("g6", None, 2031), &scope));
        assert!(!filter.matches_registration(&registration("g6", Some("red"), 2030), &scope));
    }

    #[test]
    fn test_selection_filter() {
        let filter = ListFilter { level: Some(SelectionLevel::District), ..ListFilter::default() };
        assert!(filter.matches_selection(SelectionLevel::District, 2031));
        assert!(!filter.matches_selection(SelectionLevel::Zonal, 2031));
        assert!(ListFilter::default().matches_selection(SelectionLevel::Zonal, 1999));
    }
}
