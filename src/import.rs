// Bulk import of the competition catalog and the grade/student roster.
// Accepts JSON arrays exported by the school-administration CRUD service
// (camelCase field names) and upserts rows by id within one school.

use spacetimedb::{reducer, ReducerContext, Table, log};
use crate::{Competition, CompetitionScope, Grade, Participation, PipelineSettings, PlacePoints, Student, TeamConfig};
use crate::{competition, grade, student, load_settings, reject, require_gateway, short};
use crate::error::{CompetitionError, PipelineResult};
use crate::results::MAX_PLACE;
use serde_json::Value;

fn parse_array<'a>(data: &'a Value, what: &str) -> Result<&'a Vec<Value>, String> {
    data.as_array()
        .ok_or(format!("Expected JSON array of {}", what))
}

fn required_str(val: &Value, field: &str, label: &str, i: usize) -> Result<String, String> {
    val.get(field)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or(format!("{} {}: missing {}", label, i, field))
}

fn optional_str(val: &Value, field: &str) -> Option<String> {
    val.get(field)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// Accepts "id" or the document store's "_id"
fn record_id(val: &Value, label: &str, i: usize) -> Result<String, String> {
    required_str(val, "id", label, i)
        .or_else(|_| required_str(val, "_id", label, i))
}

fn parse_scope(val: &Value, i: usize) -> Result<CompetitionScope, String> {
    match val.get("scope").and_then(|v| v.as_str()).unwrap_or("grade") {
        "open" => Ok(CompetitionScope::Open),
        "grade" => Ok(CompetitionScope::Grade),
        "section" => Ok(CompetitionScope::Section),
        other => Err(format!("Competition {}: unknown scope {}", i, other)),
    }
}

fn parse_participation(val: &Value, i: usize) -> Result<Participation, String> {
    match val.get("participationType").and_then(|v| v.as_str()).unwrap_or("individual") {
        "individual" => Ok(Participation::Individual),
        "team" => Ok(Participation::Team),
        other => Err(format!("Competition {}: unknown participationType {}", i, other)),
    }
}

/// Non-negative integer that fits in u32; larger values are rejected, not wrapped
fn as_u32(val: &Value, what: &str, i: usize) -> Result<u32, String> {
    let n = val.as_u64()
        .ok_or(format!("Competition {}: {} not a non-negative integer", i, what))?;
    u32::try_from(n)
        .map_err(|_| format!("Competition {}: {} {} out of range", i, what, n))
}

/// Parse {"1": 15, "2": 10, ...}; missing table -> settings default
fn parse_points(val: &Value, settings: &PipelineSettings, i: usize) -> Result<Vec<PlacePoints>, String> {
    let Some(table) = val.get("pointsConfig").and_then(|v| v.as_object()) else {
        return Ok(settings.default_house_points.clone());
    };
    let mut points: Vec<PlacePoints> = table.iter()
        .map(|(place, points)| {
            let place: u8 = place.parse()
                .map_err(|e| format!("Competition {}: invalid place {}: {}", i, place, e))?;
            if place == 0 || place > MAX_PLACE {
                return Err(format!("Competition {}: points table place {} outside 1-{}", i, place, MAX_PLACE));
            }
            let points = as_u32(points, &format!("points for place {}", place), i)?;
            Ok(PlacePoints { place, points })
        })
        .collect::<Result<Vec<_>, String>>()?;
    points.sort_by_key(|p| p.place);
    Ok(points)
}

fn parse_team_config(val: &Value, participation: Participation, i: usize) -> Result<Option<TeamConfig>, String> {
    if participation != Participation::Team {
        return Ok(None);
    }
    let config = val.get("teamConfig")
        .ok_or(format!("Competition {}: team competition missing teamConfig", i))?;
    let min_size = config.get("minSize")
        .ok_or(format!("Competition {}: missing teamConfig.minSize", i))
        .and_then(|v| as_u32(v, "teamConfig.minSize", i))?;
    let max_size = config.get("maxSize")
        .ok_or(format!("Competition {}: missing teamConfig.maxSize", i))
        .and_then(|v| as_u32(v, "teamConfig.maxSize", i))?;
    if min_size == 0 || min_size > max_size {
        return Err(format!("Competition {}: invalid team size bounds {}-{}", i, min_size, max_size));
    }
    Ok(Some(TeamConfig { min_size, max_size }))
}

pub fn parse_competitions(json_data: &str, school_id: &str, settings: &PipelineSettings) -> Result<Vec<Competition>, String> {
    let data: Value = serde_json::from_str(json_data)
        .map_err(|e| format!("Invalid JSON: {}", e))?;

    parse_array(&data, "competitions")?
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let participation = parse_participation(c, i)?;
            Ok(Competition {
                id: record_id(c, "Competition", i)?,
                school_id: school_id.to_string(),
                name: required_str(c, "name", "Competition", i)?,
                scope: parse_scope(c, i)?,
                participation,
                team_config: parse_team_config(c, participation, i)?,
                points_config: parse_points(c, settings, i)?,
                year: c.get("year")
                    .filter(|v| !v.is_null())
                    .map(|v| as_u32(v, "year", i))
                    .transpose()?,
            })
        })
        .collect()
}

pub fn parse_grades(json_data: &str, school_id: &str) -> Result<Vec<Grade>, String> {
    let data: Value = serde_json::from_str(json_data)
        .map_err(|e| format!("Invalid JSON: {}", e))?;

    parse_array(&data, "grades")?
        .iter()
        .enumerate()
        .map(|(i, g)| {
            Ok(Grade {
                id: record_id(g, "Grade", i)?,
                school_id: school_id.to_string(),
                name: required_str(g, "name", "Grade", i)?,
                section_id: optional_str(g, "sectionId"),
            })
        })
        .collect()
}

pub fn parse_students(json_data: &str, school_id: &str) -> Result<Vec<Student>, String> {
    let data: Value = serde_json::from_str(json_data)
        .map_err(|e| format!("Invalid JSON: {}", e))?;

    parse_array(&data, "students")?
        .iter()
        .enumerate()
        .map(|(i, s)| {
            Ok(Student {
                id: record_id(s, "Student", i)?,
                school_id: school_id.to_string(),
                name: required_str(s, "name", "Student", i)?,
                grade_id: required_str(s, "gradeId", "Student", i)?,
                house_id: optional_str(s, "houseId"),
            })
        })
        .collect()
}

/// An id owned by another school is a conflict, not an overwrite
fn ensure_same_school(existing_school: Option<&str>, school_id: &str, what: &str, id: &str) -> PipelineResult<()> {
    match existing_school {
        Some(other) if other != school_id => Err(CompetitionError::conflict(format!(
            "{} {} belongs to another school", what, id
        ))),
        _ => Ok(()),
    }
}

/// Bulk upsert competitions (gateway only)
#[reducer]
pub fn bulk_import_competitions(ctx: &ReducerContext, school_id: String, json_data: String) -> Result<(), String> {
    require_gateway(ctx).map_err(|e| reject("IMPORT", e))?;
    let settings = load_settings(ctx);
    let competitions = parse_competitions(&json_data, &school_id, &settings)
        .map_err(|e| reject("IMPORT", CompetitionError::Validation(e)))?;

    let mut count = 0;
    for c in competitions {
        let existing = ctx.db.competition().id().find(&c.id);
        ensure_same_school(existing.as_ref().map(|e| e.school_id.as_str()), &school_id, "competition", &c.id)
            .map_err(|e| reject("IMPORT", e))?;
        if existing.is_some() {
            ctx.db.competition().id().update(c);
        } else {
            ctx.db.competition().insert(c);
        }
        count += 1;
    }

    log::info!("[IMPORT] competitions school:{} count:{}", short(&school_id), count);
    Ok(())
}

/// Bulk upsert grades with their section membership (gateway only)
#[reducer]
pub fn bulk_import_grades(ctx: &ReducerContext, school_id: String, json_data: String) -> Result<(), String> {
    require_gateway(ctx).map_err(|e| reject("IMPORT", e))?;
    let grades = parse_grades(&json_data, &school_id)
        .map_err(|e| reject("IMPORT", CompetitionError::Validation(e)))?;

    let mut count = 0;
    for g in grades {
        let existing = ctx.db.grade().id().find(&g.id);
        ensure_same_school(existing.as_ref().map(|e| e.school_id.as_str()), &school_id, "grade", &g.id)
            .map_err(|e| reject("IMPORT", e))?;
        if existing.is_some() {
            ctx.db.grade().id().update(g);
        } else {
            ctx.db.grade().insert(g);
        }
        count += 1;
    }

    log::info!("[IMPORT] grades school:{} count:{}", short(&school_id), count);
    Ok(())
}

/// Bulk upsert students (gateway only)
#[reducer]
pub fn bulk_import_students(ctx: &ReducerContext, school_id: String, json_data: String) -> Result<(), String> {
    require_gateway(ctx).map_err(|e| reject("IMPORT", e))?;
    let students = parse_students(&json_data, &school_id)
        .map_err(|e| reject("IMPORT", CompetitionError::Validation(e)))?;

    let mut count = 0;
    for s in students {
        let existing = ctx.db.student().id().find(&s.id);
        ensure_same_school(existing.as_ref().map(|e| e.school_id.as_str()), &school_id, "student", &s.id)
            .map_err(|e| reject("IMPORT", e))?;
        if existing.is_some() {
            ctx.db.student().id().update(s);
        } else {
            ctx.db.student().insert(s);
        }
        count += 1;
    }

    log::info!("[IMPORT] students school:{} count:{}", short(&school_id), count);
    Ok(())
}
