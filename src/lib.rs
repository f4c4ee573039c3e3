use spacetimedb::{
    ReducerContext, Identity, Table, Timestamp,
    table, reducer, view, SpacetimeType,
};
use chrono::Datelike;

mod error;
mod settings;
mod rules;
mod admission;
mod teams;
mod results;
mod team_selection;
mod standings;
mod filters;

// Catalog and roster import from the external CRUD system
mod import;

use error::{CompetitionError, PipelineResult};
use rules::ResolvedHouseRule;
use standings::HousePoints;

// ==================== HELPER FUNCTIONS ====================

/// First 8 chars of an id for log lines
fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Gateway (module owner or worker) check
fn is_gateway(ctx: &ReducerContext) -> bool {
    ctx.db.authorized_worker().identity().find(&ctx.sender).is_some()
}

fn require_gateway(ctx: &ReducerContext) -> PipelineResult<()> {
    if is_gateway(ctx) {
        Ok(())
    } else {
        Err(CompetitionError::unauthorized("only the gateway can call this reducer"))
    }
}

/// Get the staff session for the caller; the tenant comes from here
fn staff_session(ctx: &ReducerContext) -> PipelineResult<StaffSession> {
    ctx.db.staff_session()
        .connection_id()
        .find(&ctx.sender)
        .ok_or_else(|| CompetitionError::unauthorized("no staff session for this connection"))
}

/// Calendar year of the transaction timestamp, used when callers omit `year`
fn current_year(ctx: &ReducerContext) -> u32 {
    let micros = ctx.timestamp.to_micros_since_unix_epoch();
    chrono::DateTime::from_timestamp_micros(micros)
        .map(|dt| dt.year().max(0) as u32)
        .unwrap_or(1970)
}

fn load_settings(ctx: &ReducerContext) -> PipelineSettings {
    ctx.db.pipeline_settings()
        .id()
        .find(&settings::SETTINGS_ROW_ID)
        .unwrap_or_default()
}

fn find_competition(ctx: &ReducerContext, school_id: &str, competition_id: &str) -> PipelineResult<Competition> {
    ctx.db.competition()
        .id()
        .find(&competition_id.to_string())
        .filter(|c| c.school_id == school_id)
        .ok_or_else(|| CompetitionError::not_found(format!("competition {} not found", competition_id)))
}

/// Log a rejected request and flatten it for the reducer boundary.
/// Returning Err rolls the whole transaction back.
fn reject(op: &str, err: CompetitionError) -> String {
    log::warn!("[{}] rejected status:{} reason:{}", op, err.status(), err);
    err.to_reducer_error()
}

// ==================== TYPES ====================

/// How the quota bucket of a competition is computed
#[derive(SpacetimeType, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompetitionScope {
    Open,     // competition-wide
    Grade,    // per grade (default)
    Section,  // per group of grades
}

#[derive(SpacetimeType, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Participation {
    Individual,
    Team,
}

/// House-mode entries count against the house quota; independent ones only
/// against the per-grade total. Also used as the kind of a team.
#[derive(SpacetimeType, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationMode {
    House,
    Independent,
}

/// Selection tiers, in pipeline order
#[derive(SpacetimeType, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionLevel {
    Zonal,
    District,
    AllIsland,
}

#[derive(SpacetimeType, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeamConfig {
    pub min_size: u32,
    pub max_size: u32,
}

/// One row of a place -> points table
#[derive(SpacetimeType, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacePoints {
    pub place: u8,
    pub points: u32,
}

/// Selection entry; `place = None` means unplaced
#[derive(SpacetimeType, Debug, Clone, PartialEq, Eq)]
pub struct SelectionEntry {
    pub competition_id: String,
    pub student_id: String,
    pub place: Option<u8>,
}

/// Personal award attached to a result entry; both fields are required
/// but arrive optional so a missing one can be reported
#[derive(SpacetimeType, Debug, Clone, PartialEq, Eq)]
pub struct AwardWinner {
    pub student_id: Option<String>,
    pub award_name: Option<String>,
}

/// One entry of a `record_results` batch
#[derive(SpacetimeType, Debug, Clone, PartialEq, Eq)]
pub struct ResultEntry {
    pub place: u8,
    pub student_id: Option<String>,
    pub team_id: Option<u64>,
    pub house_id: Option<String>,
    pub personal_award_winners: Vec<AwardWinner>,
}

/// Per-connection list filter applied by the `my_*` views
#[derive(SpacetimeType, Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub competition_id: Option<String>,
    pub year: Option<u32>,
    pub mode: Option<RegistrationMode>,
    pub grade_id: Option<String>,
    pub house_id: Option<String>,
    pub place: Option<u8>,
    pub level: Option<SelectionLevel>,
}

// ==================== TABLES ====================

/// Identities allowed to call gateway/admin reducers
#[table(name = authorized_worker)]
pub struct AuthorizedWorker {
    #[primary_key]
    pub identity: Identity,
}

/// Staff session created by the gateway after it authenticated the user.
/// PRIVATE: links a connection to a staff member and their school.
#[table(name = staff_session)]
#[derive(Clone, Debug)]
pub struct StaffSession {
    #[primary_key]
    pub connection_id: Identity,

    pub staff_id: String,

    /// Tenant for every operation issued on this connection
    pub school_id: String,

    /// Grades this staff member may see (None = unrestricted)
    pub restricted_grade_ids: Option<Vec<String>>,

    /// Filters applied by the list views
    pub filter: ListFilter,

    pub connected_at: Timestamp,
}

/// Singleton configuration row, seeded at init
#[table(name = pipeline_settings)]
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineSettings {
    #[primary_key]
    pub id: u32,

    /// Quota fallback when no house rule override exists
    pub default_max_per_house_per_grade: u32,
    pub default_max_total_per_grade: u32,

    /// Max competitions one student may hold within a selection
    pub max_competitions_per_student: u32,

    /// Selection points per place (levels above the house meet)
    pub placement_scores: Vec<PlacePoints>,

    /// House points used when an imported competition has no points table
    pub default_house_points: Vec<PlacePoints>,
}

/// Competition definition (imported from the catalog)
#[table(name = competition)]
#[derive(Clone, Debug)]
pub struct Competition {
    #[primary_key]
    pub id: String,

    #[index(btree)]
    pub school_id: String,

    pub name: String,

    pub scope: CompetitionScope,

    pub participation: Participation,

    /// Team size bounds (team participation only)
    pub team_config: Option<TeamConfig>,

    /// Place -> house points, used only for house standings
    pub points_config: Vec<PlacePoints>,

    /// None = year-agnostic main definition
    pub year: Option<u32>,
}

/// Grade roster row; carries the grade -> section membership
#[table(name = grade)]
#[derive(Clone, Debug)]
pub struct Grade {
    #[primary_key]
    pub id: String,

    #[index(btree)]
    pub school_id: String,

    pub name: String,

    pub section_id: Option<String>,
}

/// Student roster row (display data and house derivation)
#[table(name = student)]
#[derive(Clone, Debug)]
pub struct Student {
    #[primary_key]
    pub id: String,

    #[index(btree)]
    pub school_id: String,

    pub name: String,

    pub grade_id: String,

    pub house_id: Option<String>,
}

/// Quota override for one competition in one year.
/// Absence means "use defaults"; never created on read.
#[table(name = house_rule)]
#[derive(Clone, Debug)]
pub struct HouseRule {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    /// "school:competition:year"
    #[unique]
    pub rule_key: String,

    #[index(btree)]
    pub school_id: String,

    pub competition_id: String,

    pub year: u32,

    pub max_per_house_per_grade: u32,

    pub max_total_per_grade: u32,

    pub notes: Option<String>,

    pub updated_by: String,

    pub updated_at: Timestamp,
}

/// One student entered in one competition for one year
#[table(name = registration)]
#[derive(Clone, Debug)]
pub struct Registration {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    /// "school:competition:student:year" - storage-level double registration guard
    #[unique]
    pub registration_key: String,

    #[index(btree)]
    pub school_id: String,

    #[index(btree)]
    pub competition_id: String,

    pub student_id: String,

    pub grade_id: String,

    /// Some iff mode == House
    pub house_id: Option<String>,

    pub mode: RegistrationMode,

    pub year: u32,

    pub registered_by: String,

    pub registered_at: Timestamp,
}

/// Team entry for team-participation competitions
#[table(name = team)]
#[derive(Clone, Debug)]
pub struct Team {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    #[index(btree)]
    pub school_id: String,

    pub competition_id: String,

    pub year: u32,

    pub kind: RegistrationMode,

    pub house_id: Option<String>,

    pub grade_id: String,

    /// Ordered, unique student ids
    pub member_ids: Vec<String>,

    pub created_by: String,

    pub created_at: Timestamp,
}

/// Placement of one competition in one year.
/// place 0 = personal award row (no place uniqueness)
#[table(name = competition_result)]
#[derive(Clone, Debug)]
pub struct CompetitionResult {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    /// "school:competition:year:place" for places 1-5,
    /// "school:competition:year:award:<id>" for place 0 (never collides)
    #[unique]
    pub slot_key: String,

    #[index(btree)]
    pub school_id: String,

    #[index(btree)]
    pub competition_id: String,

    pub year: u32,

    pub place: u8,

    pub student_id: Option<String>,

    pub team_id: Option<u64>,

    /// Explicit house, else team house, else student's roster house
    pub house_id: Option<String>,

    /// Student's roster grade, else team grade
    pub grade_id: Option<String>,

    pub award_name: Option<String>,

    pub recorded_by: String,

    pub recorded_at: Timestamp,
}

/// Team selection for one level in one year.
/// Entries are replaced wholesale on every save.
#[table(name = selection)]
#[derive(Clone, Debug, PartialEq)]
pub struct Selection {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    /// "school:level:year"
    #[unique]
    pub selection_key: String,

    #[index(btree)]
    pub school_id: String,

    pub level: SelectionLevel,

    pub year: u32,

    pub entries: Vec<SelectionEntry>,

    /// Cached sum of placement scores over entries
    pub total_marks: u32,

    /// Admin-set finishing position of the whole team
    pub team_position: Option<u32>,

    pub updated_by: String,

    pub updated_at: Timestamp,
}

/// Candidate list for a selection, rebuilt by refresh_suggestions.
/// Not a committed selection.
#[table(name = selection_suggestion)]
#[derive(Clone, Debug)]
pub struct SelectionSuggestion {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    #[index(btree)]
    pub school_id: String,

    pub level: SelectionLevel,

    pub year: u32,

    pub competition_id: String,

    pub competition_name: String,

    pub student_id: String,

    pub student_name: String,

    pub place: Option<u8>,
}

// ==================== VIEWS ====================

/// listRegistrations: caller's school, list filter, grade restriction
#[view(name = my_registrations, public)]
fn my_registrations(ctx: &spacetimedb::ViewContext) -> Vec<Registration> {
    let Some(session) = ctx.db.staff_session().connection_id().find(ctx.sender) else {
        return Vec::new();
    };
    let scope = filters::grade_scope(
        session.filter.grade_id.as_deref(),
        session.restricted_grade_ids.as_deref(),
    );
    ctx.db.registration()
        .school_id()
        .filter(&session.school_id)
        .filter(|r| session.filter.matches_registration(r, &scope))
        .collect()
}

/// listResults
#[view(name = my_results, public)]
fn my_results(ctx: &spacetimedb::ViewContext) -> Vec<CompetitionResult> {
    let Some(session) = ctx.db.staff_session().connection_id().find(ctx.sender) else {
        return Vec::new();
    };
    ctx.db.competition_result()
        .school_id()
        .filter(&session.school_id)
        .filter(|r| session.filter.matches_result(r))
        .collect()
}

#[view(name = my_teams, public)]
fn my_teams(ctx: &spacetimedb::ViewContext) -> Vec<Team> {
    let Some(session) = ctx.db.staff_session().connection_id().find(ctx.sender) else {
        return Vec::new();
    };
    ctx.db.team()
        .school_id()
        .filter(&session.school_id)
        .filter(|t| session.filter.matches_team(t))
        .collect()
}

/// getHouseRule: stored override or the synthetic default (never persisted).
/// Needs competition_id and year in the list filter.
#[view(name = my_house_rule, public)]
fn my_house_rule(ctx: &spacetimedb::ViewContext) -> Option<ResolvedHouseRule> {
    let session = ctx.db.staff_session().connection_id().find(ctx.sender)?;
    let competition_id = session.filter.competition_id.clone()?;
    let year = session.filter.year?;
    let settings = ctx.db.pipeline_settings()
        .id()
        .find(settings::SETTINGS_ROW_ID)
        .unwrap_or_default();
    let key = rules::rule_key(&session.school_id, &competition_id, year);
    let stored = ctx.db.house_rule().rule_key().find(&key);
    Some(rules::resolve(stored.as_ref(), &competition_id, year, &settings))
}

/// getSelection for the filter's level/year
#[view(name = my_selection, public)]
fn my_selection(ctx: &spacetimedb::ViewContext) -> Vec<Selection> {
    let Some(session) = ctx.db.staff_session().connection_id().find(ctx.sender) else {
        return Vec::new();
    };
    ctx.db.selection()
        .school_id()
        .filter(&session.school_id)
        .filter(|s| session.filter.matches_selection(s.level, s.year))
        .collect()
}

/// getSuggestions for the filter's level/year (see refresh_suggestions)
#[view(name = my_suggestions, public)]
fn my_suggestions(ctx: &spacetimedb::ViewContext) -> Vec<SelectionSuggestion> {
    let Some(session) = ctx.db.staff_session().connection_id().find(ctx.sender) else {
        return Vec::new();
    };
    ctx.db.selection_suggestion()
        .school_id()
        .filter(&session.school_id)
        .filter(|s| session.filter.matches_selection(s.level, s.year))
        .collect()
}

/// getHousePoints: computed on read, nothing stored
#[view(name = my_house_points, public)]
fn my_house_points(ctx: &spacetimedb::ViewContext) -> Vec<HousePoints> {
    let Some(session) = ctx.db.staff_session().connection_id().find(ctx.sender) else {
        return Vec::new();
    };
    let results: Vec<CompetitionResult> = ctx.db.competition_result()
        .school_id()
        .filter(&session.school_id)
        .collect();
    let competitions: Vec<Competition> = ctx.db.competition()
        .school_id()
        .filter(&session.school_id)
        .collect();
    standings::house_points(&results, &competitions)
        .into_iter()
        .filter(|hp| session.filter.year.map_or(true, |y| hp.year == y))
        .collect()
}

// ==================== SESSION & SETTINGS REDUCERS ====================

/// Initialize module: owner becomes a gateway identity, settings get seeded
#[reducer(init)]
pub fn init(ctx: &ReducerContext) {
    // In init, ctx.sender is the module owner identity
    if ctx.db.authorized_worker().identity().find(&ctx.sender).is_none() {
        ctx.db.authorized_worker().insert(AuthorizedWorker {
            identity: ctx.sender,
        });
    }

    // Keep existing settings on re-publish
    if ctx.db.pipeline_settings().id().find(&settings::SETTINGS_ROW_ID).is_none() {
        ctx.db.pipeline_settings().insert(PipelineSettings::default());
    }

    log::info!("House meet module initialized");
}

/// Create a staff session for a client identity.
/// Called by the gateway AFTER it authenticated the user and resolved the tenant.
#[reducer]
pub fn create_staff_session(
    ctx: &ReducerContext,
    client_identity: String,
    staff_id: String,
    school_id: String,
    restricted_grade_ids: Option<Vec<String>>,
) -> Result<(), String> {
    require_gateway(ctx).map_err(|e| reject("SESSION", e))?;

    let identity = Identity::from_hex(&client_identity)
        .map_err(|_| reject("SESSION", CompetitionError::validation("invalid identity hex string")))?;

    // Same staff member reconnecting OR same connection id (prevents PK conflict)
    let stale: Vec<_> = ctx.db.staff_session()
        .iter()
        .filter(|s| s.staff_id == staff_id || s.connection_id == identity)
        .map(|s| s.connection_id)
        .collect();
    for conn_id in stale {
        ctx.db.staff_session().connection_id().delete(&conn_id);
    }

    let restricted = restricted_grade_ids.as_ref().map_or(0, |g| g.len());
    ctx.db.staff_session().insert(StaffSession {
        connection_id: identity,
        staff_id: staff_id.clone(),
        school_id: school_id.clone(),
        restricted_grade_ids,
        filter: ListFilter::default(),
        connected_at: ctx.timestamp,
    });

    log::info!("[SESSION] created staff:{} school:{} restricted_grades:{}",
        short(&staff_id), short(&school_id), restricted);
    Ok(())
}

#[reducer(client_disconnected)]
pub fn on_disconnect(ctx: &ReducerContext) {
    if ctx.db.staff_session().connection_id().delete(&ctx.sender) {
        log::debug!("[SESSION] closed on disconnect");
    }
}

/// Replace the pipeline settings (gateway only).
/// Applies to operations issued after this call.
#[reducer]
pub fn update_pipeline_settings(
    ctx: &ReducerContext,
    default_max_per_house_per_grade: u32,
    default_max_total_per_grade: u32,
    max_competitions_per_student: u32,
    placement_scores: Vec<PlacePoints>,
    default_house_points: Vec<PlacePoints>,
) -> Result<(), String> {
    require_gateway(ctx).map_err(|e| reject("SETTINGS", e))?;

    let updated = PipelineSettings {
        id: settings::SETTINGS_ROW_ID,
        default_max_per_house_per_grade,
        default_max_total_per_grade,
        max_competitions_per_student,
        placement_scores,
        default_house_points,
    };
    updated.validate().map_err(|e| reject("SETTINGS", e))?;

    if ctx.db.pipeline_settings().id().find(&settings::SETTINGS_ROW_ID).is_some() {
        ctx.db.pipeline_settings().id().update(updated);
    } else {
        ctx.db.pipeline_settings().insert(updated);
    }

    log::info!("[SETTINGS] updated house_ceiling:{} grade_total:{} per_student:{}",
        default_max_per_house_per_grade, default_max_total_per_grade, max_competitions_per_student);
    Ok(())
}

/// Set the filters the list views apply for this connection
#[reducer]
pub fn set_list_filter(ctx: &ReducerContext, filter: ListFilter) -> Result<(), String> {
    let mut session = staff_session(ctx).map_err(|e| reject("FILTER", e))?;
    session.filter = filter;
    ctx.db.staff_session().connection_id().update(session);
    Ok(())
}

// ==================== HOUSE RULES ====================

/// upsertHouseRule: create or replace the quota override.
/// Omitted fields keep the previous override value (or the default).
#[reducer]
pub fn upsert_house_rule(
    ctx: &ReducerContext,
    competition_id: String,
    year: Option<u32>,
    max_per_house_per_grade: Option<u32>,
    max_total_per_grade: Option<u32>,
    notes: Option<String>,
) -> Result<(), String> {
    do_upsert_house_rule(ctx, competition_id, year, max_per_house_per_grade, max_total_per_grade, notes)
        .map_err(|e| reject("RULE", e))
}

fn do_upsert_house_rule(
    ctx: &ReducerContext,
    competition_id: String,
    year: Option<u32>,
    max_per_house_per_grade: Option<u32>,
    max_total_per_grade: Option<u32>,
    notes: Option<String>,
) -> PipelineResult<()> {
    let staff = staff_session(ctx)?;
    let year = year.unwrap_or_else(|| current_year(ctx));
    find_competition(ctx, &staff.school_id, &competition_id)?;
    let settings = load_settings(ctx);

    let key = rules::rule_key(&staff.school_id, &competition_id, year);
    let existing = ctx.db.house_rule().rule_key().find(&key);
    let merged = rules::merge_override(
        existing.as_ref(),
        max_per_house_per_grade,
        max_total_per_grade,
        notes,
        &settings,
    )?;

    match existing {
        Some(mut rule) => {
            rule.max_per_house_per_grade = merged.max_per_house_per_grade;
            rule.max_total_per_grade = merged.max_total_per_grade;
            rule.notes = merged.notes;
            rule.updated_by = staff.staff_id.clone();
            rule.updated_at = ctx.timestamp;
            ctx.db.house_rule().id().update(rule);
        }
        None => {
            ctx.db.house_rule().insert(HouseRule {
                id: 0, // auto_inc
                rule_key: key,
                school_id: staff.school_id.clone(),
                competition_id: competition_id.clone(),
                year,
                max_per_house_per_grade: merged.max_per_house_per_grade,
                max_total_per_grade: merged.max_total_per_grade,
                notes: merged.notes,
                updated_by: staff.staff_id.clone(),
                updated_at: ctx.timestamp,
            });
        }
    }

    log::info!("[RULE] upserted school:{} competition:{} year:{} house_ceiling:{} grade_total:{}",
        short(&staff.school_id), short(&competition_id), year,
        merged.max_per_house_per_grade, merged.max_total_per_grade);
    Ok(())
}

// ==================== REGISTRATION ====================

/// registerStudent: admission control against the resolved quota.
/// Count and insert share this reducer's transaction, so two concurrent
/// registrations cannot both take the last slot of a bucket.
#[reducer]
pub fn register_student(
    ctx: &ReducerContext,
    competition_id: String,
    student_id: String,
    grade_id: String,
    house_id: Option<String>,
    mode: RegistrationMode,
    year: Option<u32>,
) -> Result<(), String> {
    do_register_student(ctx, competition_id, student_id, grade_id, house_id, mode, year)
        .map_err(|e| reject("REGISTER", e))
}

fn do_register_student(
    ctx: &ReducerContext,
    competition_id: String,
    student_id: String,
    grade_id: String,
    house_id: Option<String>,
    mode: RegistrationMode,
    year: Option<u32>,
) -> PipelineResult<()> {
    let staff = staff_session(ctx)?;
    let year = year.unwrap_or_else(|| current_year(ctx));
    let house_id = admission::validate_mode(mode, house_id)?;

    let competition = find_competition(ctx, &staff.school_id, &competition_id)?;
    let settings = load_settings(ctx);
    let rule_key = rules::rule_key(&staff.school_id, &competition_id, year);
    let rule = rules::resolve(
        ctx.db.house_rule().rule_key().find(&rule_key).as_ref(),
        &competition_id,
        year,
        &settings,
    );
    if rule.is_default {
        log::debug!("[REGISTER] no override for competition:{} year:{}, using defaults",
            short(&competition_id), year);
    }

    let existing: Vec<Registration> = ctx.db.registration()
        .competition_id()
        .filter(&competition_id)
        .filter(|r| r.school_id == staff.school_id && r.year == year)
        .collect();
    let grades: Vec<Grade> = ctx.db.grade()
        .school_id()
        .filter(&staff.school_id)
        .collect();

    let request = admission::AdmissionRequest {
        student_id: &student_id,
        grade_id: &grade_id,
        house_id: house_id.as_deref(),
        mode,
        year,
    };
    let decision = admission::admit(&request, &competition, &rule, &existing, &grades)?;

    let registration_key = admission::registration_key(&staff.school_id, &competition_id, &student_id, year);

    // Unique key is the final backstop against double registration
    ctx.db.registration()
        .try_insert(Registration {
            id: 0, // auto_inc
            registration_key,
            school_id: staff.school_id.clone(),
            competition_id: competition_id.clone(),
            student_id: student_id.clone(),
            grade_id,
            house_id,
            mode,
            year,
            registered_by: staff.staff_id.clone(),
            registered_at: ctx.timestamp,
        })
        .map_err(|_| admission::already_registered(&student_id, &competition.name, year))?;

    log::info!("[REGISTER] school:{} competition:{} student:{} mode:{:?} bucket:{} count:{}/{}",
        short(&staff.school_id), short(&competition_id), short(&student_id), mode,
        decision.bucket.unit_name(), decision.count + 1, decision.ceiling);
    Ok(())
}

/// deleteRegistration: unconditional removal within the caller's school
#[reducer]
pub fn delete_registration(ctx: &ReducerContext, id: u64) -> Result<(), String> {
    let staff = staff_session(ctx).map_err(|e| reject("REGISTER", e))?;
    let registration = ctx.db.registration()
        .id()
        .find(&id)
        .filter(|r| r.school_id == staff.school_id)
        .ok_or_else(|| reject("REGISTER", CompetitionError::not_found(format!("registration {} not found", id))))?;

    ctx.db.registration().id().delete(&id);
    log::info!("[REGISTER] deleted id:{} competition:{} student:{} by:{}",
        id, short(&registration.competition_id), short(&registration.student_id), short(&staff.staff_id));
    Ok(())
}

// ==================== TEAMS ====================

#[reducer]
pub fn create_team(
    ctx: &ReducerContext,
    competition_id: String,
    year: Option<u32>,
    kind: RegistrationMode,
    house_id: Option<String>,
    grade_id: String,
    member_ids: Vec<String>,
) -> Result<(), String> {
    do_create_team(ctx, competition_id, year, kind, house_id, grade_id, member_ids)
        .map_err(|e| reject("TEAM", e))
}

fn do_create_team(
    ctx: &ReducerContext,
    competition_id: String,
    year: Option<u32>,
    kind: RegistrationMode,
    house_id: Option<String>,
    grade_id: String,
    member_ids: Vec<String>,
) -> PipelineResult<()> {
    let staff = staff_session(ctx)?;
    let year = year.unwrap_or_else(|| current_year(ctx));
    let competition = find_competition(ctx, &staff.school_id, &competition_id)?;
    let house_id = teams::validate_team(&competition, kind, house_id, &member_ids)?;

    let size = member_ids.len();
    let team = ctx.db.team().insert(Team {
        id: 0, // auto_inc
        school_id: staff.school_id.clone(),
        competition_id: competition_id.clone(),
        year,
        kind,
        house_id,
        grade_id,
        member_ids,
        created_by: staff.staff_id.clone(),
        created_at: ctx.timestamp,
    });

    log::info!("[TEAM] created id:{} competition:{} year:{} kind:{:?} members:{}",
        team.id, short(&competition_id), year, kind, size);
    Ok(())
}

#[reducer]
pub fn delete_team(ctx: &ReducerContext, id: u64) -> Result<(), String> {
    let staff = staff_session(ctx).map_err(|e| reject("TEAM", e))?;
    if ctx.db.team().id().find(&id).filter(|t| t.school_id == staff.school_id).is_none() {
        return Err(reject("TEAM", CompetitionError::not_found(format!("team {} not found", id))));
    }
    ctx.db.team().id().delete(&id);
    log::info!("[TEAM] deleted id:{} by:{}", id, short(&staff.staff_id));
    Ok(())
}

// ==================== RESULTS ====================

/// recordResults: the whole batch commits or nothing does.
/// A collision with an already recorded place returns Err and rolls back
/// every row inserted earlier in this call.
#[reducer]
pub fn record_results(
    ctx: &ReducerContext,
    competition_id: String,
    year: Option<u32>,
    results: Vec<ResultEntry>,
) -> Result<(), String> {
    do_record_results(ctx, competition_id, year, results)
        .map_err(|e| reject("RESULT", e))
}

fn do_record_results(
    ctx: &ReducerContext,
    competition_id: String,
    year: Option<u32>,
    entries: Vec<ResultEntry>,
) -> PipelineResult<()> {
    let staff = staff_session(ctx)?;
    let year = year.unwrap_or_else(|| current_year(ctx));
    let competition = find_competition(ctx, &staff.school_id, &competition_id)?;

    results::validate_batch(&entries)?;

    let teams: Vec<Team> = ctx.db.team().school_id().filter(&staff.school_id).collect();
    let students: Vec<Student> = ctx.db.student().school_id().filter(&staff.school_id).collect();
    let planned = results::plan_rows(&competition_id, &entries, &teams, &students)?;

    for (i, row) in planned.iter().enumerate() {
        let slot_key = results::insert_key(&staff.school_id, &competition_id, year, row, i);
        let inserted = ctx.db.competition_result()
            .try_insert(CompetitionResult {
                id: 0, // auto_inc
                slot_key,
                school_id: staff.school_id.clone(),
                competition_id: competition_id.clone(),
                year,
                place: row.place,
                student_id: row.student_id.clone(),
                team_id: row.team_id,
                house_id: row.house_id.clone(),
                grade_id: row.grade_id.clone(),
                award_name: row.award_name.clone(),
                recorded_by: staff.staff_id.clone(),
                recorded_at: ctx.timestamp,
            })
            .map_err(|_| results::place_taken(&competition.name, year, row.place))?;

        if row.place == 0 {
            let mut award = inserted;
            award.slot_key = results::award_key(&staff.school_id, &competition_id, year, award.id);
            ctx.db.competition_result().id().update(award);
        }
    }

    let placed = planned.iter().filter(|r| r.place > 0).count();
    log::info!("[RESULT] recorded school:{} competition:{} year:{} placed:{} awards:{}",
        short(&staff.school_id), short(&competition_id), year, placed, planned.len() - placed);
    Ok(())
}

#[reducer]
pub fn remove_result(ctx: &ReducerContext, id: u64) -> Result<(), String> {
    let staff = staff_session(ctx).map_err(|e| reject("RESULT", e))?;
    let result = ctx.db.competition_result()
        .id()
        .find(&id)
        .filter(|r| r.school_id == staff.school_id)
        .ok_or_else(|| reject("RESULT", CompetitionError::not_found(format!("result {} not found", id))))?;

    ctx.db.competition_result().id().delete(&id);
    log::info!("[RESULT] removed id:{} competition:{} place:{} by:{}",
        id, short(&result.competition_id), result.place, short(&staff.staff_id));
    Ok(())
}

// ==================== TEAM SELECTION ====================

/// Insert or wholesale-replace the selection for (level, year).
/// Last writer wins; callers serialize edits per level/year.
fn upsert_selection(
    ctx: &ReducerContext,
    staff: &StaffSession,
    level: SelectionLevel,
    year: u32,
    entries: Vec<SelectionEntry>,
    team_position: Option<u32>,
    settings: &PipelineSettings,
) -> PipelineResult<Selection> {
    let key = team_selection::selection_key(&staff.school_id, level, year);
    let current = ctx.db.selection().selection_key().find(&key);
    let author = team_selection::Author {
        school_id: &staff.school_id,
        staff_id: &staff.staff_id,
        at: ctx.timestamp,
    };
    let next = team_selection::replace_selection(current.as_ref(), &author, level, year, entries, team_position, settings)?;

    let saved = if current.is_some() {
        ctx.db.selection().id().update(next)
    } else {
        ctx.db.selection().insert(next)
    };
    Ok(saved)
}

/// Rebuild the suggestion rows for (level, year).
/// Zonal draws on results (else registrations); higher levels on the
/// previous level's first places.
#[reducer]
pub fn refresh_suggestions(ctx: &ReducerContext, level: SelectionLevel, year: Option<u32>) -> Result<(), String> {
    do_refresh_suggestions(ctx, level, year).map_err(|e| reject("SUGGEST", e))
}

fn do_refresh_suggestions(ctx: &ReducerContext, level: SelectionLevel, year: Option<u32>) -> PipelineResult<()> {
    let staff = staff_session(ctx)?;
    let year = year.unwrap_or_else(|| current_year(ctx));

    let competitions: Vec<Competition> = ctx.db.competition().school_id().filter(&staff.school_id).collect();
    let candidates = match level.previous() {
        None => {
            let results: Vec<CompetitionResult> = ctx.db.competition_result()
                .school_id()
                .filter(&staff.school_id)
                .filter(|r| r.year == year)
                .collect();
            let registrations: Vec<Registration> = ctx.db.registration()
                .school_id()
                .filter(&staff.school_id)
                .filter(|r| r.year == year)
                .collect();
            let from_results = team_selection::zonal_candidates(&results, &competitions, year);
            if from_results.is_empty() {
                log::debug!("[SUGGEST] no results for year:{}, falling back to registrations", year);
                team_selection::registration_candidates(&registrations, &competitions, year)
            } else {
                from_results
            }
        }
        Some(prior) => {
            let key = team_selection::selection_key(&staff.school_id, prior, year);
            match ctx.db.selection().selection_key().find(&key) {
                Some(prior_selection) => team_selection::carried_candidates(&prior_selection.entries),
                None => {
                    log::debug!("[SUGGEST] no {} selection for year:{}", prior.as_str(), year);
                    Vec::new()
                }
            }
        }
    };

    let stale: Vec<u64> = ctx.db.selection_suggestion()
        .school_id()
        .filter(&staff.school_id)
        .filter(|s| s.level == level && s.year == year)
        .map(|s| s.id)
        .collect();
    for id in stale {
        ctx.db.selection_suggestion().id().delete(&id);
    }

    let count = candidates.len();
    for candidate in candidates {
        let competition_name = competitions.iter()
            .find(|c| c.id == candidate.competition_id)
            .map(|c| c.name.clone())
            .unwrap_or_default();
        let student_name = ctx.db.student()
            .id()
            .find(&candidate.student_id)
            .map(|s| s.name)
            .unwrap_or_default();
        ctx.db.selection_suggestion().insert(SelectionSuggestion {
            id: 0, // auto_inc
            school_id: staff.school_id.clone(),
            level,
            year,
            competition_id: candidate.competition_id,
            competition_name,
            student_id: candidate.student_id,
            student_name,
            place: candidate.place,
        });
    }

    log::info!("[SUGGEST] refreshed school:{} level:{} year:{} candidates:{}",
        short(&staff.school_id), level.as_str(), year, count);
    Ok(())
}

/// saveSelection: full-document replacement with recomputed totals
#[reducer]
pub fn save_selection(
    ctx: &ReducerContext,
    level: SelectionLevel,
    year: Option<u32>,
    entries: Vec<SelectionEntry>,
    team_position: Option<u32>,
) -> Result<(), String> {
    do_save_selection(ctx, level, year, entries, team_position)
        .map_err(|e| reject("SELECTION", e))
}

fn do_save_selection(
    ctx: &ReducerContext,
    level: SelectionLevel,
    year: Option<u32>,
    entries: Vec<SelectionEntry>,
    team_position: Option<u32>,
) -> PipelineResult<()> {
    let staff = staff_session(ctx)?;
    let year = year.unwrap_or_else(|| current_year(ctx));
    let settings = load_settings(ctx);

    let saved = upsert_selection(ctx, &staff, level, year, entries, team_position, &settings)?;
    log::info!("[SELECTION] saved school:{} level:{} year:{} entries:{} total_marks:{}",
        short(&staff.school_id), level.as_str(), year, saved.entries.len(), saved.total_marks);
    Ok(())
}

/// recomputeTotals: refresh the cached total from stored entries
#[reducer]
pub fn recompute_totals(ctx: &ReducerContext, level: SelectionLevel, year: Option<u32>) -> Result<(), String> {
    do_recompute_totals(ctx, level, year).map_err(|e| reject("SELECTION", e))
}

fn do_recompute_totals(ctx: &ReducerContext, level: SelectionLevel, year: Option<u32>) -> PipelineResult<()> {
    let staff = staff_session(ctx)?;
    let year = year.unwrap_or_else(|| current_year(ctx));
    let settings = load_settings(ctx);

    let key = team_selection::selection_key(&staff.school_id, level, year);
    let mut existing = ctx.db.selection()
        .selection_key()
        .find(&key)
        .ok_or_else(|| CompetitionError::not_found(format!("no {} selection for {}", level.as_str(), year)))?;

    let previous = existing.total_marks;
    existing.total_marks = settings.total_marks(&existing.entries);
    existing.updated_by = staff.staff_id.clone();
    existing.updated_at = ctx.timestamp;
    let total = existing.total_marks;
    ctx.db.selection().id().update(existing);

    log::info!("[SELECTION] recomputed level:{} year:{} total_marks:{}→{}",
        level.as_str(), year, previous, total);
    Ok(())
}

/// promote: copy the first places of `from_level` into `to_level`, unplaced.
/// Replaces any existing `to_level` selection wholesale.
#[reducer]
pub fn promote_selection(
    ctx: &ReducerContext,
    from_level: SelectionLevel,
    to_level: SelectionLevel,
    year: Option<u32>,
) -> Result<(), String> {
    do_promote_selection(ctx, from_level, to_level, year).map_err(|e| reject("PROMOTE", e))
}

fn do_promote_selection(
    ctx: &ReducerContext,
    from_level: SelectionLevel,
    to_level: SelectionLevel,
    year: Option<u32>,
) -> PipelineResult<()> {
    let staff = staff_session(ctx)?;
    if from_level == to_level {
        return Err(CompetitionError::validation(format!(
            "cannot promote {} into itself", from_level.as_str()
        )));
    }
    let year = year.unwrap_or_else(|| current_year(ctx));
    let settings = load_settings(ctx);

    let source_key = team_selection::selection_key(&staff.school_id, from_level, year);
    let source = ctx.db.selection()
        .selection_key()
        .find(&source_key)
        .ok_or_else(|| CompetitionError::not_found(format!("no {} selection for {}", from_level.as_str(), year)))?;

    let promoted = team_selection::promotable_entries(&source.entries);
    let saved = upsert_selection(ctx, &staff, to_level, year, promoted, None, &settings)?;

    log::info!("[PROMOTE] school:{} {}→{} year:{} promoted:{}/{}",
        short(&staff.school_id), from_level.as_str(), to_level.as_str(), year,
        saved.entries.len(), source.entries.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const YEAR: u32 = 2031;

    fn at(micros: i64) -> Timestamp {
        Timestamp::from_micros_since_unix_epoch(micros)
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short("0123456789abcdef"), "01234567");
        assert_eq!(short("abc"), "abc");
    }

    /// Registration -> results -> zonal suggestions -> save -> promote
    #[test]
    fn test_pipeline_from_registration_to_district() {
        let settings = PipelineSettings::default();
        let chess = Competition {
            id: "chess".to_string(),
            school_id: "school".to_string(),
            name: "Chess".to_string(),
            scope: CompetitionScope::Grade,
            participation: Participation::Individual,
            team_config: None,
            points_config: settings.default_house_points.clone(),
            year: Some(YEAR),
        };
        let rule = rules::resolve(None, "chess", YEAR, &settings);

        let mut registrations: Vec<Registration> = Vec::new();
        for (id, student) in ["a", "b", "c"].iter().enumerate() {
            let request = admission::AdmissionRequest {
                student_id: student,
                grade_id: "g6",
                house_id: Some("red"),
                mode: RegistrationMode::House,
                year: YEAR,
            };
            if admission::admit(&request, &chess, &rule, &registrations, &[]).is_ok() {
                registrations.push(Registration {
                    id: id as u64 + 1,
                    registration_key: admission::registration_key("school", "chess", student, YEAR),
                    school_id: "school".to_string(),
                    competition_id: "chess".to_string(),
                    student_id: student.to_string(),
                    grade_id: "g6".to_string(),
                    house_id: Some("red".to_string()),
                    mode: RegistrationMode::House,
                    year: YEAR,
                    registered_by: "staff".to_string(),
                    registered_at: at(0),
                });
            }
        }
        assert_eq!(registrations.len(), 2);

        // Before any result exists, suggestions come from registrations
        let fallback = team_selection::registration_candidates(&registrations, &[chess.clone()], YEAR);
        assert_eq!(fallback.len(), 1);
        assert_eq!(fallback[0].student_id, "a");

        let batch = vec![
            ResultEntry { place: 1, student_id: Some("b".to_string()), team_id: None, house_id: None, personal_award_winners: Vec::new() },
            ResultEntry { place: 2, student_id: Some("a".to_string()), team_id: None, house_id: None, personal_award_winners: Vec::new() },
        ];
        results::validate_batch(&batch).unwrap();
        let rows: Vec<CompetitionResult> = results::plan_rows("chess", &batch, &[], &[])
            .unwrap()
            .into_iter()
            .enumerate()
            .map(|(i, row)| CompetitionResult {
                id: i as u64 + 1,
                slot_key: results::insert_key("school", "chess", YEAR, &row, i),
                school_id: "school".to_string(),
                competition_id: "chess".to_string(),
                year: YEAR,
                place: row.place,
                student_id: row.student_id,
                team_id: row.team_id,
                house_id: Some("red".to_string()),
                grade_id: row.grade_id,
                award_name: row.award_name,
                recorded_by: "staff".to_string(),
                recorded_at: at(0),
            })
            .collect();

        let zonal: Vec<SelectionEntry> = team_selection::zonal_candidates(&rows, &[chess.clone()], YEAR)
            .into_iter()
            .map(|c| SelectionEntry { competition_id: c.competition_id, student_id: c.student_id, place: c.place })
            .collect();
        team_selection::enforce_max_per_student(&zonal, settings.max_competitions_per_student).unwrap();
        assert_eq!(settings.total_marks(&zonal), 9);

        let district = team_selection::promotable_entries(&zonal);
        assert_eq!(district, vec![SelectionEntry {
            competition_id: "chess".to_string(),
            student_id: "b".to_string(),
            place: None,
        }]);
        assert_eq!(settings.total_marks(&district), 0);

        let standings = standings::house_points(&rows, &[chess]);
        assert_eq!(standings, vec![HousePoints { year: YEAR, house_id: "red".to_string(), points: 25 }]);
    }
}
