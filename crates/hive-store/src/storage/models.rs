//! Backlog models.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Priority reduction applied to defects at creation so they sort ahead of
/// ordinary work.
pub const DEFECT_PRIORITY_BOOST: i64 = 500;

/// Default priority of a feature row created outside the batch rules.
pub const DEFAULT_PRIORITY: i64 = 999;

const MAX_CATEGORY_LEN: usize = 100;
const MAX_NAME_LEN: usize = 255;

/// Kind of work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    #[default]
    Feature,
    #[serde(alias = "bug")]
    Defect,
}

impl FeatureKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Feature => "feature",
            Self::Defect => "defect",
        }
    }

    /// Priority adjustment applied at creation.
    pub const fn priority_boost(&self) -> i64 {
        match self {
            Self::Feature => 0,
            Self::Defect => DEFECT_PRIORITY_BOOST,
        }
    }
}

impl std::fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for FeatureKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "feature" => Ok(Self::Feature),
            "defect" | "bug" => Ok(Self::Defect),
            other => Err(StoreError::Invalid(format!("unknown feature kind '{other}'"))),
        }
    }
}

/// Raw `features` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct FeatureRow {
    pub id: i64,
    pub priority: i64,
    pub kind: String,
    pub category: String,
    pub name: String,
    pub description: String,
    pub steps: String,
    pub completed: bool,
    pub claimed: bool,
    pub label: Option<String>,
    pub owner: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    pub id: i64,
    pub priority: i64,
    pub kind: FeatureKind,
    pub category: String,
    pub name: String,
    pub description: String,
    pub steps: Vec<String>,
    pub completed: bool,
    pub claimed: bool,
    pub label: Option<String>,
    pub owner: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TryFrom<FeatureRow> for Feature {
    type Error = StoreError;

    fn try_from(row: FeatureRow) -> Result<Self> {
        let steps: Vec<String> = serde_json::from_str(&row.steps).map_err(|e| {
            StoreError::Invalid(format!("feature {} has corrupt steps: {e}", row.id))
        })?;
        Ok(Self {
            id: row.id,
            priority: row.priority,
            kind: row.kind.parse()?,
            category: row.category,
            name: row.name,
            description: row.description,
            steps,
            completed: row.completed,
            claimed: row.claimed,
            label: row.label,
            owner: row.owner,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Input for creating a feature.
///
/// Accepts `type` as an alias of `kind`, and `"bug"` as an alias of `defect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFeature {
    #[serde(default, alias = "type")]
    pub kind: FeatureKind,
    pub category: String,
    pub name: String,
    pub description: String,
    pub steps: Vec<String>,
}

impl NewFeature {
    pub fn validate(&self) -> Result<()> {
        check_len("category", &self.category, MAX_CATEGORY_LEN)?;
        check_len("name", &self.name, MAX_NAME_LEN)?;
        if self.description.is_empty() {
            return Err(StoreError::Invalid("description must not be empty".into()));
        }
        if self.steps.is_empty() {
            return Err(StoreError::Invalid("at least one step is required".into()));
        }
        Ok(())
    }
}

/// Partial update of a feature's editable fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureUpdate {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub steps: Option<Vec<String>>,
}

impl FeatureUpdate {
    pub fn validate(&self) -> Result<()> {
        if let Some(category) = &self.category {
            check_len("category", category, MAX_CATEGORY_LEN)?;
        }
        if let Some(name) = &self.name {
            check_len("name", name, MAX_NAME_LEN)?;
        }
        if self.description.as_deref().is_some_and(str::is_empty) {
            return Err(StoreError::Invalid("description must not be empty".into()));
        }
        if self.steps.as_ref().is_some_and(Vec::is_empty) {
            return Err(StoreError::Invalid("at least one step is required".into()));
        }
        Ok(())
    }

    pub const fn is_empty(&self) -> bool {
        self.category.is_none()
            && self.name.is_none()
            && self.description.is_none()
            && self.steps.is_none()
    }
}

fn check_len(field: &str, value: &str, max: usize) -> Result<()> {
    let len = value.chars().count();
    if len == 0 || len > max {
        return Err(StoreError::Invalid(format!(
            "{field} must be 1-{max} characters, got {len}"
        )));
    }
    Ok(())
}

/// Derived status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    InProgress,
    Done,
}

/// Progress of one step of a feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StepRecord {
    pub feature_id: i64,
    pub step_index: i64,
    pub step_text: String,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub notes: Option<String>,
}

impl StepRecord {
    pub const fn state(&self) -> StepState {
        match (self.started_at, self.completed_at) {
            (_, Some(_)) => StepState::Done,
            (Some(_), None) => StepState::InProgress,
            (None, None) => StepState::Pending,
        }
    }
}

/// Step-by-step progress of a feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureProgress {
    pub feature_id: i64,
    pub feature_name: String,
    pub steps: Vec<StepRecord>,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub in_progress_steps: usize,
    pub pending_steps: usize,
}

impl FeatureProgress {
    pub(crate) fn new(feature_id: i64, feature_name: String, steps: Vec<StepRecord>) -> Self {
        let count = |state| steps.iter().filter(|s| s.state() == state).count();
        Self {
            feature_id,
            feature_name,
            total_steps: steps.len(),
            completed_steps: count(StepState::Done),
            in_progress_steps: count(StepState::InProgress),
            pending_steps: count(StepState::Pending),
            steps,
        }
    }
}

/// Backlog-wide counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub total: i64,
    pub completed: i64,
    pub claimed: i64,
    /// Completed share of the total, rounded to one decimal.
    pub percentage: f64,
}

impl Stats {
    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn new(total: i64, completed: i64, claimed: i64) -> Self {
        let percentage = if total > 0 {
            (completed as f64 / total as f64 * 1000.0).round() / 10.0
        } else {
            0.0
        };
        Self {
            total,
            completed,
            claimed,
            percentage,
        }
    }
}

/// Counters for one label. `label == None` is the unlabelled group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LabelStats {
    pub label: Option<String>,
    pub count: i64,
    pub completed: i64,
    pub claimed: i64,
    pub pending: i64,
}

/// Summary row used to avoid creating duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ExistingFeature {
    pub id: i64,
    pub name: String,
    pub category: String,
    pub label: Option<String>,
    pub completed: bool,
}

/// Result of moving a feature to the tail of the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipOutcome {
    pub id: i64,
    pub name: String,
    pub old_priority: i64,
    pub new_priority: i64,
}

/// Result of deleting a feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOutcome {
    pub name: String,
    pub was_completed: bool,
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn new_feature() -> NewFeature {
        NewFeature {
            kind: FeatureKind::Feature,
            category: "auth".into(),
            name: "Login form".into(),
            description: "Email and password".into(),
            steps: vec!["render form".into()],
        }
    }

    #[test]
    fn bug_is_an_alias_for_defect() {
        let item: NewFeature = serde_json::from_str(
            r#"{"type":"bug","category":"c","name":"n","description":"d","steps":["s"]}"#,
        )
        .unwrap();
        assert_eq!(item.kind, FeatureKind::Defect);
        assert_eq!("bug".parse::<FeatureKind>().unwrap(), FeatureKind::Defect);
        assert!("chore".parse::<FeatureKind>().is_err());
    }

    #[test]
    fn kind_defaults_to_feature() {
        let item: NewFeature = serde_json::from_str(
            r#"{"category":"c","name":"n","description":"d","steps":["s"]}"#,
        )
        .unwrap();
        assert_eq!(item.kind, FeatureKind::Feature);
    }

    #[test]
    fn validation_bounds() {
        assert!(new_feature().validate().is_ok());

        let mut item = new_feature();
        item.category = "x".repeat(101);
        assert!(matches!(item.validate(), Err(StoreError::Invalid(_))));

        let mut item = new_feature();
        item.name = String::new();
        assert!(item.validate().is_err());

        let mut item = new_feature();
        item.steps.clear();
        assert!(item.validate().is_err());

        // Length is counted in characters, not bytes.
        let mut item = new_feature();
        item.name = "é".repeat(255);
        assert!(item.validate().is_ok());
    }

    #[test]
    fn step_state_is_derived_from_timestamps() {
        let mut step = StepRecord {
            feature_id: 1,
            step_index: 0,
            step_text: "s".into(),
            started_at: None,
            completed_at: None,
            notes: None,
        };
        assert_eq!(step.state(), StepState::Pending);
        step.started_at = Some(1);
        assert_eq!(step.state(), StepState::InProgress);
        step.completed_at = Some(2);
        assert_eq!(step.state(), StepState::Done);
    }

    #[test]
    fn stats_percentage_rounds_to_one_decimal() {
        assert!((Stats::new(3, 1, 0).percentage - 33.3).abs() < f64::EPSILON);
        assert!((Stats::new(0, 0, 0).percentage).abs() < f64::EPSILON);
        assert!((Stats::new(2, 2, 0).percentage - 100.0).abs() < f64::EPSILON);
    }
}
