use serde::{Deserialize, Serialize};

use crate::error::DefinitionError;

/// The hit attribute a condition is tested against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Url,
    Path,
    PageTitle,
    EventCategory,
    EventAction,
    EventName,
    SearchQuery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    NotStartsWith,
    EndsWith,
    NotEndsWith,
    Regex,
}

impl Operator {
    pub fn is_negated(self) -> bool {
        matches!(
            self,
            Operator::NotEquals
                | Operator::NotContains
                | Operator::NotStartsWith
                | Operator::NotEndsWith
        )
    }

    /// Applies a literal operator to already normalised inputs.
    /// `Regex` never matches here, regexes are evaluated by the matcher.
    pub fn test_literal(self, value: &str, pattern: &str) -> bool {
        let found = match self {
            Operator::Equals | Operator::NotEquals => value == pattern,
            Operator::Contains | Operator::NotContains => value.contains(pattern),
            Operator::StartsWith | Operator::NotStartsWith => value.starts_with(pattern),
            Operator::EndsWith | Operator::NotEndsWith => value.ends_with(pattern),
            Operator::Regex => return false,
        };

        found != self.is_negated()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Condition {
    pub field: Field,
    pub operator: Operator,
    pub pattern: String,
    #[serde(default)]
    pub case_sensitive: bool,
    // Only honoured for `Field::Url`
    #[serde(default)]
    pub ignore_query_params: bool,
}

impl Condition {
    pub fn new(field: Field, operator: Operator, pattern: impl Into<String>) -> Self {
        Self {
            field,
            operator,
            pattern: pattern.into(),
            case_sensitive: false,
            ignore_query_params: false,
        }
    }

    pub fn case_sensitive(mut self) -> Self {
        self.case_sensitive = true;
        self
    }

    pub fn ignoring_query_params(mut self) -> Self {
        self.ignore_query_params = true;
        self
    }
}

/// One stage of a funnel. Conditions are OR-combined.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StepDefinition {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, conditions: Vec<Condition>) -> Self {
        Self {
            name: name.into(),
            required: false,
            conditions,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FunnelDefinition {
    pub id: i64,
    pub site_id: i64,
    #[serde(default)]
    pub name: String,
    pub steps: Vec<StepDefinition>,
    pub goal_id: Option<i64>,
    #[serde(default)]
    pub strict_mode: bool,
    // 0 means unlimited
    #[serde(default)]
    pub step_time_limit_seconds: u64,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl FunnelDefinition {
    pub fn new(id: i64, site_id: i64, steps: Vec<StepDefinition>) -> Self {
        Self {
            id,
            site_id,
            name: String::new(),
            steps,
            goal_id: None,
            strict_mode: false,
            step_time_limit_seconds: 0,
            active: true,
        }
    }

    pub fn step_time_limit(&self) -> Option<u64> {
        (self.step_time_limit_seconds > 0).then_some(self.step_time_limit_seconds)
    }

    pub fn is_goal_linked(&self) -> bool {
        self.goal_id.is_some()
    }
}

/// A funnel as it is stored: the step list is still an untyped JSON document.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FunnelRecord {
    pub id: i64,
    pub site_id: i64,
    pub name: String,
    pub steps: serde_json::Value,
    pub goal_id: Option<i64>,
    pub active: bool,
    pub strict_mode: bool,
    pub step_time_limit_seconds: i64,
}

impl TryFrom<FunnelRecord> for FunnelDefinition {
    type Error = DefinitionError;

    fn try_from(record: FunnelRecord) -> Result<Self, Self::Error> {
        // A null step list is an empty funnel, not a broken one
        let steps = if record.steps.is_null() {
            Vec::new()
        } else {
            serde_json::from_value(record.steps).map_err(|error| {
                DefinitionError::InvalidSteps {
                    funnel_id: record.id,
                    error,
                }
            })?
        };

        let step_time_limit_seconds = u64::try_from(record.step_time_limit_seconds).map_err(
            |_| DefinitionError::InvalidTimeLimit {
                funnel_id: record.id,
                limit: record.step_time_limit_seconds,
            },
        )?;

        Ok(FunnelDefinition {
            id: record.id,
            site_id: record.site_id,
            name: record.name,
            steps,
            goal_id: record.goal_id,
            strict_mode: record.strict_mode,
            step_time_limit_seconds,
            active: record.active,
        })
    }
}
