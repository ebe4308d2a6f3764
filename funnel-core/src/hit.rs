use std::borrow::Cow;
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use url::Url;

use crate::definition::Field;

/// Action-type tags of the raw action log. The same `name` column holds a
/// page title, a site-search keyword or an event name depending on its tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionType {
    PageUrl,
    Outlink,
    Download,
    PageTitle,
    SiteSearch,
    EventCategory,
    EventAction,
    EventName,
}

impl ActionType {
    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            1 => Some(ActionType::PageUrl),
            2 => Some(ActionType::Outlink),
            3 => Some(ActionType::Download),
            4 => Some(ActionType::PageTitle),
            8 => Some(ActionType::SiteSearch),
            10 => Some(ActionType::EventCategory),
            11 => Some(ActionType::EventAction),
            12 => Some(ActionType::EventName),
            _ => None,
        }
    }

    pub fn code(self) -> i16 {
        match self {
            ActionType::PageUrl => 1,
            ActionType::Outlink => 2,
            ActionType::Download => 3,
            ActionType::PageTitle => 4,
            ActionType::SiteSearch => 8,
            ActionType::EventCategory => 10,
            ActionType::EventAction => 11,
            ActionType::EventName => 12,
        }
    }

    fn carries_url(self) -> bool {
        matches!(
            self,
            ActionType::PageUrl
                | ActionType::Outlink
                | ActionType::Download
                | ActionType::SiteSearch
        )
    }
}

/// A row of the hit log, as read from storage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HitRow {
    pub visit_id: i64,
    pub timestamp: Option<DateTime<Utc>>,
    pub url: Option<String>,
    pub url_action_type: Option<i16>,
    pub name: Option<String>,
    pub name_action_type: Option<i16>,
    pub event_category: Option<String>,
    pub event_action: Option<String>,
}

/// One tracked interaction within a visit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hit {
    pub timestamp: Option<DateTime<Utc>>,
    pub url: Option<String>,
    pub page_title: Option<String>,
    pub event_category: Option<String>,
    pub event_action: Option<String>,
    pub event_name: Option<String>,
    pub search_query: Option<String>,
}

impl Hit {
    pub fn page_view(url: impl Into<String>) -> Self {
        Hit {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn event(category: impl Into<String>, action: impl Into<String>) -> Self {
        Hit {
            event_category: Some(category.into()),
            event_action: Some(action.into()),
            ..Default::default()
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// The URL of this hit if it has a non-empty one.
    pub fn page_url(&self) -> Option<&str> {
        self.url.as_deref().filter(|url| !url.is_empty())
    }

    /// Value of `field` for matching; absent values read as the empty string.
    pub fn field(&self, field: Field) -> Cow<'_, str> {
        let value = match field {
            Field::Url => self.url.as_deref(),
            Field::Path => return self.url.as_deref().map(url_path).unwrap_or_default(),
            Field::PageTitle => self.page_title.as_deref(),
            Field::EventCategory => self.event_category.as_deref(),
            Field::EventAction => self.event_action.as_deref(),
            Field::EventName => self.event_name.as_deref(),
            Field::SearchQuery => self.search_query.as_deref(),
        };
        Cow::Borrowed(value.unwrap_or_default())
    }
}

/// Path portion of a URL. Values that don't parse as absolute URLs are
/// treated as already relative and cut at the query or fragment.
pub fn url_path(raw: &str) -> Cow<'_, str> {
    match Url::parse(raw) {
        Ok(parsed) if parsed.has_host() => Cow::Owned(parsed.path().to_string()),
        _ => Cow::Borrowed(raw.split(['?', '#']).next().unwrap_or_default()),
    }
}

impl From<HitRow> for Hit {
    fn from(row: HitRow) -> Self {
        let url_type = row.url_action_type.and_then(ActionType::from_code);
        let name_type = row.name_action_type.and_then(ActionType::from_code);

        let url = match url_type {
            Some(action_type) if action_type.carries_url() => row.url,
            _ => None,
        };

        let mut hit = Hit {
            timestamp: row.timestamp,
            url,
            event_category: row.event_category,
            event_action: row.event_action,
            ..Default::default()
        };

        match name_type {
            Some(ActionType::PageTitle) => hit.page_title = row.name,
            Some(ActionType::SiteSearch) => hit.search_query = row.name,
            Some(ActionType::EventName) => hit.event_name = row.name,
            _ => {}
        }

        hit
    }
}

/// A browsing session: its hits in chronological order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Visit {
    pub id: i64,
    pub hits: Vec<Hit>,
    // None when conversions were not fetched for this visit
    pub goals: Option<HashSet<i64>>,
}

impl Visit {
    pub fn new(id: i64, hits: Vec<Hit>) -> Self {
        Self {
            id,
            hits,
            goals: None,
        }
    }

    pub fn with_goals(mut self, goals: impl IntoIterator<Item = i64>) -> Self {
        self.goals = Some(goals.into_iter().collect());
        self
    }

    pub fn converted(&self, goal_id: i64) -> Option<bool> {
        self.goals.as_ref().map(|goals| goals.contains(&goal_id))
    }
}

/// Groups hit rows into visits. Rows must already be in chronological
/// order within each visit; that order is kept, and visits come out in
/// the order their first row was seen.
pub fn group_into_visits(rows: impl IntoIterator<Item = HitRow>) -> Vec<Visit> {
    let mut visits: Vec<Visit> = Vec::new();
    let mut positions: HashMap<i64, usize> = HashMap::new();

    for row in rows {
        let visit_id = row.visit_id;
        let position = *positions.entry(visit_id).or_insert_with(|| {
            visits.push(Visit::new(visit_id, Vec::new()));
            visits.len() - 1
        });
        visits[position].hits.push(Hit::from(row));
    }

    visits
}

/// Attaches fetched conversions to visits. Every visit gets a goal set,
/// empty if it converted nothing.
pub fn attach_conversions(visits: &mut [Visit], conversions: impl IntoIterator<Item = (i64, i64)>) {
    let mut by_visit: HashMap<i64, HashSet<i64>> = HashMap::new();
    for (visit_id, goal_id) in conversions {
        by_visit.entry(visit_id).or_default().insert(goal_id);
    }

    for visit in visits {
        visit.goals = Some(by_visit.remove(&visit.id).unwrap_or_default());
    }
}
