//! Research plans and their work items

use serde::{Deserialize, Serialize};

/// Status of a single plan item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanItemStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl PlanItemStatus {
    /// Whether the item needs no further work in the current run
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for PlanItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanItemStatus::Pending => write!(f, "pending"),
            PlanItemStatus::InProgress => write!(f, "in_progress"),
            PlanItemStatus::Completed => write!(f, "completed"),
            PlanItemStatus::Failed => write!(f, "failed"),
            PlanItemStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// One independently executable piece of research
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanItem {
    /// Identifier, unique within its plan
    pub id: String,
    pub topic: String,
    #[serde(default)]
    pub description: String,
    /// Boundaries for this item
    #[serde(default)]
    pub scope: String,
    /// 1 is the highest priority
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub key_questions: Vec<String>,
    #[serde(default)]
    pub suggested_sources: Vec<String>,
    #[serde(default)]
    pub status: PlanItemStatus,
}

fn default_priority() -> i32 {
    1
}

/// Force a priority into the 1 (highest) to 5 (lowest) range
pub(crate) fn clamp_priority(priority: i32) -> i32 {
    priority.clamp(1, 5)
}

/// `proposed` trimmed when it is non-blank and free, otherwise the first
/// free `item-N` counting up from `index + 1`
pub(crate) fn unique_item_id(proposed: Option<&str>, index: usize, taken: impl Fn(&str) -> bool) -> String {
    if let Some(id) = proposed.map(str::trim) {
        if !id.is_empty() && !taken(id) {
            return id.to_string();
        }
    }

    let mut n = index + 1;
    loop {
        let candidate = format!("item-{}", n);
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

impl PlanItem {
    /// Create a pending item with default priority
    pub fn new(id: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            topic: topic.into(),
            description: String::new(),
            scope: String::new(),
            priority: default_priority(),
            key_questions: Vec::new(),
            suggested_sources: Vec::new(),
            status: PlanItemStatus::Pending,
        }
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// The planner's output: what to research and how
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Summary of how the query was understood
    pub understanding: String,
    /// Outstanding questions for the requester
    #[serde(default)]
    pub clarifications: Vec<String>,
    pub items: Vec<PlanItem>,
    #[serde(default = "default_estimated_minutes")]
    pub estimated_minutes: u32,
}

fn default_estimated_minutes() -> u32 {
    30
}

impl Plan {
    pub fn new(understanding: impl Into<String>, items: Vec<PlanItem>) -> Self {
        Self {
            understanding: understanding.into(),
            clarifications: Vec::new(),
            items,
            estimated_minutes: default_estimated_minutes(),
        }
    }

    pub fn item(&self, id: &str) -> Option<&PlanItem> {
        self.items.iter().find(|item| item.id == id)
    }

    /// Set an item's status; returns false when no item has that id
    pub fn set_status(&mut self, id: &str, status: PlanItemStatus) -> bool {
        match self.items.iter_mut().find(|item| item.id == id) {
            Some(item) => {
                item.status = status;
                true
            }
            None => false,
        }
    }

    /// Items that still need a unit of work, in admission order.
    ///
    /// Priority ascending; ties keep plan order.
    pub fn schedulable_items(&self) -> Vec<PlanItem> {
        let mut items: Vec<PlanItem> = self
            .items
            .iter()
            .filter(|item| {
                !matches!(
                    item.status,
                    PlanItemStatus::Completed | PlanItemStatus::Skipped
                )
            })
            .cloned()
            .collect();
        items.sort_by_key(|item| item.priority);
        items
    }

    /// Ids of completed items, in plan order
    pub fn completed_ids(&self) -> Vec<String> {
        self.ids_where(|status| status == PlanItemStatus::Completed)
    }

    /// Ids of items that are neither completed nor skipped, in plan order
    pub fn pending_ids(&self) -> Vec<String> {
        self.ids_where(|status| {
            !matches!(status, PlanItemStatus::Completed | PlanItemStatus::Skipped)
        })
    }

    fn ids_where(&self, keep: impl Fn(PlanItemStatus) -> bool) -> Vec<String> {
        self.items
            .iter()
            .filter(|item| keep(item.status))
            .map(|item| item.id.clone())
            .collect()
    }

    /// Whether every item has reached a terminal status
    pub fn all_terminal(&self) -> bool {
        self.items.iter().all(|item| item.status.is_terminal())
    }

    /// Apply a confirm/modify request.
    ///
    /// Modified items replace the item with the same id (keeping its status)
    /// or are appended when the id is new; a blank id gets a fresh `item-N`.
    /// Priorities are clamped like planner output. Skips are applied
    /// afterwards. Returns the skip ids that matched no item.
    pub fn apply_review(&mut self, modifications: &[PlanItem], skip_ids: &[String]) -> Vec<String> {
        for modified in modifications {
            let mut item = modified.clone();
            item.id = item.id.trim().to_string();
            item.priority = clamp_priority(item.priority);

            match self.items.iter().position(|existing| !item.id.is_empty() && existing.id == item.id) {
                Some(index) => {
                    item.status = self.items[index].status;
                    self.items[index] = item;
                }
                None => {
                    item.id = unique_item_id(Some(&item.id), self.items.len(), |id| {
                        self.items.iter().any(|existing| existing.id == id)
                    });
                    item.status = PlanItemStatus::Pending;
                    self.items.push(item);
                }
            }
        }

        skip_ids
            .iter()
            .filter(|id| !self.set_status(id, PlanItemStatus::Skipped))
            .cloned()
            .collect()
    }
}
