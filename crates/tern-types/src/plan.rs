use serde::{Deserialize, Serialize};

/// A single actionable step inside a plan revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanItem {
    pub index: u32,
    pub plan: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// One full version of a task's plan. Revisions are append-only; earlier
/// revisions are kept as history and never re-activated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanRevision {
    pub revision_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default)]
    pub items: Vec<PlanItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanTask {
    pub task_index: u32,
    pub request: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub active_revision_index: u32,
    #[serde(default)]
    pub revisions: Vec<PlanRevision>,
}

impl PlanTask {
    /// Items of the currently active revision. Superseded revisions are
    /// historical context only.
    pub fn active_items(&self) -> &[PlanItem] {
        self.revisions
            .iter()
            .find(|r| r.revision_index == self.active_revision_index)
            .map(|r| r.items.as_slice())
            .unwrap_or(&[])
    }

    /// Appends a new revision and makes it active.
    pub fn add_revision(&mut self, created_by: Option<String>, items: Vec<PlanItem>) {
        let next = self
            .revisions
            .iter()
            .map(|r| r.revision_index + 1)
            .max()
            .unwrap_or(0);
        self.revisions.push(PlanRevision {
            revision_index: next,
            created_by,
            items,
        });
        self.active_revision_index = next;
    }
}

/// The plan ledger for a run. Completion questions are always answered
/// against the active revision of each task, never against the full history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPlan {
    #[serde(default)]
    pub tasks: Vec<PlanTask>,
}

impl TaskPlan {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// True when every task's ACTIVE revision has all items completed.
    /// Empty plans count as not completed.
    pub fn active_items_completed(&self) -> bool {
        if self.tasks.is_empty() {
            return false;
        }
        self.tasks.iter().all(|t| {
            let items = t.active_items();
            !items.is_empty() && items.iter().all(|i| i.completed)
        })
    }

    pub fn mark_item_completed(
        &mut self,
        task_index: u32,
        item_index: u32,
        summary: Option<String>,
    ) -> bool {
        let Some(task) = self.tasks.iter_mut().find(|t| t.task_index == task_index) else {
            return false;
        };
        let active = task.active_revision_index;
        let Some(revision) = task
            .revisions
            .iter_mut()
            .find(|r| r.revision_index == active)
        else {
            return false;
        };
        match revision.items.iter_mut().find(|i| i.index == item_index) {
            Some(item) => {
                item.completed = true;
                if summary.is_some() {
                    item.summary = summary;
                }
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(index: u32, completed: bool) -> PlanItem {
        PlanItem {
            index,
            plan: format!("step {index}"),
            completed,
            summary: None,
        }
    }

    fn task_with_revisions(revisions: Vec<Vec<PlanItem>>, active: u32) -> PlanTask {
        PlanTask {
            task_index: 0,
            request: "do the thing".into(),
            summary: None,
            active_revision_index: active,
            revisions: revisions
                .into_iter()
                .enumerate()
                .map(|(i, items)| PlanRevision {
                    revision_index: i as u32,
                    created_by: None,
                    items,
                })
                .collect(),
        }
    }

    #[test]
    fn completion_ignores_superseded_revisions() {
        // Revision 0 has an unfinished item, revision 1 is all done.
        let task = task_with_revisions(
            vec![vec![item(0, false)], vec![item(0, true), item(1, true)]],
            1,
        );
        let plan = TaskPlan { tasks: vec![task] };
        assert!(plan.active_items_completed());
    }

    #[test]
    fn empty_plan_is_not_completed() {
        assert!(!TaskPlan::default().active_items_completed());
        let plan = TaskPlan {
            tasks: vec![task_with_revisions(vec![vec![]], 0)],
        };
        assert!(!plan.active_items_completed());
    }

    #[test]
    fn add_revision_activates_it() {
        let mut task = task_with_revisions(vec![vec![item(0, true)]], 0);
        task.add_revision(Some("planner".into()), vec![item(0, false)]);
        assert_eq!(task.active_revision_index, 1);
        assert_eq!(task.active_items().len(), 1);
        assert!(!task.active_items()[0].completed);
    }

    #[test]
    fn mark_item_completed_targets_active_revision() {
        let mut plan = TaskPlan {
            tasks: vec![task_with_revisions(
                vec![vec![item(0, false)], vec![item(0, false)]],
                1,
            )],
        };
        assert!(plan.mark_item_completed(0, 0, Some("done".into())));
        assert!(!plan.tasks[0].revisions[0].items[0].completed);
        assert!(plan.tasks[0].revisions[1].items[0].completed);
        assert!(plan.active_items_completed());
    }
}
