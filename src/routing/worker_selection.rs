//! Worker selection — scores eligible workers in a department and
//! returns the lowest-scoring (best) one. Grounded in
//! `services/routing_engine.py`'s `_find_best_worker` / `_score_worker`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub department_id: Option<Uuid>,
    pub trade_categories: Vec<String>,
    pub active: bool,
    pub available: bool,
    pub current_task_count: u32,
    pub max_tasks_per_day: u32,
}

impl Worker {
    fn eligible(&self, department_id: Uuid, trade_category: Option<&str>) -> bool {
        if !self.active || !self.available {
            return false;
        }
        if self.department_id != Some(department_id) {
            return false;
        }
        if self.current_task_count >= self.max_tasks_per_day {
            return false;
        }
        match trade_category {
            Some(tc) => self.trade_categories.iter().any(|t| t == tc),
            None => true,
        }
    }

    /// Lower is better. `100 * current / max - 20 if trade matches`. The
    /// The proximity term is omitted here (no geo collaborator is
    /// wired into the core; it is purely additive and a zero contribution
    /// never changes the ranking among candidates that lack it).
    fn score(&self, trade_category: Option<&str>) -> f64 {
        let load = 100.0 * self.current_task_count as f64 / self.max_tasks_per_day.max(1) as f64;
        let trade_bonus = match trade_category {
            Some(tc) if self.trade_categories.iter().any(|t| t == tc) => -20.0,
            _ => 0.0,
        };
        load + trade_bonus
    }
}

/// Returns the argmin-scoring eligible worker in `department_id`, restricted
/// to workers whose `trade_categories` contain `trade_category` when it is
/// given. Ties break by lowest `current_task_count`, then by worker id,
/// matching the routing engine's tie-break rule exactly.
pub fn select_worker(
    department_id: Uuid,
    trade_category: Option<&str>,
    workers: &[Worker],
) -> Option<Uuid> {
    workers
        .iter()
        .filter(|w| w.eligible(department_id, trade_category))
        .min_by(|a, b| {
            a.score(trade_category)
                .partial_cmp(&b.score(trade_category))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.current_task_count.cmp(&b.current_task_count))
                .then_with(|| a.id.cmp(&b.id))
        })
        .map(|w| w.id)
}
