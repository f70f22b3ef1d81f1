use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::StockCandidate;

/// One (warehouse, quantity) leg of a proposed allocation plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub stock_item_id: Uuid,
    pub warehouse_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Availability {
    pub is_available: bool,
    pub requested_quantity: i32,
    pub total_available: i32,
    pub allocations: Vec<Allocation>,
}

/// Greedy allocation over active stock candidates: the preferred warehouse
/// first if given, then ascending warehouse priority. Pure computation; the
/// plan is only a proposal and mutates nothing.
///
/// `is_available` is true iff the allocations sum to exactly the requested
/// quantity. A partial plan is still returned so callers can report how much
/// stock exists, but it must never be persisted.
pub fn check_availability(
    mut candidates: Vec<StockCandidate>,
    quantity: i32,
    preferred_warehouse_id: Option<Uuid>,
) -> Availability {
    candidates.sort_by_key(|c| {
        let preferred = preferred_warehouse_id == Some(c.item.warehouse_id);
        (!preferred, c.warehouse_priority)
    });

    let total_available: i32 = candidates.iter().map(|c| c.item.available_quantity).sum();

    let mut remaining = quantity;
    let mut allocations = Vec::new();
    for candidate in &candidates {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(candidate.item.available_quantity);
        if take > 0 {
            allocations.push(Allocation {
                stock_item_id: candidate.item.id,
                warehouse_id: candidate.item.warehouse_id,
                quantity: take,
            });
            remaining -= take;
        }
    }

    Availability {
        is_available: remaining == 0,
        requested_quantity: quantity,
        total_available,
        allocations,
    }
}
