use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::entities::batch;
use crate::errors::ServiceError;

/// One step of a depletion plan: take `quantity_to_subtract` from `batch_id`,
/// leaving `resulting_quantity` behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchAllocation {
    pub batch_id: i64,
    pub quantity_to_subtract: i32,
    pub resulting_quantity: i32,
}

/// An all-or-nothing depletion plan. Allocations are listed in depletion
/// order and always sum to `requested`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationPlan {
    pub requested: i32,
    pub allocations: Vec<BatchAllocation>,
}

impl AllocationPlan {
    pub fn total_allocated(&self) -> i32 {
        self.allocations
            .iter()
            .map(|a| a.quantity_to_subtract)
            .sum()
    }
}

/// Canonical depletion order: earliest expiry first, undated batches last,
/// ties broken by received date, then by id.
///
/// This is the single ordering rule for the crate; batch listings sort with
/// it too, so what callers see is what a FIFO sale would consume.
pub fn depletion_order(a: &batch::Model, b: &batch::Model) -> Ordering {
    match (a.expiry_date, b.expiry_date) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.received_date.cmp(&b.received_date))
    .then_with(|| a.id.cmp(&b.id))
}

/// Builds a depletion plan for `requested` units against the given batches.
///
/// Walks the batches in depletion order, taking the minimum of the remaining
/// request and each batch's quantity. Batches holding nothing are skipped and
/// never produce an allocation entry.
///
/// Returns `ValidationError` for a non-positive request and
/// `InsufficientStock` when the batches cannot cover it; a partial plan is
/// never returned. Pure: no I/O, inputs are not mutated.
pub fn plan(batches: &[batch::Model], requested: i32) -> Result<AllocationPlan, ServiceError> {
    if requested <= 0 {
        return Err(ServiceError::ValidationError(
            "requested quantity must be positive".into(),
        ));
    }

    // i64 accumulator so pathological batch sets cannot overflow the check
    let available: i64 = batches.iter().map(|b| i64::from(b.quantity)).sum();
    if available < i64::from(requested) {
        return Err(ServiceError::insufficient_stock(requested, available as i32));
    }

    let mut ordered: Vec<&batch::Model> = batches.iter().collect();
    ordered.sort_by(|a, b| depletion_order(a, b));

    let mut allocations = Vec::new();
    let mut remaining = requested;
    for b in ordered {
        if remaining == 0 {
            break;
        }
        if b.quantity <= 0 {
            continue;
        }
        let take = remaining.min(b.quantity);
        allocations.push(BatchAllocation {
            batch_id: b.id,
            quantity_to_subtract: take,
            resulting_quantity: b.quantity - take,
        });
        remaining -= take;
    }

    debug_assert_eq!(remaining, 0);

    Ok(AllocationPlan {
        requested,
        allocations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::{Days, NaiveDate, Utc};
    use proptest::prelude::*;

    fn day(offset: u64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 1)
            .unwrap()
            .checked_add_days(Days::new(offset))
            .unwrap()
    }

    fn make_batch(
        id: i64,
        quantity: i32,
        expiry: Option<NaiveDate>,
        received: NaiveDate,
    ) -> batch::Model {
        batch::Model {
            id,
            inventory_id: 1,
            batch_number: format!("B-{id}"),
            quantity,
            received_date: received,
            manufacturing_date: None,
            expiry_date: expiry,
            cost_per_unit: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn takes_earliest_expiry_first() {
        let batches = vec![
            make_batch(1, 10, Some(day(30)), day(0)),
            make_batch(2, 10, Some(day(10)), day(0)),
            make_batch(3, 10, Some(day(20)), day(0)),
        ];

        let plan = plan(&batches, 15).unwrap();
        assert_eq!(
            plan.allocations,
            vec![
                BatchAllocation {
                    batch_id: 2,
                    quantity_to_subtract: 10,
                    resulting_quantity: 0
                },
                BatchAllocation {
                    batch_id: 3,
                    quantity_to_subtract: 5,
                    resulting_quantity: 5
                },
            ]
        );
    }

    #[test]
    fn undated_batches_deplete_last() {
        let batches = vec![
            make_batch(1, 5, None, day(0)),
            make_batch(2, 5, Some(day(300)), day(5)),
        ];

        let got = plan(&batches, 7).unwrap();
        assert_eq!(got.allocations[0].batch_id, 2);
        assert_eq!(got.allocations[1].batch_id, 1);
        assert_eq!(got.allocations[1].quantity_to_subtract, 2);
    }

    #[test]
    fn received_date_breaks_expiry_ties() {
        let batches = vec![
            make_batch(1, 5, Some(day(10)), day(3)),
            make_batch(2, 5, Some(day(10)), day(1)),
        ];

        let got = plan(&batches, 6).unwrap();
        assert_eq!(got.allocations[0].batch_id, 2);
        assert_eq!(got.allocations[1].batch_id, 1);
    }

    #[test]
    fn id_breaks_full_ties() {
        let batches = vec![
            make_batch(9, 5, None, day(0)),
            make_batch(3, 5, None, day(0)),
        ];

        let got = plan(&batches, 1).unwrap();
        assert_eq!(got.allocations[0].batch_id, 3);
    }

    #[test]
    fn skips_empty_batches() {
        let batches = vec![
            make_batch(1, 0, Some(day(1)), day(0)),
            make_batch(2, 8, Some(day(2)), day(0)),
        ];

        let got = plan(&batches, 8).unwrap();
        assert_eq!(got.allocations.len(), 1);
        assert_eq!(got.allocations[0].batch_id, 2);
    }

    #[test]
    fn exact_fit_consumes_batch() {
        let batches = vec![make_batch(1, 4, Some(day(1)), day(0))];

        let got = plan(&batches, 4).unwrap();
        assert_eq!(got.allocations[0].resulting_quantity, 0);
        assert_eq!(got.total_allocated(), 4);
    }

    #[test]
    fn insufficient_stock_reports_shortfall() {
        let batches = vec![
            make_batch(1, 3, Some(day(1)), day(0)),
            make_batch(2, 4, None, day(0)),
        ];

        let err = plan(&batches, 12).unwrap_err();
        assert_matches!(
            err,
            ServiceError::InsufficientStock {
                requested: 12,
                available: 7,
                shortfall: 5
            }
        );
    }

    #[test]
    fn rejects_non_positive_request() {
        let batches = vec![make_batch(1, 3, None, day(0))];

        assert_matches!(
            plan(&batches, 0),
            Err(ServiceError::ValidationError(_))
        );
        assert_matches!(
            plan(&batches, -5),
            Err(ServiceError::ValidationError(_))
        );
    }

    #[test]
    fn empty_batch_list_is_insufficient() {
        let err = plan(&[], 1).unwrap_err();
        assert_matches!(
            err,
            ServiceError::InsufficientStock {
                requested: 1,
                available: 0,
                shortfall: 1
            }
        );
    }

    fn arb_batches() -> impl Strategy<Value = Vec<batch::Model>> {
        prop::collection::vec(
            (0i32..=50, prop::option::of(0u64..=90), 0u64..=30),
            0..12,
        )
        .prop_map(|specs| {
            specs
                .into_iter()
                .enumerate()
                .map(|(i, (quantity, expiry, received))| {
                    make_batch(i as i64 + 1, quantity, expiry.map(day), day(received))
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn plan_totals_match_request(batches in arb_batches(), requested in 1i32..=200) {
            let available: i32 = batches.iter().map(|b| b.quantity).sum();
            match plan(&batches, requested) {
                Ok(p) => {
                    prop_assert!(available >= requested);
                    prop_assert_eq!(p.total_allocated(), requested);
                    for a in &p.allocations {
                        prop_assert!(a.quantity_to_subtract > 0);
                        prop_assert!(a.resulting_quantity >= 0);
                    }
                }
                Err(ServiceError::InsufficientStock { requested: r, available: av, shortfall }) => {
                    prop_assert!(available < requested);
                    prop_assert_eq!(r, requested);
                    prop_assert_eq!(av, available);
                    prop_assert_eq!(shortfall, requested - available);
                }
                Err(other) => prop_assert!(false, "unexpected error: {other:?}"),
            }
        }

        #[test]
        fn plan_never_overdraws_a_batch(batches in arb_batches(), requested in 1i32..=200) {
            if let Ok(p) = plan(&batches, requested) {
                for a in &p.allocations {
                    let source = batches.iter().find(|b| b.id == a.batch_id).unwrap();
                    prop_assert!(a.quantity_to_subtract <= source.quantity);
                    prop_assert_eq!(a.resulting_quantity, source.quantity - a.quantity_to_subtract);
                }
            }
        }

        #[test]
        fn plan_follows_depletion_order(batches in arb_batches(), requested in 1i32..=200) {
            if let Ok(p) = plan(&batches, requested) {
                // Every allocation except the last drains its batch completely,
                // and consecutive allocations are ordered by the comparator.
                for pair in p.allocations.windows(2) {
                    prop_assert_eq!(pair[0].resulting_quantity, 0);
                    let a = batches.iter().find(|b| b.id == pair[0].batch_id).unwrap();
                    let b = batches.iter().find(|b| b.id == pair[1].batch_id).unwrap();
                    prop_assert_eq!(depletion_order(a, b), Ordering::Less);
                }
            }
        }
    }
}
