use ensemble_core::{EnsembleError, EnsembleResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, error, warn};

/// Tolerance for floating-point cost arithmetic.
const EPSILON: f64 = 1e-9;

/// Point-in-time copy of the ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetLedger {
    /// Configured ceiling.
    pub total: f64,
    /// Outstanding holds by operation id.
    pub reserved: HashMap<String, f64>,
    /// Actual cost of every committed operation.
    pub committed: f64,
}

impl BudgetLedger {
    /// Sum of outstanding reservations.
    pub fn reserved_total(&self) -> f64 {
        self.reserved.values().sum()
    }

    /// `total - committed - Σreserved`; negative only after an overrun.
    pub fn remaining(&self) -> f64 {
        self.total - self.committed - self.reserved_total()
    }

    fn holds(&self) -> bool {
        self.committed + self.reserved_total() <= self.total + EPSILON
    }
}

/// Outcome of committing an operation's actual cost.
#[derive(Debug)]
pub struct CommitOutcome {
    /// Amount that was held for the operation.
    pub reserved: f64,
    /// Cost the worker reported.
    pub actual: f64,
    /// Set when the commit pushed the ledger past its total.
    pub overrun: Option<EnsembleError>,
}

impl CommitOutcome {
    /// Actual minus estimated cost.
    pub fn variance(&self) -> f64 {
        self.actual - self.reserved
    }
}

/// Reserve/commit/release admission control over a shared cost ceiling.
#[derive(Debug)]
pub struct BudgetController {
    ledger: Mutex<BudgetLedger>,
    warning_threshold: f64,
}

impl BudgetController {
    /// A ledger with nothing reserved or committed.
    ///
    /// A non-finite or negative total admits nothing but free work.
    pub fn new(total: f64, warning_threshold: f64) -> Self {
        let total = if total.is_finite() && total >= 0.0 {
            total
        } else {
            warn!(total, "Invalid budget total, admitting only zero-cost work");
            0.0
        };
        Self {
            ledger: Mutex::new(BudgetLedger {
                total,
                ..BudgetLedger::default()
            }),
            warning_threshold,
        }
    }

    /// Hold `estimated_cost` for `operation_id` if it fits under the total.
    ///
    /// Rejection is a deferral: nothing is recorded and the caller may try
    /// again later. Reserving twice under one id replaces the earlier hold.
    pub fn reserve(&self, operation_id: &str, estimated_cost: f64) -> EnsembleResult<()> {
        let estimated_cost = estimated_cost.max(0.0);
        let mut ledger = self.ledger.lock();
        let previous = ledger.reserved.get(operation_id).copied().unwrap_or(0.0);
        let available = ledger.remaining() + previous;

        // Written so a NaN comparison rejects.
        let fits = estimated_cost <= available + EPSILON;
        if !fits {
            debug!(
                operation_id,
                requested = estimated_cost,
                available,
                "Budget reservation rejected"
            );
            return Err(EnsembleError::BudgetExceeded {
                operation_id: operation_id.to_string(),
                requested: estimated_cost,
                available: available.max(0.0),
            });
        }

        ledger
            .reserved
            .insert(operation_id.to_string(), estimated_cost);
        debug!(operation_id, amount = estimated_cost, "Budget reserved");
        Ok(())
    }

    /// Replace the reservation with the actual cost.
    ///
    /// Variance is always absorbed. If the actual cost breaks the ledger
    /// invariant the commit still lands and the returned outcome carries a
    /// [`EnsembleError::BudgetOverrun`] alarm.
    pub fn commit(&self, operation_id: &str, actual_cost: f64) -> CommitOutcome {
        let actual = actual_cost.max(0.0);
        let mut ledger = self.ledger.lock();
        let reserved = ledger.reserved.remove(operation_id).unwrap_or_else(|| {
            warn!(operation_id, "Committing cost for an operation with no reservation");
            0.0
        });
        ledger.committed += actual;

        let overrun = if ledger.holds() {
            None
        } else {
            let alarm = EnsembleError::BudgetOverrun {
                committed: ledger.committed,
                reserved: ledger.reserved_total(),
                total: ledger.total,
            };
            error!(operation_id, %alarm, "Budget ledger invariant violated");
            Some(alarm)
        };

        debug!(
            operation_id,
            reserved,
            actual,
            committed = ledger.committed,
            "Budget committed"
        );
        CommitOutcome {
            reserved,
            actual,
            overrun,
        }
    }

    /// Drop a reservation with no commit. Returns the released amount.
    pub fn release(&self, operation_id: &str) -> Option<f64> {
        let released = self.ledger.lock().reserved.remove(operation_id);
        if let Some(amount) = released {
            debug!(operation_id, amount, "Budget reservation released");
        }
        released
    }

    /// `total - committed - Σreserved`.
    pub fn remaining(&self) -> f64 {
        self.ledger.lock().remaining()
    }

    /// Configured ceiling.
    pub fn total(&self) -> f64 {
        self.ledger.lock().total
    }

    /// Sum of committed actual costs.
    pub fn committed(&self) -> f64 {
        self.ledger.lock().committed
    }

    /// Sum of outstanding reservations.
    pub fn reserved_total(&self) -> f64 {
        self.ledger.lock().reserved_total()
    }

    /// Whether `operation_id` currently holds a reservation.
    pub fn is_reserved(&self, operation_id: &str) -> bool {
        self.ledger.lock().reserved.contains_key(operation_id)
    }

    /// Remaining budget as a fraction of the total (0 when the total is 0).
    pub fn remaining_ratio(&self) -> f64 {
        let ledger = self.ledger.lock();
        if ledger.total <= 0.0 {
            0.0
        } else {
            ledger.remaining() / ledger.total
        }
    }

    /// Fraction of the total below which the budget counts as low.
    pub fn warning_threshold(&self) -> f64 {
        self.warning_threshold
    }

    /// Whether the remaining ratio has dropped under the warning threshold.
    pub fn is_below_warning(&self) -> bool {
        self.remaining_ratio() < self.warning_threshold
    }

    /// `Err(BudgetOverrun)` if `committed + Σreserved > total`.
    pub fn check_invariant(&self) -> EnsembleResult<()> {
        let ledger = self.ledger.lock();
        if ledger.holds() {
            Ok(())
        } else {
            Err(EnsembleError::BudgetOverrun {
                committed: ledger.committed,
                reserved: ledger.reserved_total(),
                total: ledger.total,
            })
        }
    }

    /// Copy of the current ledger.
    pub fn ledger(&self) -> BudgetLedger {
        self.ledger.lock().clone()
    }

    /// Set the committed amount, e.g. when resuming from a snapshot.
    /// Outstanding reservations are dropped.
    pub fn restore_committed(&self, committed: f64) {
        let mut ledger = self.ledger.lock();
        ledger.reserved.clear();
        ledger.committed = committed.max(0.0);
    }
}
