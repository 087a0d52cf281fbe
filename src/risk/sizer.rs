// =============================================================================
// Position sizer — slot allocation capped by fixed-risk quantity
// =============================================================================
//
// Capital is divided into `max_slots` equal slots (one per concurrent
// trade). A signal's confidence scales its slot, but when only one slot
// remains the trade never borrows beyond its fair share. The final
// quantity is the lower of the capital-derived and risk-derived numbers,
// rounded down to a whole lot.
// =============================================================================

use tracing::debug;

use crate::config::SizingMethod;

/// Stops tighter than this are treated as spurious and replaced by a
/// 0.5 % synthetic risk distance.
const MIN_RISK_PER_SHARE: f64 = 0.05;
const FALLBACK_RISK_FRACTION: f64 = 0.005;

/// Everything the sizing decision depends on.
#[derive(Debug, Clone)]
pub struct SizingInputs {
    pub total_capital: f64,
    pub available_capital: f64,
    pub max_slots: u32,
    /// Slots currently unoccupied (including the one this trade would take).
    pub open_slots: u32,
    pub entry: f64,
    pub stop_loss: f64,
    pub lot_size: u64,
    /// Signal conviction, clamped to [0.5, 2.0].
    pub confidence: f64,
    pub risk_per_trade_fraction: f64,
    pub leverage: f64,
}

/// Quantity to trade, in whole lots. Zero means "do not trade".
pub fn position_size(method: SizingMethod, inputs: &SizingInputs) -> u64 {
    if inputs.entry <= 0.0 || inputs.total_capital <= 0.0 || inputs.max_slots == 0 {
        return 0;
    }

    let confidence = inputs.confidence.clamp(0.5, 2.0);
    let lot = inputs.lot_size.max(1);

    // Risk-derived quantity.
    let risk_amount = inputs.total_capital * inputs.risk_per_trade_fraction;
    let mut risk_per_share = (inputs.entry - inputs.stop_loss).abs();
    if inputs.stop_loss <= 0.0 || risk_per_share < MIN_RISK_PER_SHARE {
        risk_per_share = inputs.entry * FALLBACK_RISK_FRACTION;
    }
    let qty_by_risk = risk_amount / risk_per_share;

    let raw_qty = match method {
        SizingMethod::SlotRisk => {
            // Capital-derived quantity.
            let slot_allocation = inputs.total_capital / inputs.max_slots as f64;
            let adjusted = slot_allocation * confidence;
            let cap_allowed = if inputs.open_slots > 1 {
                adjusted.min(inputs.available_capital)
            } else {
                // Last slot: fair share only, confidence cannot inflate it.
                slot_allocation.min(inputs.available_capital)
            };
            let qty_by_cap = cap_allowed * inputs.leverage / inputs.entry;
            qty_by_cap.min(qty_by_risk)
        }
        SizingMethod::FixedRisk => {
            let buying_power = inputs.available_capital * inputs.leverage;
            qty_by_risk.min(buying_power / inputs.entry)
        }
    };

    let qty = ((raw_qty / lot as f64).floor() as i64).max(0) as u64 * lot;
    debug!(
        entry = inputs.entry,
        stop_loss = inputs.stop_loss,
        confidence,
        qty,
        "position sized"
    );
    qty
}
