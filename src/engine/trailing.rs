use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Exit thresholds derived from a position's high-water mark.
///
/// For any `stop_percent` in (0, 100) and ratio in (0, 1):
/// `emergency <= stop_price <= pre_limit <= highest_price`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Triggers {
    /// Hard trailing stop; the protective limit sell is priced here.
    pub stop_price: Decimal,
    /// Placing threshold for the limit sell, ahead of the hard stop.
    pub pre_limit: Decimal,
    /// Below this the unfilled limit order is abandoned for a market sell.
    pub emergency: Decimal,
}

/// Ratcheted high-water mark: raised to the current price, never lowered.
pub fn ratchet(highest_price: Decimal, price: Decimal) -> Decimal {
    highest_price.max(price)
}

pub fn compute(highest_price: Decimal, stop_percent: Decimal, emergency_ratio: Decimal) -> Triggers {
    let stop_fraction = stop_percent / dec!(100);
    let stop_price = highest_price * (Decimal::ONE - stop_fraction);
    let pre_limit = highest_price * (Decimal::ONE - dec!(0.75) * stop_fraction);
    let emergency = stop_price * emergency_ratio;

    Triggers {
        stop_price,
        pre_limit,
        emergency,
    }
}
