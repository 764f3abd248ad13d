// src/utils/precision.rs
use rust_decimal::Decimal;

/// Rounds `price` to the nearest multiple of the instrument's price increment.
/// Example: price=100.16, increment=0.1 -> 100.2
pub fn round_to_increment(price: Decimal, increment: Decimal) -> Decimal {
    if increment.is_zero() {
        return price;
    }
    ((price / increment).round() * increment).normalize()
}
