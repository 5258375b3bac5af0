pub mod logging;

use rust_decimal::Decimal;

use crate::models::Order;

/// Formats a decimal for display with a fixed number of decimal places
pub fn format_decimal(value: Decimal, decimals: u32) -> String {
    format!("{:.*}", decimals as usize, value.round_dp(decimals))
}

/// One-line description of an order for logs
pub fn describe_order(order: &Order) -> String {
    match order.price {
        Some(price) => format!(
            "{} {} {} {} @ {} {}",
            order.id, order.symbol, order.side, order.quantity, price, order.time_in_force
        ),
        None => format!(
            "{} {} {} {} {}",
            order.id, order.symbol, order.side, order.quantity, order.order_type
        ),
    }
}
