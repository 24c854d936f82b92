// src/connectors/traits.rs
use crate::types::{OrderResponse, Side};
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

#[async_trait]
pub trait ExecutionHandler: Send + Sync {
    /// Places an order and returns the fill. `price` is the reference price
    /// the engine saw when it decided.
    async fn place_order(
        &self,
        symbol: &str,
        side: Side,
        amount: Decimal,
        price: Option<Decimal>,
    ) -> Result<OrderResponse>;

    fn normalize_price(&self, price: Decimal) -> Decimal;
    fn normalize_quantity(&self, quantity: Decimal) -> Decimal;
}
