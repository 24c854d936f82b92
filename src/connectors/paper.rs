// src/connectors/paper.rs
use std::sync::{Mutex, PoisonError};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

use crate::connectors::traits::ExecutionHandler;
use crate::types::{OrderResponse, Side};
use crate::utils::precision::{normalize_price, normalize_quantity};

/// Fills every order in-process at the reference price, shifted by a fixed slippage.
pub struct PaperExecutor {
    step_size: Decimal,
    tick_size: Decimal,
    slippage: Decimal,
    fills: Mutex<Vec<OrderResponse>>,
}

impl PaperExecutor {
    pub fn new(step_size: Decimal, tick_size: Decimal) -> Self {
        Self {
            step_size,
            tick_size,
            slippage: Decimal::ZERO,
            fills: Mutex::new(Vec::new()),
        }
    }

    /// Fraction of price paid on each fill (0.001 == 0.1%).
    pub fn with_slippage(mut self, slippage: Decimal) -> Self {
        self.slippage = slippage;
        self
    }

    pub fn fills(&self) -> Vec<OrderResponse> {
        self.fills
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ExecutionHandler for PaperExecutor {
    async fn place_order(
        &self,
        symbol: &str,
        side: Side,
        amount: Decimal,
        price: Option<Decimal>,
    ) -> Result<OrderResponse> {
        let price = price.ok_or_else(|| anyhow!("paper orders need a reference price"))?;
        let quantity = self.normalize_quantity(amount);
        if quantity.is_zero() {
            return Err(anyhow!(
                "quantity {} is below the step size {}",
                amount,
                self.step_size
            ));
        }

        let fill_price = match side {
            Side::Buy => price * (Decimal::ONE + self.slippage),
            Side::Sell => price * (Decimal::ONE - self.slippage),
        };
        let order = OrderResponse {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side,
            quantity,
            price: self.normalize_price(fill_price),
            status: "FILLED".to_string(),
        };

        info!(
            "📝 Paper {:?}: {} {} @ {}",
            order.side, order.quantity, order.symbol, order.price
        );
        self.fills
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(order.clone());
        Ok(order)
    }

    fn normalize_price(&self, price: Decimal) -> Decimal {
        normalize_price(price, self.tick_size)
    }

    fn normalize_quantity(&self, quantity: Decimal) -> Decimal {
        normalize_quantity(quantity, self.step_size)
    }
}
