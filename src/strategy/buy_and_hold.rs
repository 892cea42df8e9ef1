use crate::data::Bar;
use crate::engine::execution::{Order, OrderSide};
use crate::strategy::{Sizing, Strategy, StrategyContext};

//buys on the first bar and holds to the end; the benchmark for the other strategies
#[derive(Debug, Clone)]
pub struct BuyAndHoldStrategy {
    sizing: Sizing,
    entered: bool,
}

impl BuyAndHoldStrategy {
    pub fn new(sizing: Sizing) -> Self {
        BuyAndHoldStrategy {
            sizing,
            entered: false,
        }
    }
}

impl Strategy for BuyAndHoldStrategy {
    fn on_start(&mut self) {
        self.entered = false;
    }

    fn on_bar(&mut self, context: &StrategyContext<'_>, bar: &Bar) -> anyhow::Result<Vec<Order>> {
        if self.entered {
            return Ok(Vec::new());
        }
        self.entered = true;

        Ok(self
            .sizing
            .quantity(context.initial_capital(), bar.close)
            .map(|qty| context.market_order(OrderSide::Buy, qty))
            .into_iter()
            .collect())
    }

    fn name(&self) -> &str {
        "Buy And Hold"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portfolio::Portfolio;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_single_entry() {
        let bars: Vec<Bar> = (1..=3)
            .map(|i| Bar::new_unchecked(Utc.timestamp_opt(i * 60, 0).unwrap(), 50.0, 50.0, 50.0, 50.0, 1.0))
            .collect();
        let portfolio = Portfolio::new(1000.0);
        let mut strategy = BuyAndHoldStrategy::new(Sizing::CapitalFraction(1.0));

        let first = strategy
            .on_bar(&StrategyContext::new("ETH/USDT", &bars[..1], &portfolio), &bars[0])
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].quantity, 20.0);
        assert_eq!(first[0].instrument, "ETH/USDT");

        let second = strategy
            .on_bar(&StrategyContext::new("ETH/USDT", &bars[..2], &portfolio), &bars[1])
            .unwrap();
        assert!(second.is_empty());
    }
}
