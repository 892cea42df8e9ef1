use crate::data::Bar;
use crate::engine::execution::{Order, OrderSide};
use crate::strategy::{sma, Sizing, Strategy, StrategyContext};

//sma crossover strategy, long only
//enters when the fast sma moves above the slow sma, exits when it moves below
#[derive(Debug, Clone)]
pub struct SmaCrossoverStrategy {
    fast_window: usize,
    slow_window: usize,
    sizing: Sizing,
    close_at_end: bool,

    //state
    last_signal: Option<OrderSide>,
}

impl SmaCrossoverStrategy {
    pub fn new(fast_window: usize, slow_window: usize, sizing: Sizing) -> Self {
        SmaCrossoverStrategy {
            fast_window,
            slow_window,
            sizing,
            close_at_end: false,
            last_signal: None,
        }
    }

    //flatten any open position after the last bar
    pub fn with_close_at_end(mut self, close_at_end: bool) -> Self {
        self.close_at_end = close_at_end;
        self
    }

    //returns the side the smas currently favour, none when they are equal
    fn regime(fast_sma: f64, slow_sma: f64) -> Option<OrderSide> {
        if fast_sma > slow_sma {
            Some(OrderSide::Buy)
        } else if fast_sma < slow_sma {
            Some(OrderSide::Sell)
        } else {
            None
        }
    }

    //signals only when the regime changes
    fn check_crossover(&mut self, fast_sma: f64, slow_sma: f64) -> Option<OrderSide> {
        let regime = Self::regime(fast_sma, slow_sma);
        if regime == self.last_signal {
            return None;
        }
        self.last_signal = regime;
        regime
    }
}

impl Strategy for SmaCrossoverStrategy {
    fn on_start(&mut self) {
        self.last_signal = None;
    }

    fn on_bar(&mut self, context: &StrategyContext<'_>, bar: &Bar) -> anyhow::Result<Vec<Order>> {
        //need at least slow_window bars to calculate
        if context.bar_count() < self.slow_window {
            return Ok(Vec::new());
        }

        let closes = context.get_close_prices(self.slow_window);
        let fast_prices = &closes[closes.len().saturating_sub(self.fast_window)..];

        let (fast_sma, slow_sma) = match (sma(fast_prices), sma(&closes)) {
            (Some(fast), Some(slow)) => (fast, slow),
            _ => return Ok(Vec::new()),
        };

        let mut orders = Vec::new();
        match self.check_crossover(fast_sma, slow_sma) {
            Some(OrderSide::Buy) => {
                //only from flat, and only with enough cash for the whole entry
                let flat = context.current_position().map_or(true, |p| p.is_flat());
                let needed = self.sizing.notional(context.initial_capital(), bar.close);
                if flat && context.cash() >= needed {
                    if let Some(qty) = self.sizing.quantity(context.initial_capital(), bar.close) {
                        orders.push(context.market_order(OrderSide::Buy, qty));
                    }
                }
            }
            Some(OrderSide::Sell) => {
                if context.current_position().map_or(false, |p| p.is_long()) {
                    orders.extend(context.close_position());
                }
            }
            None => {}
        }

        Ok(orders)
    }

    fn on_end(&mut self, context: &StrategyContext<'_>) -> anyhow::Result<Vec<Order>> {
        if !self.close_at_end {
            return Ok(Vec::new());
        }
        Ok(context.close_position().into_iter().collect())
    }

    fn name(&self) -> &str {
        "SMA Crossover"
    }
}
