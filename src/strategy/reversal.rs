use crate::data::Bar;
use crate::engine::execution::{Order, OrderSide};
use crate::strategy::{Sizing, Strategy, StrategyContext};

//bearish-run reversal strategy, long only
//a run of consecutive bearish candles arms the trigger, the first bullish candle after it
//enters at its close; the position exits once a bar touches the take-profit or stop-loss level
#[derive(Debug, Clone)]
pub struct ReversalStrategy {
    bear_threshold: usize,
    //percent above entry, eg 3.0 for +3%
    take_profit_pct: f64,
    //percent relative to entry, negative, eg -2.0 for -2%
    stop_loss_pct: f64,
    sizing: Sizing,

    //state
    bear_count: usize,
    triggered: bool,
    targets: Option<(f64, f64)>,
}

impl ReversalStrategy {
    pub fn new(bear_threshold: usize, take_profit_pct: f64, stop_loss_pct: f64, sizing: Sizing) -> Self {
        ReversalStrategy {
            bear_threshold,
            take_profit_pct,
            stop_loss_pct,
            sizing,
            bear_count: 0,
            triggered: false,
            targets: None,
        }
    }

    fn reset(&mut self) {
        self.bear_count = 0;
        self.triggered = false;
        self.targets = None;
    }

    //take-profit and stop-loss prices for an entry
    fn targets_for(&self, entry: f64) -> (f64, f64) {
        (
            entry * (1.0 + self.take_profit_pct / 100.0),
            entry * (1.0 + self.stop_loss_pct / 100.0),
        )
    }
}

impl Strategy for ReversalStrategy {
    fn on_start(&mut self) {
        self.reset();
    }

    fn on_bar(&mut self, context: &StrategyContext<'_>, bar: &Bar) -> anyhow::Result<Vec<Order>> {
        let long = context.current_position().map_or(false, |p| p.is_long());

        if let Some((take_profit, stop_loss)) = self.targets {
            //entry still waiting for its fill
            if !long {
                return Ok(Vec::new());
            }
            if bar.high >= take_profit || bar.low <= stop_loss {
                self.reset();
                return Ok(context.close_position().into_iter().collect());
            }
            return Ok(Vec::new());
        }

        if !self.triggered {
            if bar.is_bearish() {
                self.bear_count += 1;
            } else {
                self.bear_count = 0;
            }
            if self.bear_count >= self.bear_threshold {
                self.triggered = true;
            }
            return Ok(Vec::new());
        }

        if !bar.is_bullish() {
            return Ok(Vec::new());
        }

        let needed = self.sizing.notional(context.initial_capital(), bar.close);
        let qty = match self.sizing.quantity(context.initial_capital(), bar.close) {
            Some(qty) if !long && context.cash() >= needed => qty,
            _ => return Ok(Vec::new()),
        };

        self.triggered = false;
        self.bear_count = 0;
        self.targets = Some(self.targets_for(bar.close));
        Ok(vec![context.market_order(OrderSide::Buy, qty)])
    }

    fn name(&self) -> &str {
        "Bearish Reversal"
    }
}
