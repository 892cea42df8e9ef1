use crate::engine::execution::Fill;
use crate::portfolio::position::Position;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

//one mark-to-market valuation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquitySample {
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
    pub cash: f64,
}

//outcome of applying a fill
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FillEffect {
    //realized pnl net of this fill's commission, when the fill reduced a position
    pub realized_pnl: Option<f64>,
}

//cash, positions and equity history for one run
//owned by the engine; strategies only ever see a shared reference
#[derive(Debug, Clone, Serialize)]
pub struct Portfolio {
    initial_capital: f64,
    cash: f64,
    equity: f64,
    //insertion-ordered so valuation order never varies between runs
    positions: IndexMap<String, Position>,
    last_prices: IndexMap<String, f64>,
    equity_curve: Vec<EquitySample>,
    total_commission: f64,
}

impl Portfolio {
    pub fn new(initial_capital: f64) -> Self {
        Portfolio {
            initial_capital,
            cash: initial_capital,
            equity: initial_capital,
            positions: IndexMap::new(),
            last_prices: IndexMap::new(),
            equity_curve: Vec::new(),
            total_commission: 0.0,
        }
    }

    //applies a fill: cash moves by notional and commission, position by signed quantity
    pub fn apply_fill(&mut self, fill: &Fill) -> FillEffect {
        self.cash -= fill.signed_quantity() * fill.price + fill.commission;
        self.total_commission += fill.commission;

        let position = self
            .positions
            .entry(fill.instrument.clone())
            .or_insert_with(|| Position::new(fill.instrument.clone()));

        let (realized, closed_qty) = position.update_with_fill(fill.signed_quantity(), fill.price);
        self.equity = self.valuation();

        FillEffect {
            realized_pnl: (closed_qty > 0.0).then(|| realized - fill.commission),
        }
    }

    //values holdings at the new price and appends an equity sample
    pub fn mark_to_market(&mut self, instrument: &str, price: f64, timestamp: DateTime<Utc>) {
        self.last_prices.insert(instrument.to_string(), price);
        self.equity = self.valuation();
        self.equity_curve.push(EquitySample {
            timestamp,
            equity: self.equity,
            cash: self.cash,
        });
    }

    //rewrites the newest sample after fills that landed after it was taken
    pub fn revalue_last_sample(&mut self) {
        let equity = self.valuation();
        let cash = self.cash;
        self.equity = equity;
        if let Some(last) = self.equity_curve.last_mut() {
            last.equity = equity;
            last.cash = cash;
        }
    }

    fn valuation(&self) -> f64 {
        let holdings: f64 = self
            .positions
            .values()
            .filter(|p| !p.is_flat())
            .map(|p| {
                let price = self
                    .last_prices
                    .get(&p.instrument)
                    .copied()
                    .unwrap_or(p.avg_entry_price);
                p.market_value(price)
            })
            .sum();
        self.cash + holdings
    }

    pub fn initial_capital(&self) -> f64 {
        self.initial_capital
    }

    pub fn cash(&self) -> f64 {
        self.cash
    }

    pub fn equity(&self) -> f64 {
        self.equity
    }

    pub fn total_commission(&self) -> f64 {
        self.total_commission
    }

    //returns the position for an instrument, or none if never traded
    pub fn position(&self, instrument: &str) -> Option<&Position> {
        self.positions.get(instrument)
    }

    //signed quantity held, zero when flat or never traded
    pub fn quantity(&self, instrument: &str) -> f64 {
        self.positions.get(instrument).map_or(0.0, |p| p.quantity)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn last_price(&self, instrument: &str) -> Option<f64> {
        self.last_prices.get(instrument).copied()
    }

    pub fn equity_curve(&self) -> &[EquitySample] {
        &self.equity_curve
    }

    pub fn into_equity_curve(self) -> Vec<EquitySample> {
        self.equity_curve
    }

    //returns total realized pnl across all positions
    pub fn total_realized_pnl(&self) -> f64 {
        self.positions.values().map(|p| p.realized_pnl).sum()
    }

    pub fn total_unrealized_pnl(&self) -> f64 {
        self.positions
            .values()
            .map(|p| {
                self.last_prices
                    .get(&p.instrument)
                    .map_or(0.0, |&price| p.unrealized_pnl(price))
            })
            .sum()
    }

    //returns the total return as a fraction of initial capital
    pub fn total_return(&self) -> f64 {
        (self.equity - self.initial_capital) / self.initial_capital
    }
}
