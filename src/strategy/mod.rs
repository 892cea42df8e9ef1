pub mod buy_and_hold;
pub mod reversal;
pub mod sma_crossover;

use crate::data::Bar;
use crate::engine::execution::{Order, OrderSide};
use crate::portfolio::{Portfolio, Position};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

//strategy interface that all strategies must implement
//a strategy only decides; it never touches the portfolio or fills orders itself
pub trait Strategy: Send {
    //called once before the first bar
    fn on_start(&mut self) {}

    //called on each bar after mark-to-market; returned orders are stamped and executed by the engine
    fn on_bar(&mut self, context: &StrategyContext<'_>, bar: &Bar) -> anyhow::Result<Vec<Order>>;

    //called once after the last bar of a completed run
    //orders fill at the final close under same-close and expire under next-open
    fn on_end(&mut self, _context: &StrategyContext<'_>) -> anyhow::Result<Vec<Order>> {
        Ok(Vec::new())
    }

    //returns the strategy name
    fn name(&self) -> &str;
}

//read-only view handed to a strategy for one bar
//history ends at the current bar, so later bars are unreachable
pub struct StrategyContext<'a> {
    instrument: &'a str,
    history: &'a [Bar],
    portfolio: &'a Portfolio,
}

impl<'a> StrategyContext<'a> {
    //history must be non-empty and end at the bar being processed
    pub fn new(instrument: &'a str, history: &'a [Bar], portfolio: &'a Portfolio) -> Self {
        StrategyContext {
            instrument,
            history,
            portfolio,
        }
    }

    pub fn instrument(&self) -> &str {
        self.instrument
    }

    //index of the current bar within the series
    pub fn bar_index(&self) -> usize {
        self.history.len().saturating_sub(1)
    }

    pub fn current_time(&self) -> Option<DateTime<Utc>> {
        self.last_bar().map(|b| b.timestamp)
    }

    //returns the last n bars (oldest first)
    pub fn get_bars(&self, n: usize) -> &[Bar] {
        let start = self.history.len().saturating_sub(n);
        &self.history[start..]
    }

    //returns all bars seen so far
    pub fn history(&self) -> &[Bar] {
        self.history
    }

    //returns the most recent bar
    pub fn last_bar(&self) -> Option<&Bar> {
        self.history.last()
    }

    //returns the close prices for the last n bars
    pub fn get_close_prices(&self, n: usize) -> Vec<f64> {
        self.get_bars(n).iter().map(|b| b.close).collect()
    }

    //returns the number of bars in history
    pub fn bar_count(&self) -> usize {
        self.history.len()
    }

    pub fn portfolio(&self) -> &Portfolio {
        self.portfolio
    }

    //returns the current position for the traded instrument
    pub fn current_position(&self) -> Option<&Position> {
        self.portfolio.position(self.instrument)
    }

    //signed quantity held in the traded instrument
    pub fn position_quantity(&self) -> f64 {
        self.portfolio.quantity(self.instrument)
    }

    pub fn cash(&self) -> f64 {
        self.portfolio.cash()
    }

    pub fn equity(&self) -> f64 {
        self.portfolio.equity()
    }

    pub fn initial_capital(&self) -> f64 {
        self.portfolio.initial_capital()
    }

    //builds a market order for the traded instrument
    pub fn market_order(&self, side: OrderSide, quantity: f64) -> Order {
        Order::market(self.instrument, side, quantity)
    }

    //builds a limit order for the traded instrument
    pub fn limit_order(&self, side: OrderSide, quantity: f64, limit_price: f64) -> Order {
        Order::limit(self.instrument, side, quantity, limit_price)
    }

    //order that flattens the current position, if any
    pub fn close_position(&self) -> Option<Order> {
        let qty = self.position_quantity();
        match self.current_position() {
            Some(p) if !p.is_flat() => {
                let side = if qty > 0.0 {
                    OrderSide::Sell
                } else {
                    OrderSide::Buy
                };
                Some(self.market_order(side, qty.abs()))
            }
            _ => None,
        }
    }
}

//how a strategy sizes its entries
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type", content = "value")]
pub enum Sizing {
    //fixed number of units
    Units(f64),
    //fraction of initial capital converted at the entry price
    CapitalFraction(f64),
}

impl Default for Sizing {
    fn default() -> Self {
        Sizing::CapitalFraction(0.3)
    }
}

impl Sizing {
    //quantity to enter at price, none if the sizing yields nothing tradable
    pub fn quantity(&self, initial_capital: f64, price: f64) -> Option<f64> {
        let qty = match *self {
            Sizing::Units(units) => units,
            Sizing::CapitalFraction(fraction) if price > 0.0 => initial_capital * fraction / price,
            Sizing::CapitalFraction(_) => return None,
        };
        (qty.is_finite() && qty > 0.0).then_some(qty)
    }

    //capital needed to enter at price
    pub fn notional(&self, initial_capital: f64, price: f64) -> f64 {
        match *self {
            Sizing::Units(units) => units * price,
            Sizing::CapitalFraction(fraction) => initial_capital * fraction,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match *self {
            Sizing::Units(units) if !(units.is_finite() && units > 0.0) => {
                Err(format!("units must be positive, got {}", units))
            }
            Sizing::CapitalFraction(f) if !(f.is_finite() && f > 0.0 && f <= 1.0) => {
                Err(format!("capital fraction must be in (0, 1], got {}", f))
            }
            _ => Ok(()),
        }
    }
}

//helper function to calculate simple moving average
pub fn sma(prices: &[f64]) -> Option<f64> {
    if prices.is_empty() {
        return None;
    }
    Some(prices.iter().sum::<f64>() / prices.len() as f64)
}
