use crate::portfolio::EquitySample;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

//a point in the equity curve; also the equity export row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
    pub cash: f64,
    pub drawdown: f64,
    pub returns: f64,
}

impl EquityPoint {
    //true while part of equity is held in positions
    pub fn in_market(&self) -> bool {
        (self.equity - self.cash).abs() > 1e-9
    }
}

//calculates the equity curve with drawdowns from mark-to-market samples
pub fn calculate_equity_curve(samples: &[EquitySample], initial_capital: f64) -> Vec<EquityPoint> {
    let mut curve = Vec::with_capacity(samples.len());
    let mut peak = initial_capital;
    let mut prev_equity = initial_capital;

    for (i, sample) in samples.iter().enumerate() {
        let equity = sample.equity;
        if equity > peak {
            peak = equity;
        }

        let drawdown = if peak > 0.0 {
            (peak - equity) / peak
        } else {
            0.0
        };

        let returns = if i == 0 || prev_equity == 0.0 {
            0.0
        } else {
            (equity - prev_equity) / prev_equity
        };

        curve.push(EquityPoint {
            timestamp: sample.timestamp,
            equity,
            cash: sample.cash,
            drawdown,
            returns,
        });
        prev_equity = equity;
    }

    curve
}

//calculates maximum drawdown from equity curve
pub fn max_drawdown(equity_curve: &[EquityPoint]) -> f64 {
    equity_curve
        .iter()
        .map(|point| point.drawdown)
        .fold(0.0, f64::max)
}

//per-bar simple returns; a zero equity yields no return for the following step
pub fn calculate_returns(equity_curve: &[EquityPoint]) -> Vec<f64> {
    equity_curve
        .windows(2)
        .filter(|w| w[0].equity != 0.0)
        .map(|w| (w[1].equity - w[0].equity) / w[0].equity)
        .collect()
}
