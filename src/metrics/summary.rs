use crate::engine::execution::{Fill, OrderSide};
use crate::metrics::timeseries::{calculate_returns, max_drawdown, EquityPoint};
use prettytable::{Cell, Row, Table};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::BTreeMap;

//summary metrics for a backtest
//ratios that are undefined for the run (no variance, no losing trade) are reported as 0
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryMetrics {
    pub initial_capital: f64,
    pub final_equity: f64,
    pub total_pnl: f64,
    //fraction of initial capital
    pub total_return: f64,
    //percent
    pub cagr: f64,
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub profit_factor: f64,
    //fills executed
    pub trade_count: usize,
    pub buy_count: usize,
    pub sell_count: usize,
    //fills that reduced a position
    pub closed_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub total_commission: f64,
    pub exposure: f64,
}

impl SummaryMetrics {
    //calculate summary metrics from the equity curve, the trade log and the realized pnl of closing fills
    pub fn from_backtest(
        equity_curve: &[EquityPoint],
        trades: &[Fill],
        closed_pnl: &[f64],
        initial_capital: f64,
        periods_per_year: f64,
    ) -> Self {
        let final_equity = equity_curve
            .last()
            .map(|p| p.equity)
            .unwrap_or(initial_capital);

        let total_pnl = final_equity - initial_capital;
        let total_return = total_pnl / initial_capital;

        let cagr = match (equity_curve.first(), equity_curve.last()) {
            (Some(first), Some(last)) if equity_curve.len() >= 2 && final_equity > 0.0 => {
                let years = (last.timestamp - first.timestamp).num_seconds() as f64 / (365.25 * 86_400.0);
                if years > 0.0 {
                    ((final_equity / initial_capital).powf(1.0 / years) - 1.0) * 100.0
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };

        let returns = calculate_returns(equity_curve);
        let trade_stats = calculate_trade_statistics(closed_pnl);

        let exposure = if equity_curve.is_empty() {
            0.0
        } else {
            equity_curve.iter().filter(|p| p.in_market()).count() as f64 / equity_curve.len() as f64
        };

        SummaryMetrics {
            initial_capital,
            final_equity,
            total_pnl,
            total_return,
            cagr,
            max_drawdown: max_drawdown(equity_curve),
            sharpe_ratio: calculate_sharpe_ratio(&returns, periods_per_year),
            sortino_ratio: calculate_sortino_ratio(&returns, periods_per_year),
            win_rate: trade_stats.win_rate,
            avg_win: trade_stats.avg_win,
            avg_loss: trade_stats.avg_loss,
            profit_factor: trade_stats.profit_factor,
            trade_count: trades.len(),
            buy_count: trades.iter().filter(|t| t.side == OrderSide::Buy).count(),
            sell_count: trades.iter().filter(|t| t.side == OrderSide::Sell).count(),
            closed_trades: closed_pnl.len(),
            winning_trades: trade_stats.winning,
            losing_trades: trade_stats.losing,
            largest_win: trade_stats.largest_win,
            largest_loss: trade_stats.largest_loss,
            total_commission: trades.iter().map(|t| t.commission).sum(),
            exposure,
        }
    }

    //flat name -> value view used for exports and sweep ranking
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        [
            ("total_return", self.total_return),
            ("max_drawdown", self.max_drawdown),
            ("win_rate", self.win_rate),
            ("sharpe_ratio", self.sharpe_ratio),
            ("trade_count", self.trade_count as f64),
            ("initial_capital", self.initial_capital),
            ("final_equity", self.final_equity),
            ("total_pnl", self.total_pnl),
            ("total_return_pct", self.total_return * 100.0),
            ("cagr", self.cagr),
            ("sortino_ratio", self.sortino_ratio),
            ("profit_factor", self.profit_factor),
            ("avg_win", self.avg_win),
            ("avg_loss", self.avg_loss),
            ("largest_win", self.largest_win),
            ("largest_loss", self.largest_loss),
            ("closed_trades", self.closed_trades as f64),
            ("buy_count", self.buy_count as f64),
            ("sell_count", self.sell_count as f64),
            ("total_commission", self.total_commission),
            ("exposure", self.exposure),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    //builds the metrics table
    pub fn to_table(&self) -> Table {
        let mut table = Table::new();
        table.add_row(Row::new(vec![Cell::new("Metric"), Cell::new("Value")]));

        let rows = [
            ("Initial Capital", format!("${:.2}", self.initial_capital)),
            ("Final Equity", format!("${:.2}", self.final_equity)),
            (
                "Total Return",
                format!("${:.2} ({:.2}%)", self.total_pnl, self.total_return * 100.0),
            ),
            ("CAGR", format!("{:.2}%", self.cagr)),
            ("Max Drawdown", format!("{:.2}%", self.max_drawdown * 100.0)),
            ("Sharpe Ratio", format!("{:.3}", self.sharpe_ratio)),
            ("Sortino Ratio", format!("{:.3}", self.sortino_ratio)),
            (
                "Fills (Buy / Sell)",
                format!("{} ({} / {})", self.trade_count, self.buy_count, self.sell_count),
            ),
            ("Closed Trades", format!("{}", self.closed_trades)),
            ("Win Rate", format!("{:.2}%", self.win_rate * 100.0)),
            ("Avg Win", format!("${:.2}", self.avg_win)),
            ("Avg Loss", format!("${:.2}", self.avg_loss)),
            ("Largest Win", format!("${:.2}", self.largest_win)),
            ("Largest Loss", format!("${:.2}", self.largest_loss)),
            ("Profit Factor", format!("{:.3}", self.profit_factor)),
            ("Total Commission", format!("${:.2}", self.total_commission)),
            ("Exposure", format!("{:.2}%", self.exposure * 100.0)),
        ];

        for (name, value) in rows {
            table.add_row(Row::new(vec![Cell::new(name), Cell::new(&value)]));
        }
        table
    }

    //prints metrics in a formatted table
    pub fn pretty_print_table(&self) {
        self.to_table().printstd();
    }
}

#[derive(Default)]
struct TradeStats {
    winning: usize,
    losing: usize,
    win_rate: f64,
    avg_win: f64,
    avg_loss: f64,
    profit_factor: f64,
    largest_win: f64,
    largest_loss: f64,
}

fn calculate_trade_statistics(closed_pnl: &[f64]) -> TradeStats {
    if closed_pnl.is_empty() {
        return TradeStats::default();
    }

    let wins: Vec<f64> = closed_pnl.iter().copied().filter(|&p| p > 0.0).collect();
    let losses: Vec<f64> = closed_pnl.iter().copied().filter(|&p| p < 0.0).collect();

    let total_wins: f64 = wins.iter().sum();
    let total_losses: f64 = losses.iter().sum::<f64>().abs();

    let avg = |values: &[f64]| {
        if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        }
    };

    TradeStats {
        winning: wins.len(),
        losing: losses.len(),
        win_rate: wins.len() as f64 / closed_pnl.len() as f64,
        avg_win: avg(&wins),
        avg_loss: avg(&losses),
        profit_factor: if total_losses > 0.0 {
            total_wins / total_losses
        } else {
            0.0
        },
        largest_win: wins.iter().fold(0.0f64, |a, &b| a.max(b)),
        largest_loss: losses.iter().fold(0.0f64, |a, &b| a.min(b)),
    }
}

//mean over sample std of per-bar returns, annualized by bars per year; zero risk-free rate
fn calculate_sharpe_ratio(returns: &[f64], periods_per_year: f64) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }

    let mean = returns.mean();
    let std_dev = returns.std_dev();

    if !std_dev.is_finite() || std_dev == 0.0 {
        return 0.0;
    }

    (mean / std_dev) * periods_per_year.sqrt()
}

fn calculate_sortino_ratio(returns: &[f64], periods_per_year: f64) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }

    let mean = returns.mean();

    //downside deviation over negative returns only
    let negative_returns: Vec<f64> = returns.iter().filter(|&&r| r < 0.0).copied().collect();
    if negative_returns.len() < 2 {
        return 0.0;
    }

    let downside_dev = negative_returns.std_dev();
    if !downside_dev.is_finite() || downside_dev == 0.0 {
        return 0.0;
    }

    (mean / downside_dev) * periods_per_year.sqrt()
}
