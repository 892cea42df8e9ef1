use crate::data::Timeframe;
use crate::engine::backtest::BacktestConfig;
use crate::engine::execution::{Fill, OrderSide};
use crate::error::BacktestError;
use crate::metrics::{EquityPoint, SummaryMetrics};
use crate::portfolio::Position;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

//lifecycle of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
    Initialized,
    Running,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AbortKind {
    Gap,
    StrategyFailure,
    ExecutionFailure,
    Cancelled,
}

//why and where a run stopped early
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbortReason {
    pub kind: AbortKind,
    pub bar_index: usize,
    pub timestamp: DateTime<Utc>,
    pub order_id: Option<u64>,
    pub missing_bars: Option<usize>,
    pub message: String,
}

impl AbortReason {
    pub fn to_error(&self) -> BacktestError {
        match self.kind {
            AbortKind::Gap => BacktestError::GapEncountered {
                bar_index: self.bar_index,
                timestamp: self.timestamp,
                missing: self.missing_bars.unwrap_or(0),
            },
            AbortKind::StrategyFailure => BacktestError::StrategyFailure {
                bar_index: self.bar_index,
                timestamp: self.timestamp,
                message: self.message.clone(),
            },
            AbortKind::ExecutionFailure => BacktestError::ExecutionFailure {
                bar_index: self.bar_index,
                timestamp: self.timestamp,
                order_id: self.order_id.unwrap_or(0),
                message: self.message.clone(),
            },
            AbortKind::Cancelled => BacktestError::Cancelled {
                bar_index: self.bar_index,
            },
        }
    }
}

//non-fatal events recorded during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Annotation {
    //an interior gap the run stepped over
    GapSkipped {
        bar_index: usize,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        missing: usize,
    },
    //a source bar rejected before canonicalization
    Quarantined {
        timestamp: DateTime<Utc>,
        source: String,
        reason: String,
    },
    //a limit order its bar never reached; discarded
    OrderUnfilled { order_id: u64, bar_index: usize },
    //a next-open order left without a following bar
    OrderExpired { order_id: u64, bar_index: usize },
}

//one row of the trade export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRow {
    pub fill_id: usize,
    pub order_id: u64,
    pub bar_index: usize,
    pub timestamp: DateTime<Utc>,
    pub instrument: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub price: f64,
    pub commission: f64,
    pub slippage: f64,
}

//result of a backtest; a pure function of (series, strategy, execution model, config)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub strategy: String,
    pub instrument: String,
    pub timeframe: Timeframe,
    pub config: BacktestConfig,
    pub state: RunState,
    pub aborted: bool,
    pub abort_reason: Option<AbortReason>,
    pub bars_processed: usize,
    pub summary: SummaryMetrics,
    pub equity_curve: Vec<EquityPoint>,
    pub trades: Vec<Fill>,
    //realized pnl, net of commission, of each fill that reduced a position
    pub closed_pnl: Vec<f64>,
    pub final_cash: f64,
    pub final_positions: Vec<Position>,
    pub annotations: Vec<Annotation>,
}

impl BacktestResult {
    pub fn final_equity(&self) -> f64 {
        self.summary.final_equity
    }

    pub fn total_return(&self) -> f64 {
        self.summary.total_return
    }

    //fixed-key metrics map
    pub fn metrics(&self) -> BTreeMap<String, f64> {
        self.summary.to_map()
    }

    pub fn gap_annotations(&self) -> impl Iterator<Item = &Annotation> {
        self.annotations
            .iter()
            .filter(|a| matches!(a, Annotation::GapSkipped { .. }))
    }

    pub fn trade_rows(&self) -> Vec<TradeRow> {
        self.trades
            .iter()
            .enumerate()
            .map(|(i, fill)| TradeRow {
                fill_id: i + 1,
                order_id: fill.order_id,
                bar_index: fill.bar_index,
                timestamp: fill.timestamp,
                instrument: fill.instrument.clone(),
                side: fill.side,
                quantity: fill.quantity,
                price: fill.price,
                commission: fill.commission,
                slippage: fill.slippage,
            })
            .collect()
    }

    //timestamp,equity,cash,drawdown,returns
    pub fn write_equity_csv<W: Write>(&self, writer: W) -> anyhow::Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        for point in &self.equity_curve {
            wtr.serialize(point)?;
        }
        wtr.flush()?;
        Ok(())
    }

    //fill_id,order_id,bar_index,timestamp,instrument,side,quantity,price,commission,slippage
    pub fn write_trades_csv<W: Write>(&self, writer: W) -> anyhow::Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        for row in self.trade_rows() {
            wtr.serialize(row)?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    //writes equity.csv, trades.csv, metrics.json and result.json into dir
    pub fn export<P: AsRef<Path>>(&self, dir: P) -> anyhow::Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create export directory: {}", dir.display()))?;

        let create = |name: &str| {
            let path = dir.join(name);
            File::create(&path).with_context(|| format!("failed to create {}", path.display()))
        };

        self.write_equity_csv(create("equity.csv")?)?;
        self.write_trades_csv(create("trades.csv")?)?;
        serde_json::to_writer_pretty(create("metrics.json")?, &self.metrics())?;
        create("result.json")?.write_all(self.to_json()?.as_bytes())?;

        Ok(())
    }
}
