use crate::data::{Bar, BarSeries};
use crate::engine::execution::{
    CommissionConfig, CostModel, ExecutionModel, Fill, FillTiming, Order, SlippageConfig,
};
use crate::engine::result::{AbortKind, AbortReason, Annotation, BacktestResult, RunState};
use crate::error::{BacktestError, Result};
use crate::metrics::{calculate_equity_curve, SummaryMetrics};
use crate::portfolio::Portfolio;
use crate::strategy::{Strategy, StrategyContext};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

//what the engine does when it reaches an interior gap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GapPolicy {
    //continue and record the gap in the result annotations
    #[default]
    Skip,
    //abort the run at the first interior gap
    Fail,
}

//configuration for a backtest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BacktestConfig {
    pub initial_capital: f64,
    pub commission: CommissionConfig,
    pub slippage: SlippageConfig,
    pub fill_timing: FillTiming,
    pub gap_policy: GapPolicy,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        BacktestConfig {
            initial_capital: 10_000.0,
            commission: CommissionConfig::default(),
            slippage: SlippageConfig::default(),
            fill_timing: FillTiming::default(),
            gap_policy: GapPolicy::default(),
        }
    }
}

impl BacktestConfig {
    //fails fast on values no run could use
    pub fn validate(&self) -> Result<()> {
        if !self.initial_capital.is_finite() || self.initial_capital <= 0.0 {
            return Err(BacktestError::Configuration(format!(
                "initial capital must be positive, got {}",
                self.initial_capital
            )));
        }

        let terms = [
            ("commission.fixed", self.commission.fixed, f64::INFINITY),
            ("commission.proportional", self.commission.proportional, 1.0),
            (
                "commission.sellProportional",
                self.commission.sell_proportional.unwrap_or(0.0),
                1.0,
            ),
            ("slippage.fixed", self.slippage.fixed, f64::INFINITY),
            ("slippage.proportional", self.slippage.proportional, 1.0),
        ];
        for (name, value, bound) in terms {
            if !value.is_finite() || value < 0.0 || value >= bound {
                return Err(BacktestError::Configuration(format!(
                    "{} must be finite, non-negative and below {}, got {}",
                    name, bound, value
                )));
            }
        }

        Ok(())
    }

    //the cost model described by this configuration
    pub fn cost_model(&self) -> CostModel {
        CostModel::new(self.commission, self.slippage)
    }
}

//cooperative cancellation shared between a caller and a running engine
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

//substrate that drives a strategy over a series
pub trait SimulationBackend {
    fn name(&self) -> &str;

    //ok for completed and aborted runs alike; err only when the run cannot start
    fn simulate(
        &mut self,
        series: &BarSeries,
        strategy: &mut dyn Strategy,
        execution: &dyn ExecutionModel,
        cancel: &CancelToken,
    ) -> Result<BacktestResult>;
}

//in-process, single-threaded backtest engine
pub struct BacktestEngine {
    config: BacktestConfig,
    state: RunState,
}

impl BacktestEngine {
    //creates a new backtest engine, rejecting an invalid configuration
    pub fn new(config: BacktestConfig) -> Result<Self> {
        config.validate()?;
        Ok(BacktestEngine {
            config,
            state: RunState::Initialized,
        })
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    //state of the most recent run
    pub fn state(&self) -> RunState {
        self.state
    }

    //runs the backtest with the given strategy and execution model
    pub fn run(
        &mut self,
        series: &BarSeries,
        strategy: &mut dyn Strategy,
        execution: &dyn ExecutionModel,
    ) -> Result<BacktestResult> {
        self.run_with_cancel(series, strategy, execution, &CancelToken::new())
    }

    pub fn run_with_cancel(
        &mut self,
        series: &BarSeries,
        strategy: &mut dyn Strategy,
        execution: &dyn ExecutionModel,
        cancel: &CancelToken,
    ) -> Result<BacktestResult> {
        self.config.validate()?;
        self.state = RunState::Initialized;

        let bars = series.bars();
        info!(
            strategy = strategy.name(),
            execution = execution.name(),
            key = %series.key(),
            bars = bars.len(),
            fill_timing = ?self.config.fill_timing,
            gap_policy = ?self.config.gap_policy,
            "starting backtest"
        );

        let mut run = RunLoop::new(&self.config, series.instrument(), execution);
        run.annotations
            .extend(series.quarantined().iter().map(|q| Annotation::Quarantined {
                timestamp: q.timestamp,
                source: q.source.clone(),
                reason: q.reason.clone(),
            }));

        strategy.on_start();
        self.state = RunState::Running;

        let mut abort = None;
        let mut processed = 0;

        //main backtest loop
        for (index, bar) in bars.iter().enumerate() {
            if cancel.is_cancelled() {
                abort = Some(AbortReason {
                    kind: AbortKind::Cancelled,
                    bar_index: index,
                    timestamp: bar.timestamp,
                    order_id: None,
                    missing_bars: None,
                    message: "cancelled by caller".to_string(),
                });
                break;
            }

            if let Err(reason) = run.step(series, index, strategy) {
                abort = Some(reason);
                break;
            }
            processed = index + 1;
        }

        if abort.is_none() {
            if let Err(reason) = run.finish(bars, strategy) {
                abort = Some(reason);
            }
        }
        run.expire_pending();

        //fills after the last mark are reflected in the final sample
        run.portfolio.revalue_last_sample();

        self.state = if abort.is_some() {
            RunState::Aborted
        } else {
            RunState::Completed
        };

        match &abort {
            Some(reason) => warn!(
                strategy = strategy.name(),
                bar = reason.bar_index,
                kind = ?reason.kind,
                reason = %reason.message,
                "backtest aborted"
            ),
            None => info!(
                strategy = strategy.name(),
                bars = processed,
                fills = run.trades.len(),
                "backtest completed"
            ),
        }

        Ok(run.into_result(series, strategy.name(), self.state, abort, processed))
    }
}

impl SimulationBackend for BacktestEngine {
    fn name(&self) -> &str {
        "in-process"
    }

    fn simulate(
        &mut self,
        series: &BarSeries,
        strategy: &mut dyn Strategy,
        execution: &dyn ExecutionModel,
        cancel: &CancelToken,
    ) -> Result<BacktestResult> {
        self.run_with_cancel(series, strategy, execution, cancel)
    }
}

//mutable state of one run
struct RunLoop<'a> {
    config: &'a BacktestConfig,
    instrument: &'a str,
    execution: &'a dyn ExecutionModel,
    portfolio: Portfolio,
    trades: Vec<Fill>,
    closed_pnl: Vec<f64>,
    annotations: Vec<Annotation>,
    //next-open orders waiting for the following bar
    pending: Vec<Order>,
    next_order_id: u64,
}

impl<'a> RunLoop<'a> {
    fn new(config: &'a BacktestConfig, instrument: &'a str, execution: &'a dyn ExecutionModel) -> Self {
        RunLoop {
            config,
            instrument,
            execution,
            portfolio: Portfolio::new(config.initial_capital),
            trades: Vec::new(),
            closed_pnl: Vec::new(),
            annotations: Vec::new(),
            pending: Vec::new(),
            next_order_id: 1,
        }
    }

    //one bar: gap check, queued next-open orders, mark-to-market, strategy, execution
    fn step(
        &mut self,
        series: &BarSeries,
        index: usize,
        strategy: &mut dyn Strategy,
    ) -> std::result::Result<(), AbortReason> {
        let bars = series.bars();
        let bar = &bars[index];

        if let Some(gap) = series.gap_before(index).filter(|g| g.is_interior(bars.len())) {
            match self.config.gap_policy {
                GapPolicy::Skip => {
                    warn!(bar = index, missing = gap.missing, from = %gap.from, to = %gap.to, "skipping gap");
                    self.annotations.push(Annotation::GapSkipped {
                        bar_index: index,
                        from: gap.from,
                        to: gap.to,
                        missing: gap.missing,
                    });
                }
                GapPolicy::Fail => {
                    return Err(AbortReason {
                        kind: AbortKind::Gap,
                        bar_index: index,
                        timestamp: bar.timestamp,
                        order_id: None,
                        missing_bars: Some(gap.missing),
                        message: format!("{} bars missing between {} and {}", gap.missing, gap.from, gap.to),
                    });
                }
            }
        }

        if !self.pending.is_empty() {
            let pending = std::mem::take(&mut self.pending);
            self.execute(&pending, bar, index, FillTiming::NextOpen)?;
        }

        self.portfolio
            .mark_to_market(self.instrument, bar.close, bar.timestamp);

        let decided = {
            let context = StrategyContext::new(self.instrument, &bars[..=index], &self.portfolio);
            strategy.on_bar(&context, bar)
        };
        let orders = decided.map_err(|e| strategy_failure(index, bar, &e))?;
        let orders = self.stamp(orders, index);

        match self.config.fill_timing {
            FillTiming::SameClose => self.execute(&orders, bar, index, FillTiming::SameClose)?,
            FillTiming::NextOpen => self.pending.extend(orders),
        }

        Ok(())
    }

    //end-of-run hook; under same-close its orders fill at the final close,
    //under next-open there is no following bar, so they are queued and expire
    fn finish(&mut self, bars: &[Bar], strategy: &mut dyn Strategy) -> std::result::Result<(), AbortReason> {
        let (index, last) = match bars.last() {
            Some(last) => (bars.len() - 1, last),
            None => return Ok(()),
        };

        let decided = {
            let context = StrategyContext::new(self.instrument, bars, &self.portfolio);
            strategy.on_end(&context)
        };
        let orders = decided.map_err(|e| strategy_failure(index, last, &e))?;
        let orders = self.stamp(orders, index);

        match self.config.fill_timing {
            FillTiming::SameClose => self.execute(&orders, last, index, FillTiming::SameClose),
            FillTiming::NextOpen => {
                self.pending.extend(orders);
                Ok(())
            }
        }
    }

    fn expire_pending(&mut self) {
        for order in self.pending.drain(..) {
            debug!(order = order.id, "next-open order left without a following bar");
            self.annotations.push(Annotation::OrderExpired {
                order_id: order.id,
                bar_index: order.bar_index,
            });
        }
    }

    //assigns run-unique ids and the originating bar
    fn stamp(&mut self, orders: Vec<Order>, index: usize) -> Vec<Order> {
        orders
            .into_iter()
            .map(|mut order| {
                order.id = self.next_order_id;
                order.bar_index = index;
                self.next_order_id += 1;
                order
            })
            .collect()
    }

    //fills a batch against one bar; nothing is applied unless every order executes cleanly
    fn execute(
        &mut self,
        orders: &[Order],
        bar: &Bar,
        index: usize,
        timing: FillTiming,
    ) -> std::result::Result<(), AbortReason> {
        let mut fills = Vec::with_capacity(orders.len());
        let mut unfilled = Vec::new();

        for order in orders {
            let outcome = if order.instrument != self.instrument {
                Err(anyhow::anyhow!(
                    "order for {} in a {} run",
                    order.instrument,
                    self.instrument
                ))
            } else {
                self.execution.fill(order, bar, timing)
            };

            match outcome {
                Ok(Some(fill)) => fills.push(fill),
                Ok(None) => unfilled.push(Annotation::OrderUnfilled {
                    order_id: order.id,
                    bar_index: order.bar_index,
                }),
                Err(e) => {
                    return Err(AbortReason {
                        kind: AbortKind::ExecutionFailure,
                        bar_index: index,
                        timestamp: bar.timestamp,
                        order_id: Some(order.id),
                        missing_bars: None,
                        message: format!("{:#}", e),
                    })
                }
            }
        }

        self.annotations.extend(unfilled);
        for fill in fills {
            let effect = self.portfolio.apply_fill(&fill);
            if let Some(pnl) = effect.realized_pnl {
                self.closed_pnl.push(pnl);
            }
            debug!(
                order = fill.order_id,
                side = ?fill.side,
                qty = fill.quantity,
                price = fill.price,
                commission = fill.commission,
                "filled"
            );
            self.trades.push(fill);
        }

        Ok(())
    }

    fn into_result(
        self,
        series: &BarSeries,
        strategy: &str,
        state: RunState,
        abort_reason: Option<AbortReason>,
        bars_processed: usize,
    ) -> BacktestResult {
        let initial_capital = self.config.initial_capital;
        let equity_curve = calculate_equity_curve(self.portfolio.equity_curve(), initial_capital);
        let summary = SummaryMetrics::from_backtest(
            &equity_curve,
            &self.trades,
            &self.closed_pnl,
            initial_capital,
            series.timeframe().periods_per_year(),
        );

        BacktestResult {
            strategy: strategy.to_string(),
            instrument: series.instrument().to_string(),
            timeframe: series.timeframe(),
            config: self.config.clone(),
            state,
            aborted: abort_reason.is_some(),
            abort_reason,
            bars_processed,
            summary,
            equity_curve,
            final_cash: self.portfolio.cash(),
            final_positions: self.portfolio.positions().cloned().collect(),
            trades: self.trades,
            closed_pnl: self.closed_pnl,
            annotations: self.annotations,
        }
    }
}

fn strategy_failure(index: usize, bar: &Bar, error: &anyhow::Error) -> AbortReason {
    AbortReason {
        kind: AbortKind::StrategyFailure,
        bar_index: index,
        timestamp: bar.timestamp,
        order_id: None,
        missing_bars: None,
        message: format!("{:#}", error),
    }
}
