//end-to-end engine runs over small synthetic series

mod common;

use barcache::data::Bar;
use barcache::engine::{
    run_sweep, AbortKind, Annotation, BacktestConfig, BacktestEngine, CancelToken, CostModel,
    FillTiming, GapPolicy, Order, OrderSide, RunState, SweepJob,
};
use barcache::error::BacktestError;
use barcache::strategy::{buy_and_hold::BuyAndHoldStrategy, Sizing, Strategy, StrategyContext};
use common::{bar, hour, series_from_bars, series_from_closes, INSTRUMENT};

//places fixed market orders at fixed bar indices
struct Scripted {
    orders: Vec<(usize, OrderSide, f64)>,
}

impl Scripted {
    fn new(orders: &[(usize, OrderSide, f64)]) -> Self {
        Scripted {
            orders: orders.to_vec(),
        }
    }
}

impl Strategy for Scripted {
    fn on_bar(&mut self, context: &StrategyContext<'_>, _bar: &Bar) -> anyhow::Result<Vec<Order>> {
        Ok(self
            .orders
            .iter()
            .filter(|(index, _, _)| *index == context.bar_index())
            .map(|&(_, side, qty)| context.market_order(side, qty))
            .collect())
    }

    fn name(&self) -> &str {
        "Scripted"
    }
}

fn config(initial_capital: f64) -> BacktestConfig {
    BacktestConfig {
        initial_capital,
        ..BacktestConfig::default()
    }
}

fn run(config: BacktestConfig, series: &barcache::data::BarSeries, strategy: &mut dyn Strategy) -> barcache::engine::BacktestResult {
    let model = config.cost_model();
    let mut engine = BacktestEngine::new(config).unwrap();
    engine.run(series, strategy, &model).unwrap()
}

fn gapped_series() -> barcache::data::BarSeries {
    //hour 3 is missing
    series_from_bars(vec![
        bar(hour(1), 100.0, 100.0),
        bar(hour(2), 100.0, 101.0),
        bar(hour(4), 101.0, 102.0),
        bar(hour(5), 102.0, 103.0),
    ])
}

#[test]
fn round_trip_at_same_close() {
    let series = series_from_closes(&[100.0, 101.0, 99.0, 102.0, 105.0]);
    let mut strategy = Scripted::new(&[(1, OrderSide::Buy, 1.0), (3, OrderSide::Sell, 1.0)]);

    let result = run(config(1000.0), &series, &mut strategy);

    assert_eq!(result.state, RunState::Completed);
    assert!(!result.aborted);
    assert_eq!(result.bars_processed, 5);
    assert_eq!(result.trades.len(), 2);

    let (buy, sell) = (&result.trades[0], &result.trades[1]);
    assert_eq!((buy.side, buy.price, buy.bar_index), (OrderSide::Buy, 101.0, 1));
    assert_eq!((sell.side, sell.price, sell.bar_index), (OrderSide::Sell, 102.0, 3));
    assert_eq!(buy.timestamp, hour(2));
    assert_eq!(buy.order_id, 1);
    assert_eq!(sell.order_id, 2);

    assert!((result.final_equity() - 1001.0).abs() < 1e-9);
    assert!((result.final_cash - 1001.0).abs() < 1e-9);
    assert_eq!(result.closed_pnl.len(), 1);
    assert!((result.closed_pnl[0] - 1.0).abs() < 1e-9);
    assert_eq!(result.summary.win_rate, 1.0);
    assert_eq!(result.equity_curve.len(), 5);

    //holding one unit from bar 1 to bar 3
    let equities: Vec<f64> = result.equity_curve.iter().map(|p| p.equity).collect();
    assert_eq!(equities, vec![1000.0, 1000.0, 998.0, 1001.0, 1001.0]);
}

#[test]
fn identical_inputs_give_identical_results() {
    let series = series_from_closes(&[100.0, 104.0, 98.0, 97.0, 103.0, 108.0, 101.0, 99.0, 110.0]);
    let config = BacktestConfig {
        initial_capital: 5_000.0,
        commission: barcache::engine::CommissionConfig {
            fixed: 0.5,
            proportional: 0.001,
            sell_proportional: Some(0.0008),
        },
        slippage: barcache::engine::SlippageConfig {
            fixed: 0.0,
            proportional: 0.0005,
        },
        ..BacktestConfig::default()
    };
    let orders = [
        (1, OrderSide::Buy, 10.0),
        (3, OrderSide::Buy, 5.0),
        (5, OrderSide::Sell, 12.0),
        (7, OrderSide::Sell, 3.0),
    ];

    let first = run(config.clone(), &series, &mut Scripted::new(&orders));
    let second = run(config, &series, &mut Scripted::new(&orders));

    assert_eq!(first, second);
    assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
    assert!(first.summary.total_commission > 0.0);
}

#[test]
fn interior_gap_is_annotated_under_skip() {
    let series = gapped_series();
    let result = run(config(1000.0), &series, &mut Scripted::new(&[]));

    assert_eq!(result.state, RunState::Completed);
    assert_eq!(result.bars_processed, 4);

    let gaps: Vec<&Annotation> = result.gap_annotations().collect();
    assert_eq!(
        gaps,
        vec![&Annotation::GapSkipped {
            bar_index: 2,
            from: hour(3),
            to: hour(3),
            missing: 1,
        }]
    );
}

#[test]
fn interior_gap_aborts_under_fail() {
    let series = gapped_series();
    let config = BacktestConfig {
        gap_policy: GapPolicy::Fail,
        ..config(1000.0)
    };
    let mut strategy = Scripted::new(&[(0, OrderSide::Buy, 1.0)]);

    let result = run(config, &series, &mut strategy);

    assert_eq!(result.state, RunState::Aborted);
    assert!(result.aborted);
    assert_eq!(result.bars_processed, 2);

    let reason = result.abort_reason.clone().unwrap();
    assert_eq!(reason.kind, AbortKind::Gap);
    assert_eq!(reason.bar_index, 2);
    assert_eq!(reason.missing_bars, Some(1));
    assert_eq!(
        reason.to_error(),
        BacktestError::GapEncountered {
            bar_index: 2,
            timestamp: hour(4),
            missing: 1,
        }
    );

    //the position opened before the gap is still reported
    assert_eq!(result.trades.len(), 1);
    assert_eq!(result.final_positions.len(), 1);
}

//records what it was allowed to see on every bar
#[derive(Default)]
struct Snooper {
    seen: Vec<(usize, usize, bool)>,
}

impl Strategy for Snooper {
    fn on_bar(&mut self, context: &StrategyContext<'_>, bar: &Bar) -> anyhow::Result<Vec<Order>> {
        let current = context.last_bar().map(|b| b.timestamp) == Some(bar.timestamp);
        self.seen.push((context.bar_index(), context.bar_count(), current));
        Ok(Vec::new())
    }

    fn name(&self) -> &str {
        "Snooper"
    }
}

#[test]
fn strategy_never_sees_future_bars() {
    let series = series_from_closes(&[100.0, 101.0, 102.0, 103.0, 104.0, 105.0]);
    let mut snooper = Snooper::default();

    run(config(1000.0), &series, &mut snooper);

    assert_eq!(snooper.seen.len(), 6);
    for (i, &(index, count, current)) in snooper.seen.iter().enumerate() {
        assert_eq!(index, i);
        assert_eq!(count, i + 1);
        assert!(current);
    }
}

struct FailsAt(usize);

impl Strategy for FailsAt {
    fn on_bar(&mut self, context: &StrategyContext<'_>, _bar: &Bar) -> anyhow::Result<Vec<Order>> {
        if context.bar_index() == self.0 {
            anyhow::bail!("indicator blew up");
        }
        Ok(Vec::new())
    }

    fn name(&self) -> &str {
        "Fails"
    }
}

#[test]
fn strategy_error_aborts_with_partial_results() {
    let series = series_from_closes(&[100.0, 101.0, 102.0, 103.0]);
    let result = run(config(1000.0), &series, &mut FailsAt(2));

    assert_eq!(result.state, RunState::Aborted);
    assert_eq!(result.bars_processed, 2);
    //the failing bar was already marked
    assert_eq!(result.equity_curve.len(), 3);

    let reason = result.abort_reason.unwrap();
    assert_eq!(reason.kind, AbortKind::StrategyFailure);
    assert_eq!(reason.bar_index, 2);
    assert!(reason.message.contains("indicator blew up"));
}

struct WrongInstrument;

impl Strategy for WrongInstrument {
    fn on_bar(&mut self, context: &StrategyContext<'_>, _bar: &Bar) -> anyhow::Result<Vec<Order>> {
        if context.bar_index() == 1 {
            return Ok(vec![
                context.market_order(OrderSide::Buy, 1.0),
                Order::market("ETH/USDT", OrderSide::Buy, 1.0),
            ]);
        }
        Ok(Vec::new())
    }

    fn name(&self) -> &str {
        "Wrong Instrument"
    }
}

#[test]
fn execution_failure_applies_nothing_from_the_batch() {
    let series = series_from_closes(&[100.0, 101.0, 102.0]);
    let result = run(config(1000.0), &series, &mut WrongInstrument);

    assert_eq!(result.state, RunState::Aborted);
    let reason = result.abort_reason.unwrap();
    assert_eq!(reason.kind, AbortKind::ExecutionFailure);
    assert_eq!(reason.bar_index, 1);
    assert_eq!(reason.order_id, Some(2));

    assert!(result.trades.is_empty());
    assert!((result.final_cash - 1000.0).abs() < 1e-9);
}

//cancels the shared token once it reaches a bar
struct CancelsAt {
    index: usize,
    token: CancelToken,
}

impl Strategy for CancelsAt {
    fn on_bar(&mut self, context: &StrategyContext<'_>, _bar: &Bar) -> anyhow::Result<Vec<Order>> {
        if context.bar_index() == self.index {
            self.token.cancel();
        }
        Ok(Vec::new())
    }

    fn name(&self) -> &str {
        "Cancels"
    }
}

#[test]
fn cancellation_stops_before_the_next_bar() {
    let series = series_from_closes(&[100.0, 101.0, 102.0, 103.0, 104.0]);
    let token = CancelToken::new();
    let mut strategy = CancelsAt {
        index: 2,
        token: token.clone(),
    };
    let config = config(1000.0);
    let model = config.cost_model();
    let mut engine = BacktestEngine::new(config).unwrap();

    let result = engine
        .run_with_cancel(&series, &mut strategy, &model, &token)
        .unwrap();

    assert_eq!(engine.state(), RunState::Aborted);
    assert_eq!(result.bars_processed, 3);
    let reason = result.abort_reason.unwrap();
    assert_eq!(reason.kind, AbortKind::Cancelled);
    assert_eq!(reason.to_error(), BacktestError::Cancelled { bar_index: 3 });
}

#[test]
fn invalid_configuration_is_rejected_before_running() {
    let err = BacktestEngine::new(config(0.0)).err().unwrap();
    assert!(matches!(err, BacktestError::Configuration(_)));

    let negative_fee = BacktestConfig {
        commission: barcache::engine::CommissionConfig::flat(-1.0, 0.0),
        ..BacktestConfig::default()
    };
    assert!(matches!(
        BacktestEngine::new(negative_fee),
        Err(BacktestError::Configuration(_))
    ));
}

#[test]
fn next_open_fills_on_the_following_bar_and_expires_at_the_end() {
    //opens: 100, 100, 101, 99, 102
    let series = series_from_closes(&[100.0, 101.0, 99.0, 102.0, 105.0]);
    let config = BacktestConfig {
        fill_timing: FillTiming::NextOpen,
        ..config(1000.0)
    };
    let mut strategy = Scripted::new(&[(1, OrderSide::Buy, 1.0), (4, OrderSide::Sell, 1.0)]);

    let result = run(config, &series, &mut strategy);

    assert_eq!(result.state, RunState::Completed);
    assert_eq!(result.trades.len(), 1);
    let fill = &result.trades[0];
    assert_eq!(fill.price, 101.0);
    assert_eq!(fill.bar_index, 1);
    assert_eq!(fill.timestamp, hour(3));

    assert_eq!(
        result.annotations,
        vec![Annotation::OrderExpired {
            order_id: 2,
            bar_index: 4,
        }]
    );
    //still long one unit at the last close
    assert!((result.final_equity() - (1000.0 - 101.0 + 105.0)).abs() < 1e-9);
}

#[test]
fn limit_order_that_is_never_reached_is_annotated() {
    struct LowBid;
    impl Strategy for LowBid {
        fn on_bar(&mut self, context: &StrategyContext<'_>, _bar: &Bar) -> anyhow::Result<Vec<Order>> {
            if context.bar_index() == 0 {
                return Ok(vec![context.limit_order(OrderSide::Buy, 1.0, 50.0)]);
            }
            Ok(Vec::new())
        }

        fn name(&self) -> &str {
            "Low Bid"
        }
    }

    let series = series_from_closes(&[100.0, 101.0]);
    let result = run(config(1000.0), &series, &mut LowBid);

    assert!(result.trades.is_empty());
    assert_eq!(
        result.annotations,
        vec![Annotation::OrderUnfilled {
            order_id: 1,
            bar_index: 0,
        }]
    );
}

#[test]
fn costs_reduce_equity() {
    let series = series_from_closes(&[100.0, 100.0, 100.0]);
    let config = BacktestConfig {
        commission: barcache::engine::CommissionConfig::flat(1.0, 0.0),
        ..config(1000.0)
    };
    let mut strategy = Scripted::new(&[(0, OrderSide::Buy, 2.0), (2, OrderSide::Sell, 2.0)]);

    let result = run(config, &series, &mut strategy);

    assert!((result.final_equity() - 998.0).abs() < 1e-9);
    assert!((result.summary.total_commission - 2.0).abs() < 1e-9);
    assert_eq!(result.closed_pnl.len(), 1);
    assert!(result.closed_pnl[0] < 0.0);
    assert_eq!(result.summary.losing_trades, 1);
}

#[test]
fn sweep_ranks_by_total_return_with_failures_last() {
    let series = series_from_closes(&[100.0, 102.0, 104.0, 106.0, 108.0, 110.0]);
    let broken = BacktestConfig {
        initial_capital: -1.0,
        ..BacktestConfig::default()
    };

    let jobs = vec![
        SweepJob::new("idle", BacktestConfig::default(), Box::new(Scripted::new(&[]))),
        SweepJob::new("broken", broken, Box::new(Scripted::new(&[]))),
        SweepJob::new(
            "hold",
            BacktestConfig::default(),
            Box::new(BuyAndHoldStrategy::new(Sizing::CapitalFraction(1.0))),
        ),
        SweepJob::new(
            "half",
            BacktestConfig::default(),
            Box::new(BuyAndHoldStrategy::new(Sizing::CapitalFraction(0.5))),
        ),
    ];

    let outcomes = run_sweep(&series, jobs);
    let labels: Vec<&str> = outcomes.iter().map(|o| o.label.as_str()).collect();

    assert_eq!(labels, vec!["hold", "half", "idle", "broken"]);
    assert!(outcomes[3].result.is_err());
    assert!(outcomes[0].result.as_ref().unwrap().total_return() > 0.09);
}

#[test]
fn export_writes_every_artifact() {
    let series = series_from_closes(&[100.0, 101.0, 99.0, 102.0, 105.0]);
    let mut strategy = Scripted::new(&[(1, OrderSide::Buy, 1.0), (3, OrderSide::Sell, 1.0)]);
    let result = run(config(1000.0), &series, &mut strategy);

    let dir = tempfile::tempdir().unwrap();
    result.export(dir.path()).unwrap();

    let equity = std::fs::read_to_string(dir.path().join("equity.csv")).unwrap();
    let mut lines = equity.lines();
    assert_eq!(lines.next(), Some("timestamp,equity,cash,drawdown,returns"));
    assert_eq!(lines.count(), 5);

    let trades = std::fs::read_to_string(dir.path().join("trades.csv")).unwrap();
    let mut lines = trades.lines();
    assert_eq!(
        lines.next(),
        Some("fill_id,order_id,bar_index,timestamp,instrument,side,quantity,price,commission,slippage")
    );
    let first = lines.next().unwrap();
    assert!(first.starts_with("1,1,1,"));
    assert!(first.contains(INSTRUMENT));
    assert!(first.contains(",buy,"));

    let metrics: std::collections::BTreeMap<String, f64> =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("metrics.json")).unwrap()).unwrap();
    for key in ["total_return", "max_drawdown", "win_rate", "sharpe_ratio", "trade_count"] {
        assert!(metrics.contains_key(key), "missing {}", key);
    }
    assert_eq!(metrics["trade_count"], 2.0);

    let restored: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("result.json")).unwrap()).unwrap();
    assert_eq!(restored["strategy"], "Scripted");
    assert_eq!(restored["state"], "completed");
}

#[test]
fn cost_model_is_usable_directly() {
    let model = CostModel::new(Default::default(), Default::default());
    let series = series_from_closes(&[100.0, 101.0]);
    let mut strategy = Scripted::new(&[(0, OrderSide::Buy, 1.0)]);
    let mut engine = BacktestEngine::new(config(1000.0)).unwrap();

    let result = engine.run(&series, &mut strategy, &model).unwrap();
    assert_eq!(result.trades[0].price, 100.0);
}

//buys one unit from the end-of-run hook
struct BuysAtEnd;

impl Strategy for BuysAtEnd {
    fn on_bar(&mut self, _context: &StrategyContext<'_>, _bar: &Bar) -> anyhow::Result<Vec<Order>> {
        Ok(Vec::new())
    }

    fn on_end(&mut self, context: &StrategyContext<'_>) -> anyhow::Result<Vec<Order>> {
        Ok(vec![context.market_order(OrderSide::Buy, 1.0)])
    }

    fn name(&self) -> &str {
        "Buys At End"
    }
}

#[test]
fn end_of_run_orders_fill_at_last_close_only_under_same_close() {
    let series = series_from_closes(&[100.0, 101.0, 102.0]);

    let same_close = run(config(1000.0), &series, &mut BuysAtEnd);
    assert_eq!(same_close.trades.len(), 1);
    assert_eq!(same_close.trades[0].price, 102.0);
    assert_eq!(same_close.trades[0].bar_index, 2);
    assert!(same_close.annotations.is_empty());

    let next_open = BacktestConfig {
        fill_timing: FillTiming::NextOpen,
        ..config(1000.0)
    };
    let result = run(next_open, &series, &mut BuysAtEnd);

    assert_eq!(result.state, RunState::Completed);
    assert!(result.trades.is_empty());
    assert_eq!(
        result.annotations,
        vec![Annotation::OrderExpired {
            order_id: 1,
            bar_index: 2,
        }]
    );
    assert!((result.final_equity() - 1000.0).abs() < 1e-9);
}
