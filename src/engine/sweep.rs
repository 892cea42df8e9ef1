use crate::data::BarSeries;
use crate::engine::backtest::{BacktestConfig, BacktestEngine};
use crate::engine::result::BacktestResult;
use crate::error::Result;
use crate::strategy::Strategy;
use rayon::prelude::*;
use std::cmp::Ordering;
use tracing::info;

//one independent run of a parameter sweep
pub struct SweepJob {
    pub label: String,
    pub config: BacktestConfig,
    pub strategy: Box<dyn Strategy>,
}

impl SweepJob {
    pub fn new(label: impl Into<String>, config: BacktestConfig, strategy: Box<dyn Strategy>) -> Self {
        SweepJob {
            label: label.into(),
            config,
            strategy,
        }
    }
}

pub struct SweepOutcome {
    pub label: String,
    pub result: Result<BacktestResult>,
}

impl SweepOutcome {
    fn total_return(&self) -> Option<f64> {
        self.result.as_ref().ok().map(|r| r.total_return())
    }
}

//runs every job over the shared series in parallel, each with its own engine and portfolio
//sorted by total return descending, then label; failed jobs last
pub fn run_sweep(series: &BarSeries, jobs: Vec<SweepJob>) -> Vec<SweepOutcome> {
    info!(key = %series.key(), jobs = jobs.len(), "starting sweep");

    let mut outcomes: Vec<SweepOutcome> = jobs
        .into_par_iter()
        .map(|mut job| {
            let result = BacktestEngine::new(job.config.clone()).and_then(|mut engine| {
                let model = job.config.cost_model();
                engine.run(series, job.strategy.as_mut(), &model)
            });
            SweepOutcome {
                label: job.label,
                result,
            }
        })
        .collect();

    outcomes.sort_by(|a, b| match (a.total_return(), b.total_return()) {
        (Some(x), Some(y)) => y
            .partial_cmp(&x)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.label.cmp(&b.label)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.label.cmp(&b.label),
    });

    outcomes
}
