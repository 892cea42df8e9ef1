use anyhow::{Context, Result};
use barcache::data::adapters::flat_file::{parse_timestamp, save_series};
use barcache::prelude::*;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use clap::{Args, Parser, Subcommand};
use prettytable::{Cell, Row, Table};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "barcache")]
#[command(about = "Bar data cache and backtesting engine for crypto spot markets", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    //run a backtest
    Run {
        //json run configuration; replaces every other option
        #[arg(long)]
        config: Option<PathBuf>,

        #[command(flatten)]
        data: DataArgs,

        #[command(flatten)]
        strategy: StrategyArgs,

        #[command(flatten)]
        engine: EngineArgs,

        //directory for equity.csv, trades.csv, metrics.json and result.json
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    //grid search over sma windows, ranked by total return
    Sweep {
        #[command(flatten)]
        data: DataArgs,

        #[command(flatten)]
        engine: EngineArgs,

        //comma separated fast windows
        #[arg(long, value_delimiter = ',', default_value = "5,10,20")]
        fast: Vec<usize>,

        //comma separated slow windows
        #[arg(long, value_delimiter = ',', default_value = "20,50,100")]
        slow: Vec<usize>,

        //fraction of initial capital per entry
        #[arg(long, default_value = "0.3")]
        buy_pct: f64,

        //rows to print
        #[arg(long, default_value = "10")]
        top: usize,
    },

    //resolve a range into the cache and write it out as csv
    Fetch {
        #[command(flatten)]
        data: DataArgs,

        //output csv path
        #[arg(long)]
        output: PathBuf,
    },

    //extend the persisted series from its last bar up to now (use with --sqlite)
    Update {
        #[command(flatten)]
        data: DataArgs,
    },
}

#[derive(Args)]
struct DataArgs {
    //instrument (eg BTC/USDT)
    #[arg(long, default_value = "BTC/USDT")]
    instrument: String,

    //bar timeframe (1m, 5m, 1h, 4h, 1d, ...)
    #[arg(long, default_value = "1h")]
    timeframe: String,

    //range start (YYYY-MM-DD, YYYY-MM-DD HH:MM:SS or rfc3339)
    #[arg(long)]
    start: Option<String>,

    //range end, inclusive
    #[arg(long)]
    end: Option<String>,

    //directory of {exchange}_{BASE}_{QUOTE}_{tf}.csv files
    #[arg(long, default_value = "data")]
    csv_dir: PathBuf,

    //exchange id used in file names and the remote adapter
    #[arg(long, default_value = "binance")]
    exchange: String,

    //csv timestamps mark the bar open instead of the bar close
    #[arg(long)]
    bar_open: bool,

    //fall back to the remote kline api after the csv files
    #[arg(long)]
    remote: bool,

    //optional api key for the remote adapter
    #[arg(long)]
    api_key: Option<String>,

    //per-request adapter timeout in seconds
    #[arg(long, default_value = "30")]
    fetch_timeout: u64,

    //persist the canonical store in this sqlite file (needs the database feature)
    #[arg(long)]
    sqlite: Option<PathBuf>,
}

#[derive(Args)]
struct StrategyArgs {
    //strategy type (sma, reversal, hold)
    #[arg(long, default_value = "sma")]
    strategy: String,

    //fast sma window (for sma strategy)
    #[arg(long)]
    fast: Option<usize>,

    //slow sma window (for sma strategy)
    #[arg(long)]
    slow: Option<usize>,

    //consecutive bearish candles (for reversal strategy)
    #[arg(long)]
    bear_threshold: Option<usize>,

    //take profit percent (for reversal strategy)
    #[arg(long)]
    take_profit: Option<f64>,

    //stop loss percent, negative (for reversal strategy)
    #[arg(long, allow_hyphen_values = true)]
    stop_loss: Option<f64>,

    //fraction of initial capital per entry
    #[arg(long)]
    buy_pct: Option<f64>,

    //fixed units per entry, overrides --buy-pct
    #[arg(long)]
    units: Option<f64>,
}

#[derive(Args)]
struct EngineArgs {
    //initial capital in quote currency
    #[arg(long, default_value = "10000")]
    capital: f64,

    //fixed commission per fill
    #[arg(long, default_value = "0")]
    commission_fixed: f64,

    //commission as a fraction of notional (eg 0.001)
    #[arg(long, default_value = "0")]
    commission: f64,

    //commission fraction on sells, if it differs (eg 0.0008)
    #[arg(long)]
    sell_commission: Option<f64>,

    //fixed slippage per unit
    #[arg(long, default_value = "0")]
    slippage_fixed: f64,

    //slippage as a fraction of price
    #[arg(long, default_value = "0")]
    slippage: f64,

    //fill at the next bar's open instead of the signal bar's close
    #[arg(long)]
    next_open: bool,

    //abort at the first gap instead of skipping it
    #[arg(long)]
    gap_fail: bool,
}

impl DataArgs {
    fn source_config(&self) -> DataSourceConfig {
        let mut priority = vec![SourceKind::Csv];
        if self.remote {
            priority.push(SourceKind::Remote);
        }
        DataSourceConfig {
            priority,
            exchange_id: self.exchange.clone(),
            csv_dir: self.csv_dir.clone(),
            timestamp_convention: if self.bar_open {
                barcache::data::TimestampConvention::BarOpen
            } else {
                barcache::data::TimestampConvention::BarClose
            },
            api_key: self.api_key.clone(),
            fetch_timeout_secs: self.fetch_timeout,
            sqlite_path: self.sqlite.clone(),
            ..DataSourceConfig::default()
        }
    }

    fn timeframe(&self) -> Result<Timeframe> {
        Timeframe::parse(&self.timeframe)
            .ok_or_else(|| anyhow::anyhow!("Unknown timeframe: {}", self.timeframe))
    }

    fn range(&self) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let start = self
            .start
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("--start is required"))
            .and_then(parse_date)?;
        let end = self
            .end
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("--end is required"))
            .and_then(parse_date)?;
        Ok((start, end))
    }
}

impl StrategyArgs {
    fn params(&self) -> Result<StrategyParams> {
        let strategy_type = StrategyType::parse(&self.strategy)
            .ok_or_else(|| anyhow::anyhow!("Unknown strategy: {}", self.strategy))?;

        let mut params = StrategyParams::defaults(strategy_type);
        let sizing_override = match (self.units, self.buy_pct) {
            (Some(units), _) => Some(Sizing::Units(units)),
            (None, Some(pct)) => Some(Sizing::CapitalFraction(pct)),
            (None, None) => None,
        };

        match &mut params {
            StrategyParams::SmaCrossover {
                fast_window,
                slow_window,
                sizing,
                ..
            } => {
                *fast_window = self.fast.unwrap_or(*fast_window);
                *slow_window = self.slow.unwrap_or(*slow_window);
                *sizing = sizing_override.unwrap_or(*sizing);
            }
            StrategyParams::Reversal {
                bear_threshold,
                take_profit_pct,
                stop_loss_pct,
                sizing,
            } => {
                *bear_threshold = self.bear_threshold.unwrap_or(*bear_threshold);
                *take_profit_pct = self.take_profit.unwrap_or(*take_profit_pct);
                *stop_loss_pct = self.stop_loss.unwrap_or(*stop_loss_pct);
                *sizing = sizing_override.unwrap_or(*sizing);
            }
            StrategyParams::BuyAndHold { sizing } => {
                *sizing = sizing_override.unwrap_or(*sizing);
            }
        }

        Ok(params)
    }
}

impl EngineArgs {
    fn config(&self) -> BacktestConfig {
        BacktestConfig {
            initial_capital: self.capital,
            commission: CommissionConfig {
                fixed: self.commission_fixed,
                proportional: self.commission,
                sell_proportional: self.sell_commission,
            },
            slippage: SlippageConfig {
                fixed: self.slippage_fixed,
                proportional: self.slippage,
            },
            fill_timing: if self.next_open {
                FillTiming::NextOpen
            } else {
                FillTiming::SameClose
            },
            gap_policy: if self.gap_fail {
                GapPolicy::Fail
            } else {
                GapPolicy::Skip
            },
        }
    }
}

//accepts a bare date as midnight utc on top of the csv timestamp formats
fn parse_date(raw: &str) -> Result<DateTime<Utc>> {
    if let Some(ts) = parse_timestamp(raw) {
        return Ok(ts);
    }
    let date = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .with_context(|| format!("Invalid date: {}", raw))?;
    date.and_hms_opt(0, 0, 0)
        .map(|dt| Utc.from_utc_datetime(&dt))
        .ok_or_else(|| anyhow::anyhow!("Invalid date: {}", raw))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            data,
            strategy,
            engine,
            output_dir,
        } => {
            let run = match config {
                Some(path) => RunConfiguration::from_json_file(&path)?,
                None => {
                    let (start, end) = data.range()?;
                    RunConfiguration {
                        instrument: data.instrument.clone(),
                        timeframe: data.timeframe()?,
                        start,
                        end,
                        data: data.source_config(),
                        backtest: engine.config(),
                        strategy: strategy.params()?,
                        output_dir,
                    }
                }
            };
            run_backtest(run).await?;
        }
        Commands::Sweep {
            data,
            engine,
            fast,
            slow,
            buy_pct,
            top,
        } => {
            run_parameter_sweep(&data, engine.config(), &fast, &slow, buy_pct, top).await?;
        }
        Commands::Update { data } => {
            let cache = data.source_config().build_cache().await?;
            let updated = cache
                .update_to(&data.instrument, data.timeframe()?, Utc::now())
                .await?;
            match updated {
                Some(series) => println!(
                    "Appended {} bars ({} gaps, {} quarantined) for {}",
                    series.len(),
                    series.gaps().len(),
                    series.quarantined().len(),
                    data.instrument
                ),
                None => println!("Nothing to update for {} {}", data.instrument, data.timeframe),
            }
        }
        Commands::Fetch { data, output } => {
            let (start, end) = data.range()?;
            let cache = data.source_config().build_cache().await?;
            let series = cache
                .get(&data.instrument, data.timeframe()?, start, end)
                .await?;
            save_series(&series, &output)?;
            println!(
                "Saved {} bars ({} gaps, {} quarantined) to {:?}",
                series.len(),
                series.gaps().len(),
                series.quarantined().len(),
                output
            );
        }
    }

    Ok(())
}

async fn run_backtest(run: RunConfiguration) -> Result<()> {
    run.validate()?;

    println!("barcache backtest");
    println!("=================\n");

    let cache = run.data.build_cache().await?;
    info!(sources = ?cache.adapter_names(), "data cache ready");

    let series = cache
        .get(&run.instrument, run.timeframe, run.start, run.end)
        .await
        .with_context(|| format!("Failed to load {} {}", run.instrument, run.timeframe))?;

    println!(
        "Loaded {} {} bars for {} ({} gaps, {} quarantined)",
        series.len(),
        run.timeframe,
        run.instrument,
        series.gaps().len(),
        series.quarantined().len()
    );
    println!("Strategy: {}", run.strategy.label());
    println!(
        "Fill timing: {:?}, gap policy: {:?}\n",
        run.backtest.fill_timing, run.backtest.gap_policy
    );

    let mut strategy = run.strategy.build();
    let model = run.backtest.cost_model();
    let mut engine = BacktestEngine::new(run.backtest.clone())?;
    let result = engine.run(&series, strategy.as_mut(), &model)?;

    println!("Backtest Results");
    println!("================\n");
    result.summary.pretty_print_table();

    if let Some(reason) = &result.abort_reason {
        println!("\nRun aborted: {}", reason.to_error());
    }
    if !result.annotations.is_empty() {
        println!("\n{} annotation(s) recorded", result.annotations.len());
    }

    if let Some(dir) = &run.output_dir {
        result.export(dir)?;
        println!("\nResults written to {:?}", dir);
    }

    Ok(())
}

async fn run_parameter_sweep(
    data: &DataArgs,
    config: BacktestConfig,
    fast: &[usize],
    slow: &[usize],
    buy_pct: f64,
    top: usize,
) -> Result<()> {
    config.validate()?;
    let (start, end) = data.range()?;
    let cache = data.source_config().build_cache().await?;
    let series = cache
        .get(&data.instrument, data.timeframe()?, start, end)
        .await?;

    let mut jobs = Vec::new();
    for &f in fast {
        for &s in slow.iter().filter(|&&s| s > f) {
            let params = StrategyParams::SmaCrossover {
                fast_window: f,
                slow_window: s,
                sizing: Sizing::CapitalFraction(buy_pct),
                close_at_end: false,
            };
            params.validate()?;
            jobs.push(SweepJob::new(params.label(), config.clone(), params.build()));
        }
    }

    println!("Running {} sweep jobs over {} bars...\n", jobs.len(), series.len());
    let outcomes = run_sweep(&series, jobs);

    let mut table = Table::new();
    table.add_row(Row::new(
        ["Params", "Return", "Max DD", "Sharpe", "Win Rate", "Buys", "Sells", "Commission"]
            .iter()
            .map(|h| Cell::new(h))
            .collect(),
    ));

    for outcome in outcomes.iter().take(top) {
        let row = match &outcome.result {
            Ok(result) => {
                let s = &result.summary;
                vec![
                    outcome.label.clone(),
                    format!("{:.2}%", s.total_return * 100.0),
                    format!("{:.2}%", s.max_drawdown * 100.0),
                    format!("{:.3}", s.sharpe_ratio),
                    format!("{:.2}%", s.win_rate * 100.0),
                    s.buy_count.to_string(),
                    s.sell_count.to_string(),
                    format!("${:.2}", s.total_commission),
                ]
            }
            Err(e) => vec![outcome.label.clone(), format!("error: {}", e)],
        };
        table.add_row(Row::new(row.iter().map(|v| Cell::new(v)).collect()));
    }

    table.printstd();
    Ok(())
}
