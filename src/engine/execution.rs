use crate::data::Bar;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

//order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    //converts to quantity sign (Buy = +1, Sell = -1)
    pub fn sign(&self) -> f64 {
        match self {
            OrderSide::Buy => 1.0,
            OrderSide::Sell => -1.0,
        }
    }
}

//order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    Market,
    Limit,
}

//when market orders execute relative to the bar that produced them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FillTiming {
    //at the signal bar's close
    #[default]
    SameClose,
    //at the following bar's open, avoiding same-bar-close lookahead
    NextOpen,
}

//represents a trading order; consumed exactly once by the execution model
//id and bar_index are stamped by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub instrument: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub kind: OrderKind,
    pub limit_price: Option<f64>,
    pub bar_index: usize,
}

impl Order {
    //creates a new market order
    pub fn market(instrument: impl Into<String>, side: OrderSide, quantity: f64) -> Self {
        Order {
            id: 0,
            instrument: instrument.into(),
            side,
            quantity,
            kind: OrderKind::Market,
            limit_price: None,
            bar_index: 0,
        }
    }

    //creates a new limit order
    pub fn limit(
        instrument: impl Into<String>,
        side: OrderSide,
        quantity: f64,
        limit_price: f64,
    ) -> Self {
        Order {
            kind: OrderKind::Limit,
            limit_price: Some(limit_price),
            ..Order::market(instrument, side, quantity)
        }
    }

    //returns the signed quantity (positive for buy, negative for sell)
    pub fn signed_quantity(&self) -> f64 {
        self.quantity * self.side.sign()
    }
}

//represents a filled order, immutable once created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: u64,
    pub bar_index: usize,
    pub timestamp: DateTime<Utc>,
    pub instrument: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub price: f64,
    pub commission: f64,
    //price deviation per unit from the reference price
    pub slippage: f64,
}

impl Fill {
    pub fn signed_quantity(&self) -> f64 {
        self.quantity * self.side.sign()
    }

    //returns the notional value of the fill
    pub fn notional_value(&self) -> f64 {
        self.price * self.quantity
    }
}

//commission charged per fill: fixed amount plus a fraction of notional
//sells use sell_proportional when set (eg taker 0.001 on buys, maker 0.0008 on sells)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommissionConfig {
    pub fixed: f64,
    pub proportional: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sell_proportional: Option<f64>,
}

impl CommissionConfig {
    //same schedule for both sides
    pub fn flat(fixed: f64, proportional: f64) -> Self {
        CommissionConfig {
            fixed,
            proportional,
            sell_proportional: None,
        }
    }

    pub fn rate(&self, side: OrderSide) -> f64 {
        match side {
            OrderSide::Buy => self.proportional,
            OrderSide::Sell => self.sell_proportional.unwrap_or(self.proportional),
        }
    }

    pub fn charge(&self, side: OrderSide, notional: f64) -> f64 {
        self.fixed + notional * self.rate(side)
    }
}

//adverse price adjustment: fixed price offset plus a fraction of the reference price
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SlippageConfig {
    pub fixed: f64,
    pub proportional: f64,
}

//turns an order into a fill against one bar
//must be a pure function of (order, bar, timing, own configuration)
pub trait ExecutionModel: Send + Sync {
    fn name(&self) -> &str;

    //ok(none) when the order cannot execute on this bar (eg limit never touched)
    fn fill(&self, order: &Order, bar: &Bar, timing: FillTiming) -> anyhow::Result<Option<Fill>>;
}

//fixed/proportional cost model
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CostModel {
    pub commission: CommissionConfig,
    pub slippage: SlippageConfig,
}

impl CostModel {
    pub fn new(commission: CommissionConfig, slippage: SlippageConfig) -> Self {
        CostModel {
            commission,
            slippage,
        }
    }

    //price the order would trade at before slippage, or none if it does not trade
    fn base_price(&self, order: &Order, bar: &Bar, timing: FillTiming) -> anyhow::Result<Option<f64>> {
        let reference = match timing {
            FillTiming::SameClose => bar.close,
            FillTiming::NextOpen => bar.open,
        };

        let limit = match order.kind {
            OrderKind::Market => return Ok(Some(reference)),
            OrderKind::Limit => order
                .limit_price
                .filter(|p| p.is_finite() && *p > 0.0)
                .ok_or_else(|| anyhow::anyhow!("limit order {} has no valid limit price", order.id))?,
        };

        //at the close only the close itself is known; from the open the rest of the bar is still ahead
        let price = match (order.side, timing) {
            (OrderSide::Buy, _) if reference <= limit => Some(reference),
            (OrderSide::Buy, FillTiming::NextOpen) if bar.low <= limit => Some(limit),
            (OrderSide::Sell, _) if reference >= limit => Some(reference),
            (OrderSide::Sell, FillTiming::NextOpen) if bar.high >= limit => Some(limit),
            _ => None,
        };

        Ok(price)
    }
}

impl ExecutionModel for CostModel {
    fn name(&self) -> &str {
        "cost-model"
    }

    fn fill(&self, order: &Order, bar: &Bar, timing: FillTiming) -> anyhow::Result<Option<Fill>> {
        if !order.quantity.is_finite() || order.quantity <= 0.0 {
            anyhow::bail!("order {} has invalid quantity {}", order.id, order.quantity);
        }

        let base = match self.base_price(order, bar, timing)? {
            Some(price) => price,
            None => return Ok(None),
        };

        let offset = self.slippage.fixed + base * self.slippage.proportional;
        let mut price = base + offset * order.side.sign();

        //slippage never pushes a limit order through its limit
        if let Some(limit) = order.limit_price {
            price = match order.side {
                OrderSide::Buy => price.min(limit),
                OrderSide::Sell => price.max(limit),
            };
        }

        if !price.is_finite() || price <= 0.0 {
            anyhow::bail!("order {} would fill at non-positive price {}", order.id, price);
        }

        let commission = self.commission.charge(order.side, price * order.quantity);

        Ok(Some(Fill {
            order_id: order.id,
            bar_index: order.bar_index,
            timestamp: bar.timestamp,
            instrument: order.instrument.clone(),
            side: order.side,
            quantity: order.quantity,
            price,
            commission,
            slippage: (price - base).abs(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bar() -> Bar {
        Bar::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap(),
            100.0,
            110.0,
            90.0,
            105.0,
            1000.0,
        )
        .unwrap()
    }

    fn order(side: OrderSide) -> Order {
        let mut order = Order::market("BTC/USDT", side, 2.0);
        order.id = 7;
        order.bar_index = 3;
        order
    }

    #[test]
    fn test_market_fill_without_costs() {
        let model = CostModel::default();
        let fill = model
            .fill(&order(OrderSide::Buy), &bar(), FillTiming::SameClose)
            .unwrap()
            .unwrap();
        assert_eq!(fill.price, 105.0);
        assert_eq!(fill.commission, 0.0);
        assert_eq!(fill.order_id, 7);
        assert_eq!(fill.bar_index, 3);

        let fill = model
            .fill(&order(OrderSide::Sell), &bar(), FillTiming::NextOpen)
            .unwrap()
            .unwrap();
        assert_eq!(fill.price, 100.0);
    }

    #[test]
    fn test_costs_are_adverse() {
        let model = CostModel::new(
            CommissionConfig::flat(1.0, 0.001),
            SlippageConfig {
                fixed: 0.5,
                proportional: 0.01,
            },
        );

        let buy = model
            .fill(&order(OrderSide::Buy), &bar(), FillTiming::NextOpen)
            .unwrap()
            .unwrap();
        assert!((buy.price - 101.5).abs() < 1e-9);
        assert!((buy.slippage - 1.5).abs() < 1e-9);
        assert!((buy.commission - (1.0 + 101.5 * 2.0 * 0.001)).abs() < 1e-9);

        let sell = model
            .fill(&order(OrderSide::Sell), &bar(), FillTiming::NextOpen)
            .unwrap()
            .unwrap();
        assert!((sell.price - 98.5).abs() < 1e-9);
    }

    #[test]
    fn test_limit_orders() {
        let model = CostModel::default();
        let mut buy = Order::limit("BTC/USDT", OrderSide::Buy, 1.0, 95.0);
        buy.id = 1;

        //close 105 above the limit: no fill at the close
        assert!(model.fill(&buy, &bar(), FillTiming::SameClose).unwrap().is_none());

        //low 90 touched the limit after a 100 open
        let fill = model.fill(&buy, &bar(), FillTiming::NextOpen).unwrap().unwrap();
        assert_eq!(fill.price, 95.0);

        let mut sell = Order::limit("BTC/USDT", OrderSide::Sell, 1.0, 120.0);
        sell.id = 2;
        assert!(model.fill(&sell, &bar(), FillTiming::NextOpen).unwrap().is_none());

        let marketable = Order::limit("BTC/USDT", OrderSide::Sell, 1.0, 95.0);
        let fill = model
            .fill(&marketable, &bar(), FillTiming::SameClose)
            .unwrap()
            .unwrap();
        assert_eq!(fill.price, 105.0);
    }

    #[test]
    fn test_slippage_capped_at_limit() {
        let model = CostModel::new(
            CommissionConfig::default(),
            SlippageConfig {
                fixed: 10.0,
                proportional: 0.0,
            },
        );
        let buy = Order::limit("BTC/USDT", OrderSide::Buy, 1.0, 106.0);
        let fill = model.fill(&buy, &bar(), FillTiming::SameClose).unwrap().unwrap();
        assert_eq!(fill.price, 106.0);
    }

    #[test]
    fn test_invalid_orders_fail() {
        let model = CostModel::default();
        let zero = Order::market("BTC/USDT", OrderSide::Buy, 0.0);
        assert!(model.fill(&zero, &bar(), FillTiming::SameClose).is_err());

        let mut no_price = Order::limit("BTC/USDT", OrderSide::Buy, 1.0, 1.0);
        no_price.limit_price = None;
        assert!(model.fill(&no_price, &bar(), FillTiming::SameClose).is_err());
    }

    #[test]
    fn test_sell_side_commission_rate() {
        let commission = CommissionConfig {
            sell_proportional: Some(0.0008),
            ..CommissionConfig::flat(0.0, 0.001)
        };
        let model = CostModel::new(commission, SlippageConfig::default());

        let buy = model
            .fill(&order(OrderSide::Buy), &bar(), FillTiming::SameClose)
            .unwrap()
            .unwrap();
        assert!((buy.commission - 105.0 * 2.0 * 0.001).abs() < 1e-12);

        let sell = model
            .fill(&order(OrderSide::Sell), &bar(), FillTiming::SameClose)
            .unwrap()
            .unwrap();
        assert!((sell.commission - 105.0 * 2.0 * 0.0008).abs() < 1e-12);

        let json = serde_json::to_string(&commission).unwrap();
        assert_eq!(json, r#"{"fixed":0.0,"proportional":0.001,"sellProportional":0.0008}"#);
        let flat: CommissionConfig = serde_json::from_str(r#"{"fixed":1.0,"proportional":0.002}"#).unwrap();
        assert_eq!(flat, CommissionConfig::flat(1.0, 0.002));
    }
}
