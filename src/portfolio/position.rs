use serde::{Deserialize, Serialize};

//quantities below this are treated as flat
pub const QTY_EPSILON: f64 = 1e-12;

//represents a position in one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub instrument: String,

    //net quantity (positive for long, negative for short, 0 for flat)
    pub quantity: f64,

    //average entry price of the open quantity
    pub avg_entry_price: f64,

    //realized pnl from closed quantity, before commissions
    pub realized_pnl: f64,
}

impl Position {
    //creates a new flat position
    pub fn new(instrument: impl Into<String>) -> Self {
        Position {
            instrument: instrument.into(),
            quantity: 0.0,
            avg_entry_price: 0.0,
            realized_pnl: 0.0,
        }
    }

    //calculates unrealized pnl at a given price
    pub fn unrealized_pnl(&self, current_price: f64) -> f64 {
        if self.is_flat() {
            return 0.0;
        }
        (current_price - self.avg_entry_price) * self.quantity
    }

    pub fn is_flat(&self) -> bool {
        self.quantity.abs() < QTY_EPSILON
    }

    pub fn is_long(&self) -> bool {
        self.quantity >= QTY_EPSILON
    }

    pub fn is_short(&self) -> bool {
        self.quantity <= -QTY_EPSILON
    }

    //updates position with a signed fill quantity
    //returns the realized pnl and the quantity closed by this fill
    pub fn update_with_fill(&mut self, fill_qty: f64, fill_price: f64) -> (f64, f64) {
        //flat: just establish the new position
        if self.is_flat() {
            self.quantity = fill_qty;
            self.avg_entry_price = fill_price;
            return (0.0, 0.0);
        }

        let same_direction = self.quantity.signum() == fill_qty.signum();

        if same_direction {
            //adding to position - update average entry price
            let total_qty = self.quantity + fill_qty;
            let total_cost = self.avg_entry_price * self.quantity + fill_price * fill_qty;
            self.avg_entry_price = total_cost / total_qty;
            self.quantity = total_qty;
            return (0.0, 0.0);
        }

        //reducing or reversing
        let close_qty = fill_qty.abs().min(self.quantity.abs());
        let price_diff = if self.quantity > 0.0 {
            fill_price - self.avg_entry_price
        } else {
            self.avg_entry_price - fill_price
        };

        let realized = price_diff * close_qty;
        self.realized_pnl += realized;

        let remaining = self.quantity + fill_qty;
        if remaining.abs() < QTY_EPSILON {
            self.quantity = 0.0;
            self.avg_entry_price = 0.0;
        } else {
            //reversed: the leftover opens at the fill price
            if remaining.signum() == fill_qty.signum() {
                self.avg_entry_price = fill_price;
            }
            self.quantity = remaining;
        }

        (realized, close_qty)
    }

    //returns the signed market value of the position
    pub fn market_value(&self, current_price: f64) -> f64 {
        self.quantity * current_price
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_entry_on_add() {
        let mut p = Position::new("BTC/USDT");
        p.update_with_fill(1.0, 100.0);
        p.update_with_fill(1.0, 110.0);
        assert!(p.is_long());
        assert!((p.avg_entry_price - 105.0).abs() < 1e-9);
        assert!((p.unrealized_pnl(115.0) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_partial_close_and_reverse() {
        let mut p = Position::new("BTC/USDT");
        p.update_with_fill(2.0, 100.0);

        let (pnl, closed) = p.update_with_fill(-1.0, 104.0);
        assert!((pnl - 4.0).abs() < 1e-9);
        assert_eq!(closed, 1.0);
        assert_eq!(p.avg_entry_price, 100.0);

        let (pnl, closed) = p.update_with_fill(-3.0, 90.0);
        assert!((pnl + 10.0).abs() < 1e-9);
        assert_eq!(closed, 1.0);
        assert!(p.is_short());
        assert_eq!(p.avg_entry_price, 90.0);
        assert!((p.realized_pnl + 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_close_to_flat() {
        let mut p = Position::new("BTC/USDT");
        p.update_with_fill(-0.5, 200.0);
        let (pnl, _) = p.update_with_fill(0.5, 180.0);
        assert!((pnl - 10.0).abs() < 1e-9);
        assert!(p.is_flat());
        assert_eq!(p.avg_entry_price, 0.0);
    }
}
