pub mod account;
pub mod position;

pub use account::{EquitySample, FillEffect, Portfolio};
pub use position::Position;
