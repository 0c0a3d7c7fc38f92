pub mod robokassa;
pub mod unitpay;

pub use robokassa::{RobokassaConfig, RobokassaProvider};
pub use unitpay::{UnitpayConfig, UnitpayProvider};
