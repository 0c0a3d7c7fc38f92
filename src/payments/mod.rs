//! Payment provider abstraction: the driver contract, the Robokassa and
//! Unitpay drivers, and the registry that resolves them by name.

pub mod error;
pub mod factory;
pub mod provider;
pub mod providers;
pub mod types;
pub mod utils;

pub use error::{PaymentError, PaymentResult};
pub use factory::{PaymentFactoryConfig, PaymentProviderFactory};
pub use provider::PaymentProvider;
