//! Business logic: pricing and payment orchestration

pub mod payments;
pub mod pricing;

pub use payments::{
    PageResult, PaymentsError, PaymentsService, PurchaseReceipt, PurchaseRequest,
    ReconcileOutcome, TransactionView,
};
pub use pricing::{PricingError, PricingService, Product, Quote};
