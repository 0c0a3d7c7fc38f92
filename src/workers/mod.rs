pub mod status_reconciler;
