//! Scan orchestration: the service that fans per-symbol work across a
//! bounded pool, and the strategy rules it evaluates.

mod service;
mod strategy;

pub use service::{
    BulkFetchRequest, BulkFetchResponse, DateRange, ScanError, ScanRequest, ScanResponse,
    ScannerService,
};
pub use strategy::{Signal, Strategy};
