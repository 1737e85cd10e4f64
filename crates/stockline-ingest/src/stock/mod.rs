//! Stock levels and the append-only stock event log

pub mod engine;
pub mod types;

pub use engine::{parse_stock_events, ParsedStockEvents, StockUpdateEngine};
pub use types::{
    AppliedProduct, InvalidStockEvent, NegativeStockPolicy, ProductConflict, StockEventInput,
    StockEventRecord, StockSource, StockUpdateOutcome,
};
