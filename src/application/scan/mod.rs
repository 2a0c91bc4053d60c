pub mod scan_coordinator;

pub use scan_coordinator::{
    ScanConfig, ScanCoordinator, ScanJob, ScanReport, ScanSummary, SymbolOutcome, SymbolResolver,
};
