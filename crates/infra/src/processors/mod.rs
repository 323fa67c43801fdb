//! Processors for the CRM's built-in job types.
//!
//! Each processor owns payload validation for its types and delegates the
//! external work to a trait object, so the HTTP clients can be swapped for
//! fakes in tests.

pub mod duplicate_detection;
pub mod enrichment;
pub mod http;

pub use duplicate_detection::{
    DEFAULT_THRESHOLD, DUPLICATE_SCAN, DuplicateDetectionProcessor, DuplicateGroup, DuplicateScanRequest,
    DuplicateScanner,
};
pub use enrichment::{
    ENRICH_ACCOUNT, ENRICH_CONTACT, EnrichmentProcessor, EnrichmentProvider, EnrichmentRequest, EntityKind,
};
pub use http::{HttpDuplicateScanner, HttpEnrichmentProvider};
