//! SMART-on-FHIR EHR launch client
//!
//! Launch and callback handling with PKCE, a single-flight token lifecycle,
//! vendor adapters for Epic, Cerner and Athena, resilient FHIR reads and an
//! audited write pipeline.

pub mod auth_flow;
pub mod callback;
pub mod clock;
pub mod config;
pub mod error;
pub mod fhir;
pub mod logging;
pub mod pkce;
pub mod server;
pub mod session;
pub mod storage;
pub mod token;
pub mod vendor;
pub mod write;


pub use config::SmartConfig;
pub use error::SmartError;
pub use session::SmartSession;
pub use token::{Token, TokenLifecycleManager};
pub use vendor::{detect_vendor, Vendor, VendorAdapter, VendorContext};
