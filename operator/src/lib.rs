pub use common::{Error, Result};

pub mod bundle;
pub mod instances;
pub mod manager;
pub mod metrics;
pub mod policy;
pub mod reconciler;
pub mod telemetry;
pub mod watches;

pub use bundle::Bundle;
pub use manager::{Context, Manager, ManagerOptions};
pub use metrics::Metrics;
