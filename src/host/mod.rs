mod lifecycle;

pub use lifecycle::{HostManager, StartSummary};
