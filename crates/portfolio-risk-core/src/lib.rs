pub mod error;
pub mod model;
pub mod types;

#[cfg(feature = "classify")]
pub mod classify;

#[cfg(feature = "pricing")]
pub mod pricing;

#[cfg(feature = "exposure")]
pub mod exposure;

#[cfg(feature = "pnl")]
pub mod analysis;

#[cfg(feature = "pnl")]
pub mod pnl;

pub use error::PortfolioError;
pub use types::*;

/// Standard result type for all portfolio-risk operations
pub type PortfolioResult<T> = Result<T, PortfolioError>;
