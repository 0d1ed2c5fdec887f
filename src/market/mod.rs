//! Market data - price sources, cache and the fallback chain

pub mod cache;
pub mod resolver;
pub mod sandbox;
pub mod source;

pub use cache::{CacheStats, PriceCache};
pub use resolver::{PriceResolver, ResolvedPrice};
pub use sandbox::SandboxPrices;
pub use source::{HttpPriceSource, SourceFailure, StaticPriceSource};
