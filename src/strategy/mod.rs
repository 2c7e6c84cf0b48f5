// =============================================================================
// Strategy — parameters, versioned state, refiner and the refinement loop
// =============================================================================

pub mod metrics;
pub mod params;
pub mod refinement;
pub mod refiner;
pub mod state;
pub mod walk_forward;

pub use params::StrategyParameters;
pub use refiner::{DecisionContext, Refiner, RefinerDecision};
pub use state::StrategyStore;
