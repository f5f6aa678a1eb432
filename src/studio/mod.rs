//! Photography-domain pieces shared by the pipeline stages.

pub mod placement;
pub mod prompts;
pub mod style;

pub use placement::PlacementHint;
pub use style::StyleDescription;
