pub mod ids;
pub mod lifecycle;
pub mod merge;
pub mod model;
pub mod scheduler;

pub use ids::IdAllocator;
pub use lifecycle::Path;
pub use model::{
    Direction, ImpairmentProfile, PathMode, PathRecord, PathSettings, PathStatus, PortSpec, Protocol, Selector,
    ShapingSettings,
};
pub use scheduler::ModelScheduler;
