mod geometry;
mod gesture;
mod guides;

pub use geometry::*;
pub use gesture::*;
pub use guides::*;
