//! Geometry primitives: rigid transforms, sample grids, warp fields and
//! their Jacobians. These carry no pipeline state.

pub mod grid;
pub mod jacobian;
pub mod rigid;
pub mod warp;

pub use grid::{ReferenceGrid, ReferenceOrigin, ReferenceSpace};
pub use jacobian::Jacobian;
pub use rigid::RigidTransform;
pub use warp::WarpField;
