pub mod payload;
pub mod tree;

pub use payload::{CodecError, PolygonPayload};
pub use tree::{GeometryNode, GeometryTree, GeometryType, TreeError};
