pub mod appearance;
pub mod sqlite;
pub mod staging;

pub use appearance::{
    Georeference, MaterialCopy, TextureImageData, TextureParamCopy, TextureParamInsert,
};
pub use sqlite::{
    check_identifier, BasicWrite, CacheRow, GroupWrite, QueryMetrics, Sequence, SqliteStorage,
    StorageError, SurfaceGeometryInsert,
};
