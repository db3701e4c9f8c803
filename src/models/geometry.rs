/// One row of the recursive `surface_geometry` table.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct SurfaceGeometryRow {
    pub id: i64,
    pub gmlid: Option<String>,
    pub parent_id: Option<i64>,
    pub root_id: i64,
    pub is_solid: bool,
    pub is_composite: bool,
    pub is_triangulated: bool,
    pub is_xlink: i64,
    pub is_reverse: bool,
    pub geometry: Option<Vec<u8>>,
    pub cityobject_id: Option<i64>,
}

/// `surface_geometry.is_xlink` values.
pub mod xlink_flag {
    /// Imported from the document as-is.
    pub const ORIGINAL: i64 = 0;
    /// Deep copy produced by resolving a geometry XLink.
    pub const COPY: i64 = 1;
    /// Original that has been the target of at least one geometry XLink.
    pub const REFERENCED: i64 = 2;
}
