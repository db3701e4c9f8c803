pub mod geometry;
pub mod xlink;

pub use geometry::*;
pub use xlink::*;

/// `objectclass_id` values of the feature classes the resolvers care about.
pub mod object_class {
    pub const SURFACE_GEOMETRY: i32 = 106;
    pub const CITY_OBJECT_GROUP: i32 = 23;
    pub const BUILDING: i32 = 26;
    pub const THEMATIC_SURFACE: i32 = 33;
    pub const OPENING: i32 = 38;
    pub const X3D_MATERIAL: i32 = 53;
    pub const PARAMETERIZED_TEXTURE: i32 = 52;
    pub const GEOREFERENCED_TEXTURE: i32 = 54;
}
