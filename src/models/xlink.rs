use serde::{Deserialize, Serialize};

/// Kind of deferred cross-reference; one staging table and one resolver per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum XlinkKind {
    Basic,
    Group,
    SurfaceGeometry,
    TextureParam,
    TextureCoordList,
    TextureAssociation,
    DeprecatedMaterial,
    TextureImage,
    WorldFile,
}

impl XlinkKind {
    pub const ALL: [XlinkKind; 9] = [
        XlinkKind::Basic,
        XlinkKind::Group,
        XlinkKind::SurfaceGeometry,
        XlinkKind::TextureParam,
        XlinkKind::TextureCoordList,
        XlinkKind::TextureAssociation,
        XlinkKind::DeprecatedMaterial,
        XlinkKind::TextureImage,
        XlinkKind::WorldFile,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            XlinkKind::Basic => "basic",
            XlinkKind::Group => "group",
            XlinkKind::SurfaceGeometry => "surface_geometry",
            XlinkKind::TextureParam => "texture_param",
            XlinkKind::TextureCoordList => "texture_coord_list",
            XlinkKind::TextureAssociation => "texture_association",
            XlinkKind::DeprecatedMaterial => "deprecated_material",
            XlinkKind::TextureImage => "texture_image",
            XlinkKind::WorldFile => "world_file",
        }
    }

    /// Staging table holding pending rows of this kind.
    pub fn staging_table(&self) -> &'static str {
        match self {
            XlinkKind::Basic => "tmp_basic",
            XlinkKind::Group => "tmp_group_to_cityobject",
            XlinkKind::SurfaceGeometry => "tmp_surface_geometry",
            XlinkKind::TextureParam => "tmp_texture_param",
            XlinkKind::TextureCoordList => "tmp_texture_coord_list",
            XlinkKind::TextureAssociation => "tmp_texture_association",
            XlinkKind::DeprecatedMaterial => "tmp_deprecated_material",
            XlinkKind::TextureImage => "tmp_texture_image",
            XlinkKind::WorldFile => "tmp_world_file",
        }
    }

    /// Kinds whose resolution may produce further pending rows of the same kind.
    pub fn is_recursive(&self) -> bool {
        matches!(self, XlinkKind::Group | XlinkKind::SurfaceGeometry)
    }
}

impl std::fmt::Display for XlinkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plain foreign key: either a join-table row or a column update on `from_table`.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct BasicXlink {
    pub id: i64,
    pub from_table: String,
    pub to_table: String,
    pub attr_name: Option<String>,
    pub gmlid: String,
    pub pass: i64,
}

/// CityObjectGroup membership (`is_parent = false`) or parent pointer.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct GroupXlink {
    pub group_id: i64,
    pub gmlid: String,
    pub is_parent: bool,
    pub role: Option<String>,
    pub pass: i64,
}

/// Geometry reference: the referenced subtree is deep-copied under `parent_id`.
///
/// `id` is pre-allocated by the forward pass and becomes the id of the copied
/// subtree's root. `parent_id == 0` means the copy is itself a root.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct SurfaceGeometryXlink {
    pub id: i64,
    pub parent_id: i64,
    pub root_id: i64,
    pub reverse: bool,
    pub gmlid: String,
    pub cityobject_id: Option<i64>,
    pub pass: i64,
}

/// Texture parameterization targeting a geometry by gml:id.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct TextureParamXlink {
    /// surface_data id
    pub id: i64,
    pub gmlid: String,
    pub is_texture_parametrization: bool,
    pub world_to_texture: Option<String>,
    pub texture_coordinates: Option<String>,
    pub pass: i64,
}

/// Texture coordinates of one ring; rings of the same polygon are merged.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct TextureCoordListXlink {
    /// surface_data id
    pub id: i64,
    /// gml:id of the ring
    pub gmlid: String,
    pub ring_no: i64,
    pub texture_coordinates: String,
    pub pass: i64,
}

/// `<app:target uri=…>` pointing at a texture parameterization declared elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct TextureAssociationXlink {
    /// surface_data id of the referencing texture
    pub id: i64,
    /// gml:id of the geometry the association applies to
    pub gmlid: String,
    /// gml:id of the referenced parameterization
    pub uri: String,
    pub pass: i64,
}

/// CityGML 0.4 material reference that is materialised as a private copy.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct DeprecatedMaterialXlink {
    /// appearance id the copy is attached to
    pub id: i64,
    pub gmlid: String,
    pub surface_geometry_id: i64,
    pub pass: i64,
}

/// Texture image file to be loaded into `tex_image`.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct TextureImageXlink {
    /// tex_image id
    pub id: i64,
    pub file_uri: String,
    pub pass: i64,
}

/// Georeferenced texture whose placement lives in a world file next to the image.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct WorldFileXlink {
    /// surface_data id
    pub id: i64,
    pub image_uri: String,
    pub pass: i64,
}

/// One staging row, typed by kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingReference {
    Basic(BasicXlink),
    Group(GroupXlink),
    SurfaceGeometry(SurfaceGeometryXlink),
    TextureParam(TextureParamXlink),
    TextureCoordList(TextureCoordListXlink),
    TextureAssociation(TextureAssociationXlink),
    DeprecatedMaterial(DeprecatedMaterialXlink),
    TextureImage(TextureImageXlink),
    WorldFile(WorldFileXlink),
}

impl PendingReference {
    pub fn kind(&self) -> XlinkKind {
        match self {
            PendingReference::Basic(_) => XlinkKind::Basic,
            PendingReference::Group(_) => XlinkKind::Group,
            PendingReference::SurfaceGeometry(_) => XlinkKind::SurfaceGeometry,
            PendingReference::TextureParam(_) => XlinkKind::TextureParam,
            PendingReference::TextureCoordList(_) => XlinkKind::TextureCoordList,
            PendingReference::TextureAssociation(_) => XlinkKind::TextureAssociation,
            PendingReference::DeprecatedMaterial(_) => XlinkKind::DeprecatedMaterial,
            PendingReference::TextureImage(_) => XlinkKind::TextureImage,
            PendingReference::WorldFile(_) => XlinkKind::WorldFile,
        }
    }

    /// The symbolic reference (gml:id, URI or file name) this row waits for.
    pub fn reference(&self) -> &str {
        match self {
            PendingReference::Basic(x) => &x.gmlid,
            PendingReference::Group(x) => &x.gmlid,
            PendingReference::SurfaceGeometry(x) => &x.gmlid,
            PendingReference::TextureParam(x) => &x.gmlid,
            PendingReference::TextureCoordList(x) => &x.gmlid,
            PendingReference::TextureAssociation(x) => &x.uri,
            PendingReference::DeprecatedMaterial(x) => &x.gmlid,
            PendingReference::TextureImage(x) => &x.file_uri,
            PendingReference::WorldFile(x) => &x.image_uri,
        }
    }

    pub fn pass(&self) -> i64 {
        match self {
            PendingReference::Basic(x) => x.pass,
            PendingReference::Group(x) => x.pass,
            PendingReference::SurfaceGeometry(x) => x.pass,
            PendingReference::TextureParam(x) => x.pass,
            PendingReference::TextureCoordList(x) => x.pass,
            PendingReference::TextureAssociation(x) => x.pass,
            PendingReference::DeprecatedMaterial(x) => x.pass,
            PendingReference::TextureImage(x) => x.pass,
            PendingReference::WorldFile(x) => x.pass,
        }
    }

    /// Same row, scheduled for the following fixpoint pass.
    pub fn into_next_pass(mut self) -> Self {
        let pass = match &mut self {
            PendingReference::Basic(x) => &mut x.pass,
            PendingReference::Group(x) => &mut x.pass,
            PendingReference::SurfaceGeometry(x) => &mut x.pass,
            PendingReference::TextureParam(x) => &mut x.pass,
            PendingReference::TextureCoordList(x) => &mut x.pass,
            PendingReference::TextureAssociation(x) => &mut x.pass,
            PendingReference::DeprecatedMaterial(x) => &mut x.pass,
            PendingReference::TextureImage(x) => &mut x.pass,
            PendingReference::WorldFile(x) => &mut x.pass,
        };
        *pass += 1;
        self
    }
}
