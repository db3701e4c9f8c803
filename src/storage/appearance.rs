use std::time::Instant;

use super::sqlite::{Result, SqliteStorage};

/// New or replaced `textureparam` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureParamInsert {
    pub surface_geometry_id: i64,
    pub surface_data_id: i64,
    pub is_texture_parametrization: bool,
    pub world_to_texture: Option<String>,
    pub texture_coordinates: Option<String>,
}

/// Copy of an existing `textureparam` row onto another surface_data/geometry pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureParamCopy {
    pub source_surface_data_id: i64,
    pub source_geometry_id: i64,
    pub target_surface_data_id: i64,
    pub target_geometry_id: i64,
}

/// Private copy of a shared material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaterialCopy {
    pub source_id: i64,
    pub new_id: i64,
    pub appearance_id: i64,
    pub surface_geometry_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureImageData {
    pub id: i64,
    pub data: Vec<u8>,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Georeference {
    pub surface_data_id: i64,
    pub orientation: String,
    pub reference_point: String,
    pub srid: i32,
}

impl SqliteStorage {
    // === Appearance Operations ===

    pub async fn write_texture_params(&self, rows: &[TextureParamInsert]) -> Result<()> {
        let started = Instant::now();
        let mut tx = self.pool().begin().await?;

        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO textureparam
                    (surface_geometry_id, is_texture_parametrization, world_to_texture,
                     texture_coordinates, surface_data_id)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(surface_geometry_id, surface_data_id) DO UPDATE SET
                    is_texture_parametrization = excluded.is_texture_parametrization,
                    world_to_texture = excluded.world_to_texture,
                    texture_coordinates = excluded.texture_coordinates
                "#,
            )
            .bind(row.surface_geometry_id)
            .bind(row.is_texture_parametrization)
            .bind(&row.world_to_texture)
            .bind(&row.texture_coordinates)
            .bind(row.surface_data_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        self.metrics().record_query(started);
        Ok(())
    }

    /// Returns how many rows were actually copied; a missing source copies nothing.
    pub async fn copy_texture_params(&self, copies: &[TextureParamCopy]) -> Result<u64> {
        let mut tx = self.pool().begin().await?;
        let mut copied = 0u64;

        for copy in copies {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO textureparam
                    (surface_geometry_id, is_texture_parametrization, world_to_texture,
                     texture_coordinates, surface_data_id)
                SELECT ?, is_texture_parametrization, world_to_texture, texture_coordinates, ?
                FROM textureparam
                WHERE surface_data_id = ? AND surface_geometry_id = ?
                "#,
            )
            .bind(copy.target_geometry_id)
            .bind(copy.target_surface_data_id)
            .bind(copy.source_surface_data_id)
            .bind(copy.source_geometry_id)
            .execute(&mut *tx)
            .await?;
            copied += result.rows_affected();
        }

        tx.commit().await?;
        Ok(copied)
    }

    pub async fn copy_materials(&self, copies: &[MaterialCopy]) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        for copy in copies {
            sqlx::query(
                r#"
                INSERT INTO surface_data
                    (id, gmlid, objectclass_id, is_front, x3d_diffuse_color, x3d_transparency,
                     x3d_shininess, tex_image_id, tex_texture_type, gt_orientation,
                     gt_reference_point, gt_srid)
                SELECT ?, gmlid, objectclass_id, is_front, x3d_diffuse_color, x3d_transparency,
                       x3d_shininess, tex_image_id, tex_texture_type, gt_orientation,
                       gt_reference_point, gt_srid
                FROM surface_data WHERE id = ?
                "#,
            )
            .bind(copy.new_id)
            .bind(copy.source_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT OR IGNORE INTO appear_to_surface_data (surface_data_id, appearance_id)
                VALUES (?, ?)
                "#,
            )
            .bind(copy.new_id)
            .bind(copy.appearance_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT OR IGNORE INTO textureparam
                    (surface_geometry_id, is_texture_parametrization, surface_data_id)
                VALUES (?, 0, ?)
                "#,
            )
            .bind(copy.surface_geometry_id)
            .bind(copy.new_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn write_texture_images(&self, images: &[TextureImageData]) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        for image in images {
            sqlx::query("UPDATE tex_image SET tex_image_data = ?, tex_mime_type = ? WHERE id = ?")
                .bind(&image.data)
                .bind(&image.mime_type)
                .bind(image.id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn write_georeferences(&self, rows: &[Georeference]) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        for row in rows {
            sqlx::query(
                r#"
                UPDATE surface_data
                SET gt_orientation = ?, gt_reference_point = ?, gt_srid = ?
                WHERE id = ?
                "#,
            )
            .bind(&row.orientation)
            .bind(&row.reference_point)
            .bind(row.srid)
            .bind(row.surface_data_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
