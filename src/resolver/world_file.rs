use std::path::{Path, PathBuf};

use super::texture_image::local_path;
use super::{BatchBuffer, Resolution, ResolverManager, XlinkResolver};
use crate::error::Result;
use crate::models::{WorldFileXlink, XlinkKind};
use crate::storage::{Georeference, SqliteStorage};

/// World-file names that may accompany an image, in lookup order:
/// `tex.jgw`, `tex.jpgw`, `tex.wld` for `tex.jpg`.
fn candidates(image: &Path) -> Vec<PathBuf> {
    let Some(extension) = image.extension().and_then(|e| e.to_str()) else {
        return vec![image.with_extension("wld")];
    };

    let mut names = Vec::with_capacity(3);
    let mut chars = extension.chars();
    if let (Some(first), Some(last)) = (chars.next(), chars.next_back()) {
        names.push(image.with_extension(format!("{}{}w", first, last)));
    }
    names.push(image.with_extension(format!("{}w", extension)));
    names.push(image.with_extension("wld"));
    names
}

/// Six-parameter affine transform of an ESRI world file.
#[derive(Debug, Clone, Copy, PartialEq)]
struct WorldFile {
    a: f64,
    d: f64,
    b: f64,
    e: f64,
    c: f64,
    f: f64,
}

impl WorldFile {
    fn parse(content: &str) -> Option<Self> {
        let values: Vec<f64> = content
            .split_whitespace()
            .take(6)
            .map(|v| v.parse().ok())
            .collect::<Option<_>>()?;
        match values[..] {
            [a, d, b, e, c, f] => Some(Self { a, d, b, e, c, f }),
            _ => None,
        }
    }

    fn orientation(&self) -> String {
        format!("{} {} {} {}", self.a, self.b, self.d, self.e)
    }

    fn reference_point(&self) -> String {
        format!("{} {}", self.c, self.f)
    }
}

/// Georeferences textures whose placement lives in a world file next to the image.
pub struct WorldFileResolver {
    storage: SqliteStorage,
    import_dir: PathBuf,
    srid: i32,
    batch: BatchBuffer<Georeference>,
}

impl WorldFileResolver {
    pub fn new(storage: SqliteStorage, import_dir: PathBuf, srid: i32, batch_size: usize) -> Self {
        Self {
            storage,
            import_dir,
            srid,
            batch: BatchBuffer::new(batch_size),
        }
    }

    pub async fn resolve(
        &self,
        xlink: &WorldFileXlink,
        _manager: &ResolverManager,
    ) -> Result<Resolution> {
        let image = match local_path(&self.import_dir, &xlink.image_uri) {
            Ok(path) => path,
            Err(reason) => return Ok(Resolution::Skipped(reason)),
        };

        let mut content = None;
        for candidate in candidates(&image) {
            match tokio::fs::read_to_string(&candidate).await {
                Ok(text) => {
                    content = Some((candidate, text));
                    break;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Ok(Resolution::Skipped(format!(
                        "cannot read world file {}: {}",
                        candidate.display(),
                        e
                    )))
                }
            }
        }

        let Some((path, text)) = content else {
            return Ok(Resolution::Skipped(format!(
                "no world file next to {}",
                image.display()
            )));
        };
        let Some(world) = WorldFile::parse(&text) else {
            return Ok(Resolution::Skipped(format!(
                "malformed world file {}",
                path.display()
            )));
        };

        let row = Georeference {
            surface_data_id: xlink.id,
            orientation: world.orientation(),
            reference_point: world.reference_point(),
            srid: self.srid,
        };
        if self.batch.push(row).await {
            self.flush().await?;
        }
        Ok(Resolution::Resolved)
    }
}

#[async_trait::async_trait]
impl XlinkResolver for WorldFileResolver {
    fn kind(&self) -> XlinkKind {
        XlinkKind::WorldFile
    }

    async fn flush(&self) -> Result<()> {
        let rows = self.batch.take().await;
        if rows.is_empty() {
            return Ok(());
        }
        self.storage.write_georeferences(&rows).await?;
        Ok(())
    }
}
