// Scene import hook
//
// Loads an OBJ file at startup and reports what it contains. Nothing
// downstream consumes the geometry yet; the quad is still what gets drawn.

use std::path::Path;

/// Counts gathered from an imported OBJ file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SceneSummary {
    pub models: usize,
    pub vertices: usize,
    pub triangles: usize,
    pub materials: usize,
}

/// Parse `path` with tobj, triangulated and single-indexed.
pub fn load_obj(path: &Path) -> Result<SceneSummary, tobj::LoadError> {
    let options = tobj::LoadOptions {
        triangulate: true,
        single_index: true,
        ..Default::default()
    };
    let (models, materials) = tobj::load_obj(path, &options)?;

    let materials = match materials {
        Ok(materials) => materials.len(),
        Err(e) => {
            log::debug!("No materials for {}: {}", path.display(), e);
            0
        }
    };

    let mut summary = SceneSummary {
        models: models.len(),
        materials,
        ..Default::default()
    };
    for model in &models {
        summary.vertices += model.mesh.positions.len() / 3;
        summary.triangles += model.mesh.indices.len() / 3;
        log::debug!(
            "  model '{}': {} vertices, {} indices",
            model.name,
            model.mesh.positions.len() / 3,
            model.mesh.indices.len()
        );
    }
    Ok(summary)
}

/// Startup hook. A missing or broken scene is not fatal.
pub fn import_scene(path: &Path) -> Option<SceneSummary> {
    if !path.exists() {
        log::warn!("Scene file {} not found, skipping import", path.display());
        return None;
    }
    match load_obj(path) {
        Ok(summary) => {
            log::info!(
                "Imported scene {}: {} models, {} vertices, {} triangles, {} materials",
                path.display(),
                summary.models,
                summary.vertices,
                summary.triangles,
                summary.materials
            );
            Some(summary)
        }
        Err(e) => {
            log::warn!("Failed to import scene {}: {}", path.display(), e);
            None
        }
    }
}
