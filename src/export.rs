//! Binary glTF (GLB) export for generated meshes.

use std::{
    borrow::Cow,
    collections::BTreeMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use gltf::json::{
    self,
    validation::{Checked::Valid, USize64},
};
use tracing::{error, info};

use crate::{error::ServiceError, model::MeshLike};

#[derive(Debug, Clone, PartialEq)]
pub struct TriangleMesh {
    positions: Vec<[f32; 3]>,
    triangles: Vec<[u32; 3]>,
}

impl TriangleMesh {
    pub fn new(positions: Vec<[f32; 3]>, triangles: Vec<[u32; 3]>) -> Result<Self, ServiceError> {
        if positions.is_empty() || triangles.is_empty() {
            return Err(ServiceError::Export(format!(
                "mesh is empty ({} vertices, {} faces)",
                positions.len(),
                triangles.len()
            )));
        }
        let vertex_count = positions.len();
        if let Some(index) = triangles
            .iter()
            .flatten()
            .find(|&&index| index as usize >= vertex_count)
        {
            return Err(ServiceError::Export(format!(
                "face index {index} out of range for {vertex_count} vertices"
            )));
        }
        Ok(Self {
            positions,
            triangles,
        })
    }

    pub fn from_mesh_like(mesh: &dyn MeshLike) -> Result<Self, ServiceError> {
        match (mesh.vertices(), mesh.faces()) {
            (Some(vertices), Some(faces)) => Self::new(vertices.to_vec(), faces.to_vec()),
            (None, _) => Err(ServiceError::UnsupportedMeshFormat(
                "mesh has no vertex array".into(),
            )),
            (_, None) => Err(ServiceError::UnsupportedMeshFormat(
                "mesh has no face array".into(),
            )),
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn face_count(&self) -> usize {
        self.triangles.len()
    }

    fn bounds(&self) -> ([f32; 3], [f32; 3]) {
        let mut min = [f32::INFINITY; 3];
        let mut max = [f32::NEG_INFINITY; 3];
        for position in &self.positions {
            for axis in 0..3 {
                min[axis] = min[axis].min(position[axis]);
                max[axis] = max[axis].max(position[axis]);
            }
        }
        (min, max)
    }

    fn buffer_bytes(&self) -> Result<(Vec<u8>, usize), ServiceError> {
        let mut bin = Vec::with_capacity(self.positions.len() * 12 + self.triangles.len() * 12);
        for position in &self.positions {
            if position.iter().any(|c| !c.is_finite()) {
                return Err(ServiceError::Export("mesh has non-finite vertex".into()));
            }
            for component in position {
                bin.extend_from_slice(&component.to_le_bytes());
            }
        }
        let positions_len = bin.len();
        for index in self.triangles.iter().flatten() {
            bin.extend_from_slice(&index.to_le_bytes());
        }
        Ok((bin, positions_len))
    }

    fn document(&self, buffer_len: usize, positions_len: usize) -> json::Root {
        let mut root = json::Root::default();

        let buffer = root.push(json::Buffer {
            byte_length: USize64::from(buffer_len),
            extensions: Default::default(),
            extras: Default::default(),
            name: None,
            uri: None,
        });
        let positions_view = root.push(json::buffer::View {
            buffer,
            byte_length: USize64::from(positions_len),
            byte_offset: Some(USize64(0)),
            byte_stride: None,
            extensions: Default::default(),
            extras: Default::default(),
            name: None,
            target: Some(Valid(json::buffer::Target::ArrayBuffer)),
        });
        let indices_view = root.push(json::buffer::View {
            buffer,
            byte_length: USize64::from(buffer_len - positions_len),
            byte_offset: Some(USize64::from(positions_len)),
            byte_stride: None,
            extensions: Default::default(),
            extras: Default::default(),
            name: None,
            target: Some(Valid(json::buffer::Target::ElementArrayBuffer)),
        });

        let (min, max) = self.bounds();
        let positions = root.push(json::Accessor {
            buffer_view: Some(positions_view),
            byte_offset: Some(USize64(0)),
            count: USize64::from(self.positions.len()),
            component_type: Valid(json::accessor::GenericComponentType(
                json::accessor::ComponentType::F32,
            )),
            extensions: Default::default(),
            extras: Default::default(),
            type_: Valid(json::accessor::Type::Vec3),
            min: Some(json::Value::from(min.to_vec())),
            max: Some(json::Value::from(max.to_vec())),
            name: None,
            normalized: false,
            sparse: None,
        });
        let indices = root.push(json::Accessor {
            buffer_view: Some(indices_view),
            byte_offset: Some(USize64(0)),
            count: USize64::from(self.triangles.len() * 3),
            component_type: Valid(json::accessor::GenericComponentType(
                json::accessor::ComponentType::U32,
            )),
            extensions: Default::default(),
            extras: Default::default(),
            type_: Valid(json::accessor::Type::Scalar),
            min: None,
            max: None,
            name: None,
            normalized: false,
            sparse: None,
        });

        let primitive = json::mesh::Primitive {
            attributes: BTreeMap::from([(Valid(json::mesh::Semantic::Positions), positions)]),
            extensions: Default::default(),
            extras: Default::default(),
            indices: Some(indices),
            material: None,
            mode: Valid(json::mesh::Mode::Triangles),
            targets: None,
        };
        let mesh = root.push(json::Mesh {
            extensions: Default::default(),
            extras: Default::default(),
            name: None,
            primitives: vec![primitive],
            weights: None,
        });
        let node = root.push(json::Node {
            mesh: Some(mesh),
            ..Default::default()
        });
        let scene = root.push(json::Scene {
            extensions: Default::default(),
            extras: Default::default(),
            name: None,
            nodes: vec![node],
        });
        root.scene = Some(scene);
        root.asset.generator = Some(env!("CARGO_PKG_NAME").to_string());
        root
    }

    /// Serializes the mesh as a single-scene GLB.
    pub fn to_glb(&self) -> Result<Vec<u8>, ServiceError> {
        let (bin, positions_len) = self.buffer_bytes()?;
        let document = self.document(bin.len(), positions_len);
        let json_chunk = serde_json::to_vec(&document)
            .map_err(|e| ServiceError::Export(format!("failed to encode glTF JSON: {e}")))?;

        // Header, two chunk headers, JSON padded to four bytes; bin is already aligned.
        let total_len = 12 + 8 + json_chunk.len().next_multiple_of(4) + 8 + bin.len();
        let length = u32::try_from(total_len)
            .map_err(|_| ServiceError::Export(format!("GLB too large: {total_len} bytes")))?;

        gltf::binary::Glb {
            header: gltf::binary::Header {
                magic: *b"glTF",
                version: 2,
                length,
            },
            json: Cow::Owned(json_chunk),
            bin: Some(Cow::Owned(bin)),
        }
        .to_vec()
        .map_err(|e| ServiceError::Export(format!("failed to write GLB: {e}")))
    }
}

/// Nothing is left at `path` unless the whole file was written.
pub fn export_glb(mesh: &dyn MeshLike, path: &Path) -> Result<(), ServiceError> {
    let result = TriangleMesh::from_mesh_like(mesh).and_then(|triangle_mesh| {
        let bytes = triangle_mesh.to_glb()?;
        write_atomically(path, &bytes)?;
        Ok(triangle_mesh)
    });

    match result {
        Ok(triangle_mesh) => {
            info!(
                path = %path.display(),
                vertices = triangle_mesh.vertex_count(),
                faces = triangle_mesh.face_count(),
                "exported mesh"
            );
            Ok(())
        }
        Err(err) => {
            error!(path = %path.display(), error = %err, "export failed");
            Err(err)
        }
    }
}

pub(crate) fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), ServiceError> {
    let tmp = partial_path(path);
    let written = fs::File::create(&tmp).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    if let Err(err) = written.and_then(|_| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    Ok(())
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}
