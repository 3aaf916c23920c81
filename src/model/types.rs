use std::{fmt, str::FromStr};

use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    ShapeText,
    ShapeImage,
    Texture,
}

impl PipelineKind {
    pub const ALL: [PipelineKind; 3] = [
        PipelineKind::ShapeText,
        PipelineKind::ShapeImage,
        PipelineKind::Texture,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineKind::ShapeText => "shape_text",
            PipelineKind::ShapeImage => "shape_image",
            PipelineKind::Texture => "texture",
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineKind {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PipelineKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ServiceError::Other(format!("unknown pipeline kind: {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeDevice {
    Cpu,
    Cuda(usize),
}

impl ComputeDevice {
    pub fn is_accelerated(self) -> bool {
        matches!(self, ComputeDevice::Cuda(_))
    }

    /// Half precision on accelerated hardware, full precision otherwise.
    pub fn precision(self) -> Precision {
        if self.is_accelerated() {
            Precision::Half
        } else {
            Precision::Full
        }
    }
}

impl fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeDevice::Cpu => f.write_str("cpu"),
            ComputeDevice::Cuda(idx) => write!(f, "cuda:{idx}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Half,
    Full,
}

#[derive(Debug, Deserialize)]
pub struct PromptRequest {
    pub prompt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeOutput {
    Mesh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShapeParams {
    pub num_inference_steps: i64,
    pub frame_size: i64,
    pub output: ShapeOutput,
}

impl Default for ShapeParams {
    fn default() -> Self {
        Self {
            num_inference_steps: 64,
            frame_size: 256,
            output: ShapeOutput::Mesh,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TextureParams {
    pub num_inference_steps: i64,
}

impl Default for TextureParams {
    fn default() -> Self {
        Self {
            num_inference_steps: 25,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ShapeInput {
    Prompt(String),
    Image(RgbImage),
}

pub trait MeshLike {
    fn vertices(&self) -> Option<&[[f32; 3]]>;
    fn faces(&self) -> Option<&[[u32; 3]]>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeneratedMesh {
    pub vertices: Option<Vec<[f32; 3]>>,
    pub faces: Option<Vec<[u32; 3]>>,
}

impl GeneratedMesh {
    pub fn new(vertices: Vec<[f32; 3]>, faces: Vec<[u32; 3]>) -> Self {
        Self {
            vertices: Some(vertices),
            faces: Some(faces),
        }
    }
}

impl MeshLike for GeneratedMesh {
    fn vertices(&self) -> Option<&[[f32; 3]]> {
        self.vertices.as_deref()
    }

    fn faces(&self) -> Option<&[[u32; 3]]> {
        self.faces.as_deref()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub gpu: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub device: String,
    pub precision: Precision,
    pub gpu: bool,
    pub loaded: Vec<PipelineKind>,
}
