use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use image::RgbImage;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tch::{Device, IValue, Kind, Tensor, no_grad};
use tokenizers::Tokenizer;
use tracing::{debug, warn};

use crate::{
    config::{AppConfig, DevicePreference},
    error::ServiceError,
    model::{
        ComputeDevice, GeneratedMesh, PipelineKind, Precision, ShapeInput, ShapeParams,
        TextureParams,
        pipeline::{PipelineLoader, ShapePipeline, TexturePipeline},
    },
};

/// CLIP text encoders see a fixed window of 77 token ids.
const CLIP_CONTEXT_LENGTH: usize = 77;
const CLIP_END_OF_TEXT: u32 = 49407;

/// Picks the fastest device allowed by `preference`.
pub fn select_device(preference: DevicePreference) -> ComputeDevice {
    let cuda = tch::Cuda::is_available();
    match preference {
        DevicePreference::Cpu => ComputeDevice::Cpu,
        DevicePreference::Auto if cuda => ComputeDevice::Cuda(0),
        DevicePreference::Auto => ComputeDevice::Cpu,
        DevicePreference::Cuda(idx) if cuda && (idx as i64) < tch::Cuda::device_count() => {
            ComputeDevice::Cuda(idx)
        }
        DevicePreference::Cuda(idx) => {
            warn!(idx, "requested CUDA device is not available, falling back to cpu");
            ComputeDevice::Cpu
        }
    }
}

fn torch_device(device: ComputeDevice) -> Device {
    match device {
        ComputeDevice::Cpu => Device::Cpu,
        ComputeDevice::Cuda(idx) => Device::Cuda(idx),
    }
}

fn torch_kind(precision: Precision) -> Kind {
    match precision {
        Precision::Half => Kind::Half,
        Precision::Full => Kind::Float,
    }
}

/// Loads TorchScript exports of the pipelines through libtorch.
pub struct TchPipelineLoader {
    shape_text_module_path: PathBuf,
    shape_image_module_path: PathBuf,
    texture_module_path: PathBuf,
    tokenizer_path: PathBuf,
    device: ComputeDevice,
    encoder: OnceCell<Arc<PromptEncoder>>,
}

impl TchPipelineLoader {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            shape_text_module_path: config.shape_text_module_path.clone(),
            shape_image_module_path: config.shape_image_module_path.clone(),
            texture_module_path: config.texture_module_path.clone(),
            tokenizer_path: config.tokenizer_path.clone(),
            device: select_device(config.device),
            encoder: OnceCell::new(),
        }
    }

    fn encoder(&self) -> Result<Arc<PromptEncoder>, ServiceError> {
        self.encoder
            .get_or_try_init(|| PromptEncoder::load(&self.tokenizer_path).map(Arc::new))
            .map(Arc::clone)
    }

    fn module(&self, kind: PipelineKind, path: &Path) -> Result<TorchModule, ServiceError> {
        TorchModule::load(kind, path, self.device)
    }
}

impl PipelineLoader for TchPipelineLoader {
    fn load_shape(&self, kind: PipelineKind) -> Result<Arc<dyn ShapePipeline>, ServiceError> {
        let pipeline = match kind {
            PipelineKind::ShapeText => TchShapePipeline {
                module: self.module(kind, &self.shape_text_module_path)?,
                encoder: Some(self.encoder()?),
            },
            PipelineKind::ShapeImage => TchShapePipeline {
                module: self.module(kind, &self.shape_image_module_path)?,
                encoder: None,
            },
            PipelineKind::Texture => {
                return Err(ServiceError::Other(format!(
                    "{kind} is not a shape pipeline"
                )));
            }
        };
        Ok(Arc::new(pipeline))
    }

    fn load_texture(&self) -> Result<Arc<dyn TexturePipeline>, ServiceError> {
        Ok(Arc::new(TchTexturePipeline {
            module: self.module(PipelineKind::Texture, &self.texture_module_path)?,
            encoder: self.encoder()?,
        }))
    }

    fn device(&self) -> ComputeDevice {
        self.device
    }

    fn accelerator_available(&self) -> bool {
        tch::Cuda::is_available()
    }
}

struct PromptEncoder {
    tokenizer: Tokenizer,
    pad_id: i64,
}

impl PromptEncoder {
    fn load(path: &Path) -> Result<Self, ServiceError> {
        if !path.exists() {
            return Err(ServiceError::PipelineLoad(format!(
                "tokenizer missing: {}",
                path.display()
            )));
        }
        let tokenizer =
            Tokenizer::from_file(path).map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        let pad_id = tokenizer
            .token_to_id("<|endoftext|>")
            .unwrap_or(CLIP_END_OF_TEXT) as i64;
        Ok(Self { tokenizer, pad_id })
    }

    fn encode(&self, prompt: &str, device: Device) -> Result<Tensor, ServiceError> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        let mut ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        if ids.len() > CLIP_CONTEXT_LENGTH {
            ids.truncate(CLIP_CONTEXT_LENGTH);
            ids[CLIP_CONTEXT_LENGTH - 1] = self.pad_id;
        }
        ids.resize(CLIP_CONTEXT_LENGTH, self.pad_id);

        Ok(Tensor::from_slice(&ids)
            .reshape([1, CLIP_CONTEXT_LENGTH as i64])
            .to(device))
    }
}

/// A TorchScript module placed on one device. Calls are serialized.
struct TorchModule {
    kind: PipelineKind,
    device: Device,
    dtype: Kind,
    module: Mutex<tch::CModule>,
}

impl TorchModule {
    fn load(kind: PipelineKind, path: &Path, device: ComputeDevice) -> Result<Self, ServiceError> {
        if !path.exists() {
            return Err(ServiceError::PipelineLoad(format!(
                "{kind} model artifact missing: {}",
                path.display()
            )));
        }
        let torch_device = torch_device(device);
        let dtype = torch_kind(device.precision());
        let mut module = tch::CModule::load_on_device(path, torch_device)
            .map_err(|e| ServiceError::PipelineLoad(format!("{kind}: {e}")))?;
        if dtype != Kind::Float {
            module.to(torch_device, dtype, false);
        }
        module.set_eval();

        Ok(Self {
            kind,
            device: torch_device,
            dtype,
            module: Mutex::new(module),
        })
    }

    fn forward(&self, inputs: &[IValue]) -> Result<IValue, ServiceError> {
        debug!(kind = %self.kind, "running forward pass");
        let module = self.module.lock();
        no_grad(|| module.forward_is(inputs))
            .map_err(|e| ServiceError::Inference(format!("{}: {e}", self.kind)))
    }
}

struct TchShapePipeline {
    module: TorchModule,
    encoder: Option<Arc<PromptEncoder>>,
}

impl ShapePipeline for TchShapePipeline {
    fn generate(
        &self,
        input: &ShapeInput,
        params: &ShapeParams,
    ) -> Result<Vec<GeneratedMesh>, ServiceError> {
        let conditioning = match input {
            ShapeInput::Prompt(prompt) => {
                let encoder = self.encoder.as_ref().ok_or_else(|| {
                    ServiceError::Inference(format!("{} takes image input", self.module.kind))
                })?;
                encoder.encode(prompt, self.module.device)?
            }
            ShapeInput::Image(image) => {
                image_tensor(image).to_device(self.module.device).to_kind(self.module.dtype)
            }
        };

        let output = self.module.forward(&[
            IValue::Tensor(conditioning),
            IValue::Int(params.num_inference_steps),
            IValue::Int(params.frame_size),
        ])?;
        parse_meshes(output)
    }
}

struct TchTexturePipeline {
    module: TorchModule,
    encoder: Arc<PromptEncoder>,
}

impl TexturePipeline for TchTexturePipeline {
    fn generate(
        &self,
        prompt: &str,
        params: &TextureParams,
    ) -> Result<Vec<RgbImage>, ServiceError> {
        let ids = self.encoder.encode(prompt, self.module.device)?;
        let output = self
            .module
            .forward(&[IValue::Tensor(ids), IValue::Int(params.num_inference_steps)])?;

        let batch = match output {
            IValue::Tensor(t) => t,
            IValue::Tuple(items) | IValue::GenericList(items) => match items.into_iter().next() {
                Some(IValue::Tensor(t)) => t,
                _ => {
                    return Err(ServiceError::Inference(
                        "expected tensor as first texture output".into(),
                    ));
                }
            },
            _ => {
                return Err(ServiceError::Inference(
                    "unexpected texture pipeline output".into(),
                ));
            }
        };
        images_from_batch(&batch)
    }
}

/// `[1, 3, H, W]` float tensor in `[0, 1]` on the CPU.
fn image_tensor(image: &RgbImage) -> Tensor {
    let (width, height) = image.dimensions();
    let pixels = Tensor::from_slice(image.as_raw())
        .view([height as i64, width as i64, 3])
        .permute([2, 0, 1])
        .to_kind(Kind::Float);
    (pixels / 255.0).unsqueeze(0)
}

fn images_from_batch(batch: &Tensor) -> Result<Vec<RgbImage>, ServiceError> {
    let batch = match batch.dim() {
        3 => batch.unsqueeze(0),
        4 => batch.shallow_clone(),
        dim => {
            return Err(ServiceError::Inference(format!(
                "texture output has {dim} dimensions, expected 4"
            )));
        }
    };
    let size = batch.size();
    if size[1] != 3 {
        return Err(ServiceError::Inference(format!(
            "texture output has {} channels, expected 3",
            size[1]
        )));
    }
    let (height, width) = (size[2] as u32, size[3] as u32);

    (0..size[0])
        .map(|idx| {
            let pixels = (batch.get(idx).to_kind(Kind::Float).clamp(0.0, 1.0) * 255.0)
                .round()
                .to_kind(Kind::Uint8)
                .permute([1, 2, 0])
                .to_device(Device::Cpu)
                .contiguous()
                .view([-1]);
            let raw = Vec::<u8>::try_from(&pixels)
                .map_err(|e| ServiceError::Inference(e.to_string()))?;
            RgbImage::from_raw(width, height, raw).ok_or_else(|| {
                ServiceError::Inference("texture buffer does not match its dimensions".into())
            })
        })
        .collect()
}

fn parse_meshes(output: IValue) -> Result<Vec<GeneratedMesh>, ServiceError> {
    match output {
        IValue::Tuple(items) | IValue::GenericList(items)
            if items
                .iter()
                .all(|item| matches!(item, IValue::Tuple(_) | IValue::GenericDict(_))) =>
        {
            items.into_iter().map(parse_mesh).collect()
        }
        single => Ok(vec![parse_mesh(single)?]),
    }
}

/// Accepts a bare vertex tensor, a `(verts, faces)` tuple, or a dict keyed by
/// `verts`/`vertices` and `faces`. Missing parts stay `None` so the exporter
/// can reject them.
fn parse_mesh(value: IValue) -> Result<GeneratedMesh, ServiceError> {
    match value {
        IValue::Tensor(verts) => Ok(GeneratedMesh {
            vertices: Some(vertices_from(&verts)?),
            faces: None,
        }),
        IValue::Tuple(parts) | IValue::GenericList(parts) => {
            let mut parts = parts.into_iter();
            let vertices = optional_tensor(parts.next())?
                .map(|t| vertices_from(&t))
                .transpose()?;
            let faces = optional_tensor(parts.next())?
                .map(|t| faces_from(&t))
                .transpose()?;
            Ok(GeneratedMesh { vertices, faces })
        }
        IValue::GenericDict(entries) => {
            let mut mesh = GeneratedMesh::default();
            for (key, value) in entries {
                let IValue::String(key) = key else { continue };
                match key.as_str() {
                    "verts" | "vertices" => {
                        mesh.vertices = optional_tensor(Some(value))?
                            .map(|t| vertices_from(&t))
                            .transpose()?;
                    }
                    "faces" => {
                        mesh.faces = optional_tensor(Some(value))?
                            .map(|t| faces_from(&t))
                            .transpose()?;
                    }
                    _ => {}
                }
            }
            Ok(mesh)
        }
        other => Err(ServiceError::Inference(format!(
            "unexpected shape pipeline output: {other:?}"
        ))),
    }
}

fn optional_tensor(value: Option<IValue>) -> Result<Option<Tensor>, ServiceError> {
    match value {
        None | Some(IValue::None) => Ok(None),
        Some(IValue::Tensor(t)) => Ok(Some(t)),
        Some(other) => Err(ServiceError::Inference(format!(
            "expected tensor in mesh output, got {other:?}"
        ))),
    }
}

fn rows_of_three(tensor: &Tensor, what: &str) -> Result<Tensor, ServiceError> {
    let size = tensor.size();
    if size.len() != 2 || size[1] != 3 {
        return Err(ServiceError::Inference(format!(
            "{what} tensor has shape {size:?}, expected [N, 3]"
        )));
    }
    Ok(tensor.to_device(Device::Cpu).contiguous().view([-1]))
}

fn vertices_from(tensor: &Tensor) -> Result<Vec<[f32; 3]>, ServiceError> {
    let flat = rows_of_three(tensor, "vertex")?.to_kind(Kind::Float);
    let values =
        Vec::<f32>::try_from(&flat).map_err(|e| ServiceError::Inference(e.to_string()))?;
    Ok(values.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect())
}

fn faces_from(tensor: &Tensor) -> Result<Vec<[u32; 3]>, ServiceError> {
    let flat = rows_of_three(tensor, "face")?.to_kind(Kind::Int64);
    let values =
        Vec::<i64>::try_from(&flat).map_err(|e| ServiceError::Inference(e.to_string()))?;
    let indices = values
        .into_iter()
        .map(|v| {
            u32::try_from(v)
                .map_err(|_| ServiceError::Inference(format!("invalid face index {v}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(indices.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuple_output_yields_one_mesh() {
        let verts = Tensor::from_slice(&[0.0f32, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0])
            .view([3, 3]);
        let faces = Tensor::from_slice(&[0i64, 1, 2]).view([1, 3]);
        let meshes =
            parse_meshes(IValue::Tuple(vec![IValue::Tensor(verts), IValue::Tensor(faces)]))
                .unwrap();

        assert_eq!(meshes.len(), 1);
        assert_eq!(meshes[0].faces.as_deref(), Some(&[[0u32, 1, 2]][..]));
        assert_eq!(meshes[0].vertices.as_ref().map(Vec::len), Some(3));
    }

    #[test]
    fn dict_without_faces_leaves_faces_empty() {
        let verts = Tensor::from_slice(&[0.0f32; 6]).view([2, 3]);
        let meshes = parse_meshes(IValue::GenericDict(vec![(
            IValue::String("verts".into()),
            IValue::Tensor(verts),
        )]))
        .unwrap();

        assert_eq!(meshes.len(), 1);
        assert!(meshes[0].vertices.is_some());
        assert!(meshes[0].faces.is_none());
    }

    #[test]
    fn malformed_tensors_are_inference_errors() {
        let verts = Tensor::from_slice(&[0.0f32; 4]).view([2, 2]);
        assert!(parse_meshes(IValue::Tensor(verts)).is_err());

        let faces = Tensor::from_slice(&[-1i64, 0, 1]).view([1, 3]);
        assert!(faces_from(&faces).is_err());
    }

    #[test]
    fn texture_batch_converts_to_rgb() {
        let batch = Tensor::ones([2, 3, 4, 5], (Kind::Float, Device::Cpu));
        let images = images_from_batch(&batch).unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].dimensions(), (5, 4));
        assert_eq!(images[0].get_pixel(0, 0).0, [255, 255, 255]);
    }

    #[test]
    fn image_tensor_is_normalized_chw() {
        let image = RgbImage::from_pixel(4, 2, image::Rgb([255, 0, 51]));
        let tensor = image_tensor(&image);
        assert_eq!(tensor.size(), vec![1, 3, 2, 4]);
        assert!((tensor.double_value(&[0, 0, 1, 3]) - 1.0).abs() < 1e-6);
        assert!((tensor.double_value(&[0, 2, 0, 0]) - 0.2).abs() < 1e-6);
    }
}
