use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
};

use crate::model::PipelineKind;

const DEFAULT_MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

/// Which device the operator wants pipelines placed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePreference {
    /// CUDA when available, otherwise CPU.
    Auto,
    Cpu,
    Cuda(usize),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub output_dir: PathBuf,
    pub shape_text_module_path: PathBuf,
    pub shape_image_module_path: PathBuf,
    pub texture_module_path: PathBuf,
    pub tokenizer_path: PathBuf,
    pub device: DevicePreference,
    pub max_upload_bytes: usize,
    pub preload: Vec<PipelineKind>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let listen_addr = env::var("SERVER_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8000".into())
            .parse()
            .unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8000));

        let output_dir = PathBuf::from(
            env::var("OUTPUT_DIR").unwrap_or_else(|_| "generated_assets".to_string()),
        );

        let shape_text_module_path = PathBuf::from(
            env::var("SHAPE_TEXT_MODULE_PATH")
                .unwrap_or_else(|_| "models/shap_e_text.ts".to_string()),
        );
        let shape_image_module_path = PathBuf::from(
            env::var("SHAPE_IMAGE_MODULE_PATH")
                .unwrap_or_else(|_| "models/shap_e_img2img.ts".to_string()),
        );
        let texture_module_path = PathBuf::from(
            env::var("TEXTURE_MODULE_PATH")
                .unwrap_or_else(|_| "models/sd15_texture.ts".to_string()),
        );
        let tokenizer_path = PathBuf::from(
            env::var("TOKENIZER_PATH")
                .unwrap_or_else(|_| "models/clip_tokenizer.json".to_string()),
        );

        let device = {
            let raw = env::var("DEVICE").unwrap_or_else(|_| "auto".into());
            parse_device(&raw)
        };

        let max_upload_bytes = env::var("MAX_UPLOAD_BYTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES);

        let preload = match env::var("PRELOAD_PIPELINES") {
            Ok(raw) => parse_preload(&raw)?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            listen_addr,
            output_dir,
            shape_text_module_path,
            shape_image_module_path,
            texture_module_path,
            tokenizer_path,
            device,
            max_upload_bytes,
            preload,
        })
    }

    /// Settings for running against a scratch output directory, with every
    /// artifact path left at its default.
    pub fn with_output_dir(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8000),
            output_dir: output_dir.into(),
            shape_text_module_path: PathBuf::from("models/shap_e_text.ts"),
            shape_image_module_path: PathBuf::from("models/shap_e_img2img.ts"),
            texture_module_path: PathBuf::from("models/sd15_texture.ts"),
            tokenizer_path: PathBuf::from("models/clip_tokenizer.json"),
            device: DevicePreference::Auto,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            preload: Vec::new(),
        }
    }
}

fn parse_device(raw: &str) -> DevicePreference {
    let lower = raw.trim().to_lowercase();
    if lower == "cpu" {
        DevicePreference::Cpu
    } else if lower.starts_with("cuda") {
        let idx = lower
            .split(':')
            .nth(1)
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        DevicePreference::Cuda(idx)
    } else {
        DevicePreference::Auto
    }
}

fn parse_preload(raw: &str) -> anyhow::Result<Vec<PipelineKind>> {
    let mut kinds = Vec::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let kind: PipelineKind = item.parse()?;
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    Ok(kinds)
}
