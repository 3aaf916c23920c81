use std::{sync::Arc, time::Instant};

use image::RgbImage;
use once_cell::sync::OnceCell;
use tokio::task;
use tracing::info;

use crate::{
    error::ServiceError,
    model::{
        ComputeDevice, GeneratedMesh, PipelineKind, PipelineStatus, ShapeInput, ShapeParams,
        TextureParams,
        pipeline::{PipelineLoader, ShapePipeline, TexturePipeline},
    },
};

/// Process-wide cache of loaded pipelines. Each kind is built at most once;
/// concurrent first callers wait on the same cell instead of loading twice.
pub struct PipelineRegistry {
    loader: Arc<dyn PipelineLoader>,
    shape_text: OnceCell<Arc<dyn ShapePipeline>>,
    shape_image: OnceCell<Arc<dyn ShapePipeline>>,
    texture: OnceCell<Arc<dyn TexturePipeline>>,
}

impl PipelineRegistry {
    pub fn new(loader: Arc<dyn PipelineLoader>) -> Self {
        Self {
            loader,
            shape_text: OnceCell::new(),
            shape_image: OnceCell::new(),
            texture: OnceCell::new(),
        }
    }

    pub fn device(&self) -> ComputeDevice {
        self.loader.device()
    }

    pub fn accelerator_available(&self) -> bool {
        self.loader.accelerator_available()
    }

    pub fn is_loaded(&self, kind: PipelineKind) -> bool {
        match kind {
            PipelineKind::ShapeText => self.shape_text.get().is_some(),
            PipelineKind::ShapeImage => self.shape_image.get().is_some(),
            PipelineKind::Texture => self.texture.get().is_some(),
        }
    }

    pub fn loaded(&self) -> Vec<PipelineKind> {
        PipelineKind::ALL
            .into_iter()
            .filter(|kind| self.is_loaded(*kind))
            .collect()
    }

    pub fn status(&self) -> PipelineStatus {
        let device = self.device();
        PipelineStatus {
            device: device.to_string(),
            precision: device.precision(),
            gpu: self.accelerator_available(),
            loaded: self.loaded(),
        }
    }

    fn shape_cell(
        &self,
        kind: PipelineKind,
    ) -> Result<&OnceCell<Arc<dyn ShapePipeline>>, ServiceError> {
        match kind {
            PipelineKind::ShapeText => Ok(&self.shape_text),
            PipelineKind::ShapeImage => Ok(&self.shape_image),
            PipelineKind::Texture => Err(ServiceError::Other(format!(
                "{kind} is not a shape pipeline"
            ))),
        }
    }

    /// Returns the shape pipeline for `kind`, loading it on first use.
    /// Blocks the calling thread while the model loads.
    pub fn shape_blocking(
        &self,
        kind: PipelineKind,
    ) -> Result<Arc<dyn ShapePipeline>, ServiceError> {
        let cell = self.shape_cell(kind)?;
        cell.get_or_try_init(|| self.timed_load(kind, || self.loader.load_shape(kind)))
            .map(Arc::clone)
    }

    /// Returns the texture pipeline, loading it on first use.
    pub fn texture_blocking(&self) -> Result<Arc<dyn TexturePipeline>, ServiceError> {
        self.texture
            .get_or_try_init(|| {
                self.timed_load(PipelineKind::Texture, || self.loader.load_texture())
            })
            .map(Arc::clone)
    }

    fn timed_load<T>(
        &self,
        kind: PipelineKind,
        load: impl FnOnce() -> Result<T, ServiceError>,
    ) -> Result<T, ServiceError> {
        let device = self.device();
        info!(%kind, %device, precision = ?device.precision(), "loading pipeline");
        let start = Instant::now();
        let pipeline = load()?;
        info!(%kind, elapsed_ms = start.elapsed().as_millis() as u64, "pipeline ready");
        Ok(pipeline)
    }

    /// Eagerly builds the given kinds. Stops at the first failure.
    pub async fn warm_up(self: &Arc<Self>, kinds: &[PipelineKind]) -> Result<(), ServiceError> {
        for &kind in kinds {
            let registry = Arc::clone(self);
            task::spawn_blocking(move || match kind {
                PipelineKind::Texture => registry.texture_blocking().map(|_| ()),
                shape => registry.shape_blocking(shape).map(|_| ()),
            })
            .await
            .map_err(|err| ServiceError::PipelineLoad(format!("load task failed: {err}")))??;
        }
        Ok(())
    }

    pub async fn text_to_mesh(
        self: &Arc<Self>,
        prompt: String,
    ) -> Result<GeneratedMesh, ServiceError> {
        self.spawn_shape(PipelineKind::ShapeText, ShapeInput::Prompt(prompt))
            .await
    }

    pub async fn image_to_mesh(
        self: &Arc<Self>,
        image: RgbImage,
    ) -> Result<GeneratedMesh, ServiceError> {
        self.spawn_shape(PipelineKind::ShapeImage, ShapeInput::Image(image))
            .await
    }

    /// Runs the texture pipeline and returns its first image.
    pub async fn generate_texture(
        self: &Arc<Self>,
        prompt: String,
    ) -> Result<RgbImage, ServiceError> {
        let registry = Arc::clone(self);
        task::spawn_blocking(move || {
            let pipeline = registry.texture_blocking()?;
            let images = pipeline.generate(&prompt, &TextureParams::default())?;
            images.into_iter().next().ok_or_else(|| {
                ServiceError::Inference("texture pipeline returned no images".into())
            })
        })
        .await
        .map_err(|err| ServiceError::Inference(format!("inference task failed: {err}")))?
    }

    async fn spawn_shape(
        self: &Arc<Self>,
        kind: PipelineKind,
        input: ShapeInput,
    ) -> Result<GeneratedMesh, ServiceError> {
        let registry = Arc::clone(self);
        task::spawn_blocking(move || {
            let pipeline = registry.shape_blocking(kind)?;
            let meshes = pipeline.generate(&input, &ShapeParams::default())?;
            meshes.into_iter().next().ok_or_else(|| {
                ServiceError::Inference(format!("{kind} pipeline returned no meshes"))
            })
        })
        .await
        .map_err(|err| ServiceError::Inference(format!("inference task failed: {err}")))?
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
        time::Duration,
    };

    use super::*;

    struct StaticShape;

    impl ShapePipeline for StaticShape {
        fn generate(
            &self,
            _input: &ShapeInput,
            _params: &ShapeParams,
        ) -> Result<Vec<GeneratedMesh>, ServiceError> {
            Ok(vec![GeneratedMesh::new(
                vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
                vec![[0, 1, 2]],
            )])
        }
    }

    #[derive(Default)]
    struct CountingLoader {
        loads: AtomicUsize,
        failures_left: AtomicUsize,
    }

    impl PipelineLoader for CountingLoader {
        fn load_shape(&self, _kind: PipelineKind) -> Result<Arc<dyn ShapePipeline>, ServiceError> {
            // Widen the window in which concurrent callers could race.
            thread::sleep(Duration::from_millis(20));
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ServiceError::PipelineLoad("weights unavailable".into()));
            }
            Ok(Arc::new(StaticShape))
        }

        fn load_texture(&self) -> Result<Arc<dyn TexturePipeline>, ServiceError> {
            Err(ServiceError::PipelineLoad("no texture model".into()))
        }

        fn device(&self) -> ComputeDevice {
            ComputeDevice::Cpu
        }

        fn accelerator_available(&self) -> bool {
            false
        }
    }

    #[test]
    fn concurrent_first_use_loads_once() {
        let loader = Arc::new(CountingLoader::default());
        let registry = Arc::new(PipelineRegistry::new(loader.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || registry.shape_blocking(PipelineKind::ShapeText).is_ok())
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }

        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert_eq!(registry.loaded(), vec![PipelineKind::ShapeText]);
    }

    #[test]
    fn kinds_are_cached_independently() {
        let loader = Arc::new(CountingLoader::default());
        let registry = PipelineRegistry::new(loader.clone());

        registry.shape_blocking(PipelineKind::ShapeText).unwrap();
        registry.shape_blocking(PipelineKind::ShapeImage).unwrap();
        registry.shape_blocking(PipelineKind::ShapeText).unwrap();

        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
        assert!(registry.shape_blocking(PipelineKind::Texture).is_err());
    }

    #[test]
    fn failed_load_is_retried_on_next_request() {
        let loader = Arc::new(CountingLoader {
            failures_left: AtomicUsize::new(1),
            ..Default::default()
        });
        let registry = PipelineRegistry::new(loader.clone());

        assert!(registry.shape_blocking(PipelineKind::ShapeImage).is_err());
        assert!(!registry.is_loaded(PipelineKind::ShapeImage));

        assert!(registry.shape_blocking(PipelineKind::ShapeImage).is_ok());
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn text_to_mesh_returns_first_mesh() {
        let registry = Arc::new(PipelineRegistry::new(Arc::new(CountingLoader::default())));
        let mesh = registry.text_to_mesh("a chair".into()).await.unwrap();
        assert_eq!(mesh.faces.unwrap(), vec![[0, 1, 2]]);
    }

    #[tokio::test]
    async fn warm_up_reports_load_failures() {
        let registry = Arc::new(PipelineRegistry::new(Arc::new(CountingLoader::default())));
        registry.warm_up(&[PipelineKind::ShapeText]).await.unwrap();
        assert!(registry.is_loaded(PipelineKind::ShapeText));

        let err = registry.warm_up(&[PipelineKind::Texture]).await.unwrap_err();
        assert!(matches!(err, ServiceError::PipelineLoad(_)));
    }
}
