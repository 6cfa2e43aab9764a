//! Loader worker pool. Each worker drives one scene descriptor through the
//! full pipeline: manifest fetch, chunked download into the staging
//! directory, OBJ parse, unit-cube normalization, and GPU handoff via the
//! upload queue.

use super::obj;
use super::types::{
    LoadError, MeshData, ModelBounds, ModelProgress, SceneDescriptor, SceneState,
};
use crate::net::{Manifest, SceneFetcher};
use crate::renderer::MeshRenderer;
use crate::upload::UploadQueue;
use crossbeam_channel::{unbounded, Receiver, Sender};
use glam::{Mat4, Vec3};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub worker_count: usize,
    /// Scratch area for streamed files; one subdirectory per scene.
    pub staging_dir: PathBuf,
    /// Artificial delay after each parse, to exercise progress UIs. No
    /// effect on correctness.
    pub parse_delay: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            staging_dir: std::env::temp_dir().join("scene_viewer"),
            parse_delay: Duration::ZERO,
        }
    }
}

pub struct SceneLoader {
    jobs: Mutex<Option<Sender<Arc<SceneDescriptor>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

impl SceneLoader {
    pub fn new(
        fetcher: Arc<dyn SceneFetcher>,
        uploads: Arc<UploadQueue>,
        config: LoaderConfig,
    ) -> Arc<Self> {
        let (tx, rx) = unbounded::<Arc<SceneDescriptor>>();
        let running = Arc::new(AtomicBool::new(true));

        let worker_count = config.worker_count.max(1);
        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let ctx = WorkerCtx {
                rx: rx.clone(),
                fetcher: fetcher.clone(),
                uploads: uploads.clone(),
                running: running.clone(),
                staging_dir: config.staging_dir.clone(),
                parse_delay: config.parse_delay,
            };
            let handle = std::thread::Builder::new()
                .name(format!("scene-loader-{index}"))
                .spawn(move || ctx.run())
                .expect("failed to spawn loader worker");
            workers.push(handle);
        }

        Arc::new(Self {
            jobs: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            running,
        })
    }

    /// Queue a scene for loading. Only UNLOADED or ERROR descriptors are
    /// eligible; anything else is already queued, in flight, or resident.
    /// Returns whether the scene was actually enqueued.
    pub fn enqueue(&self, desc: &Arc<SceneDescriptor>) -> bool {
        let jobs = self.jobs.lock();
        let Some(tx) = jobs.as_ref() else {
            return false;
        };

        let claimed = desc
            .state
            .transition(SceneState::Unloaded, SceneState::Queued)
            || desc.state.transition(SceneState::Error, SceneState::Queued);
        if !claimed {
            return false;
        }

        desc.cancel.reset();
        if tx.send(desc.clone()).is_err() {
            desc.state.store(SceneState::Unloaded);
            return false;
        }
        tracing::debug!(scene_id = %desc.scene_id, "Scene enqueued for loading");
        true
    }

    /// Stop accepting work and disconnect the job queue. Workers finish
    /// their current item and exit; queued-but-unclaimed scenes are skipped.
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::Release);
        self.jobs.lock().take();
    }

    /// Join every worker thread. Idempotent.
    pub fn join(&self) {
        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(e) = handle.join() {
                tracing::warn!(?e, "Loader worker panicked");
            }
        }
    }

    pub fn shutdown(&self) {
        self.request_stop();
        self.join();
        tracing::info!("Loader workers joined");
    }
}

struct WorkerCtx {
    rx: Receiver<Arc<SceneDescriptor>>,
    fetcher: Arc<dyn SceneFetcher>,
    uploads: Arc<UploadQueue>,
    running: Arc<AtomicBool>,
    staging_dir: PathBuf,
    parse_delay: Duration,
}

impl WorkerCtx {
    fn run(&self) {
        // Disconnection of the job channel is the shutdown signal.
        while let Ok(desc) = self.rx.recv() {
            if !self.running.load(Ordering::Acquire) {
                break;
            }

            // Claim. A scene unloaded while it sat in the queue fails the
            // transition and is skipped.
            if !desc
                .state
                .transition(SceneState::Queued, SceneState::Loading)
            {
                tracing::debug!(scene_id = %desc.scene_id, "Skipping stale queue entry");
                continue;
            }

            match self.load_scene(&desc) {
                Ok(()) => {
                    // compare_exchange so a concurrent unload wins over us.
                    if desc
                        .state
                        .transition(SceneState::Loading, SceneState::Loaded)
                    {
                        tracing::info!(scene_id = %desc.scene_id, "Scene loaded");
                    }
                }
                Err(LoadError::Cancelled) => {
                    desc.state.store(SceneState::Unloaded);
                    tracing::info!(scene_id = %desc.scene_id, "Scene load cancelled");
                }
                Err(err) => {
                    desc.state.store(SceneState::Error);
                    tracing::warn!(scene_id = %desc.scene_id, error = %err, "Scene load failed");
                }
            }
        }
    }

    fn load_scene(&self, desc: &Arc<SceneDescriptor>) -> Result<(), LoadError> {
        if desc.cancel.is_cancelled() {
            return Err(LoadError::Cancelled);
        }

        let manifest = self.fetcher.fetch_manifest(&desc.scene_id)?;
        let models = self.adopt_manifest(desc, manifest);

        for (index, model) in models.iter().enumerate() {
            if desc.cancel.is_cancelled() {
                return Err(LoadError::Cancelled);
            }

            let out_path = self
                .staging_dir
                .join(&desc.scene_id)
                .join(&model.rel_path);
            if let Some(parent) = out_path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| LoadError::Internal(format!("create staging dir: {e}")))?;
            }

            let progress_model = model.clone();
            self.fetcher.stream_model_to_file(
                &desc.scene_id,
                &model.rel_path,
                &out_path,
                model.size_bytes,
                &move |got, _total| progress_model.set_bytes_received(got),
                &desc.cancel,
            )?;

            let mesh = obj::load_obj(&out_path)?;
            if !self.parse_delay.is_zero() {
                std::thread::sleep(self.parse_delay);
            }

            tracing::debug!(
                scene_id = %desc.scene_id,
                rel_path = %model.rel_path,
                vertices = mesh.vertex_count(),
                indices = mesh.indices.len(),
                "Parsed model"
            );

            let (transform, bounds) = normalize_mesh(&mesh);
            {
                let mut shared = desc.lock();
                if index < shared.model_bounds.len() {
                    shared.model_bounds[index] = bounds;
                }
            }

            self.enqueue_upload(desc, index, mesh, transform);

            model.set_bytes_received(model.size_bytes);
            model.mark_parsed();
        }

        Ok(())
    }

    /// Install the manifest under the descriptor's lock: all four parallel
    /// vectors are rewritten together. Returns the progress slots so the
    /// worker can iterate without re-locking. Handles still installed from a
    /// previous generation are swept via the upload queue.
    fn adopt_manifest(
        &self,
        desc: &Arc<SceneDescriptor>,
        manifest: Manifest,
    ) -> Vec<Arc<ModelProgress>> {
        let models: Vec<Arc<ModelProgress>> = manifest
            .models
            .into_iter()
            .map(|m| Arc::new(ModelProgress::new(m.name, m.rel_path, m.size_bytes)))
            .collect();

        let stale: Vec<_>;
        {
            let mut shared = desc.lock();
            stale = shared
                .mesh_handles
                .iter()
                .copied()
                .filter(|h| !h.is_null())
                .collect();
            shared.adopt(models.clone(), manifest.thumbnail);
            desc.bump_generation();
            desc.current_model_index.store(0, Ordering::Release);
        }

        if !stale.is_empty() {
            self.uploads.push(Box::new(move |renderer| {
                for handle in stale {
                    renderer.destroy_mesh(handle);
                }
            }));
        }

        models
    }

    /// Hand the parsed buffers to the render thread. The task holds only a
    /// weak reference to the descriptor and the generation it was built for;
    /// an unload or re-adoption in between turns it into a cleanup.
    fn enqueue_upload(
        &self,
        desc: &Arc<SceneDescriptor>,
        index: usize,
        mesh: MeshData,
        transform: Mat4,
    ) {
        let weak: Weak<SceneDescriptor> = Arc::downgrade(desc);
        let generation = desc.generation();

        self.uploads.push(Box::new(move |renderer| {
            let Some(desc) = weak.upgrade() else {
                // Descriptor gone; the CPU buffers drop right here.
                return;
            };
            if desc.generation() != generation {
                return;
            }

            let handle = renderer.upload_mesh(&mesh.positions, &mesh.indices);

            let mut shared = desc.lock();
            let current = desc.state.load() != SceneState::Unloaded
                && desc.generation() == generation
                && index < shared.mesh_handles.len();
            if current {
                shared.mesh_handles[index] = handle;
                shared.model_transforms[index] = transform;
            } else {
                drop(shared);
                renderer.destroy_mesh(handle);
            }
        }));
    }
}

/// Fit a mesh into a unit cube centered at the origin via
/// `p' = scale * (p - center)`, and return the transform together with the
/// transformed bounding sphere (center 0, radius scaled).
pub fn normalize_mesh(mesh: &MeshData) -> (Mat4, ModelBounds) {
    if mesh.positions.is_empty() {
        return (Mat4::IDENTITY, ModelBounds::default());
    }

    let mut min = Vec3::splat(f32::MAX);
    let mut max = Vec3::splat(f32::MIN);
    for p in mesh.positions.chunks_exact(3) {
        let v = Vec3::new(p[0], p[1], p[2]);
        min = min.min(v);
        max = max.max(v);
    }

    let center = (min + max) * 0.5;
    let extent = max - min;
    let max_extent = extent.x.max(extent.y).max(extent.z);
    let scale = if max_extent > 0.0 { 1.0 / max_extent } else { 1.0 };

    let transform = Mat4::from_scale(Vec3::splat(scale)) * Mat4::from_translation(-center);
    let bounds = ModelBounds {
        center: Vec3::ZERO,
        radius: scale * max_extent * 0.5,
    };
    (transform, bounds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::{MeshRenderer, NullRenderer};
    use crate::scene::types::CancelToken;
    use std::collections::HashMap;
    use std::io::Write;
    use std::path::Path;
    use std::time::Instant;

    const TRIANGLE_OBJ: &[u8] = b"v 0 0 0\nv 2 0 0\nv 0 2 0\nf 1 2 3\n";

    /// In-process stand-in for the content service: scenes are maps of
    /// rel_path -> bytes, streamed in small chunks with cancel polling.
    struct StubFetcher {
        scenes: HashMap<String, Vec<(String, Vec<u8>)>>,
        chunk_size: usize,
        chunk_delay: Duration,
    }

    impl StubFetcher {
        fn new() -> Self {
            Self {
                scenes: HashMap::new(),
                chunk_size: 4096,
                chunk_delay: Duration::ZERO,
            }
        }

        fn with_scene(mut self, scene_id: &str, models: &[(&str, &[u8])]) -> Self {
            self.scenes.insert(
                scene_id.into(),
                models
                    .iter()
                    .map(|(rel, bytes)| (rel.to_string(), bytes.to_vec()))
                    .collect(),
            );
            self
        }
    }

    impl SceneFetcher for StubFetcher {
        fn fetch_manifest(&self, scene_id: &str) -> Result<Manifest, LoadError> {
            let models = self.scenes.get(scene_id).ok_or(LoadError::NotFound)?;
            Ok(Manifest {
                scene_id: scene_id.into(),
                models: models
                    .iter()
                    .map(|(rel, bytes)| crate::net::ManifestModel {
                        name: rel.trim_end_matches(".obj").into(),
                        rel_path: rel.clone(),
                        size_bytes: bytes.len() as u64,
                    })
                    .collect(),
                thumbnail: Vec::new(),
            })
        }

        fn stream_model_to_file(
            &self,
            scene_id: &str,
            rel_path: &str,
            out_path: &Path,
            size_bytes: u64,
            progress: &(dyn Fn(u64, u64) + Send + Sync),
            cancel: &CancelToken,
        ) -> Result<(), LoadError> {
            let models = self.scenes.get(scene_id).ok_or(LoadError::NotFound)?;
            let (_, bytes) = models
                .iter()
                .find(|(rel, _)| rel == rel_path)
                .ok_or(LoadError::NotFound)?;

            let mut file = std::fs::File::create(out_path)
                .map_err(|e| LoadError::Internal(e.to_string()))?;
            let mut got = 0u64;
            let cancelled = || {
                let _ = std::fs::remove_file(out_path);
                LoadError::Cancelled
            };

            for chunk in bytes.chunks(self.chunk_size.max(1)) {
                if cancel.is_cancelled() {
                    return Err(cancelled());
                }
                file.write_all(chunk)
                    .map_err(|e| LoadError::Internal(e.to_string()))?;
                got += chunk.len() as u64;
                progress(got, size_bytes);
                if !self.chunk_delay.is_zero() {
                    std::thread::sleep(self.chunk_delay);
                }
            }

            // One more poll covers a cancel between the final data chunk and
            // the terminator.
            if cancel.is_cancelled() {
                return Err(cancelled());
            }
            Ok(())
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    struct Rig {
        _staging: tempfile::TempDir,
        staging_dir: PathBuf,
        uploads: Arc<UploadQueue>,
        loader: Arc<SceneLoader>,
    }

    fn rig(fetcher: StubFetcher, workers: usize) -> Rig {
        let staging = tempfile::tempdir().unwrap();
        let staging_dir = staging.path().to_path_buf();
        let uploads = Arc::new(UploadQueue::new());
        let loader = SceneLoader::new(
            Arc::new(fetcher),
            uploads.clone(),
            LoaderConfig {
                worker_count: workers,
                staging_dir: staging_dir.clone(),
                parse_delay: Duration::ZERO,
            },
        );
        Rig {
            _staging: staging,
            staging_dir,
            uploads,
            loader,
        }
    }

    #[test]
    fn happy_path_loads_parses_and_uploads() {
        let fetcher = StubFetcher::new().with_scene("sA", &[("m1.obj", TRIANGLE_OBJ)]);
        let rig = rig(fetcher, 2);

        let desc = SceneDescriptor::new("sA");
        assert!(rig.loader.enqueue(&desc));
        assert!(!rig.loader.enqueue(&desc)); // already queued

        assert!(wait_for(
            || desc.state.load() == SceneState::Loaded,
            Duration::from_secs(5)
        ));

        {
            let shared = desc.lock();
            assert_eq!(shared.models.len(), 1);
            assert_eq!(
                shared.models[0].bytes_received(),
                TRIANGLE_OBJ.len() as u64
            );
            assert!(shared.models[0].parsed());
            // Handles are installed by the render drain, not by LOADED.
            assert!(shared.mesh_handles[0].is_null());
            assert!(shared.model_bounds[0].radius > 0.49);
        }

        let mut renderer = NullRenderer::new();
        rig.uploads.drain(&mut renderer);
        assert_eq!(renderer.uploads, 1);
        assert!(!desc.lock().mesh_handles[0].is_null());

        rig.loader.shutdown();
    }

    #[test]
    fn missing_scene_ends_in_error_with_empty_models() {
        let rig = rig(StubFetcher::new(), 1);
        let desc = SceneDescriptor::new("missing");
        rig.loader.enqueue(&desc);

        assert!(wait_for(
            || desc.state.load() == SceneState::Error,
            Duration::from_secs(5)
        ));
        assert!(desc.lock().models.is_empty());
        rig.loader.shutdown();
    }

    #[test]
    fn empty_manifest_goes_straight_to_loaded() {
        let fetcher = StubFetcher::new().with_scene("empty", &[]);
        let rig = rig(fetcher, 1);
        let desc = SceneDescriptor::new("empty");
        rig.loader.enqueue(&desc);

        assert!(wait_for(
            || desc.state.load() == SceneState::Loaded,
            Duration::from_secs(5)
        ));
        assert!(rig.uploads.is_empty());
        rig.loader.shutdown();
    }

    #[test]
    fn zero_byte_model_still_loads() {
        let fetcher = StubFetcher::new().with_scene("z", &[("empty.obj", b"")]);
        let rig = rig(fetcher, 1);
        let desc = SceneDescriptor::new("z");
        rig.loader.enqueue(&desc);

        assert!(wait_for(
            || desc.state.load() == SceneState::Loaded,
            Duration::from_secs(5)
        ));
        let shared = desc.lock();
        assert!(shared.models[0].parsed());
        assert_eq!(shared.models[0].bytes_received(), 0);
        assert_eq!(shared.model_bounds[0], ModelBounds::default());
        drop(shared);
        rig.loader.shutdown();
    }

    #[test]
    fn cancellation_resolves_to_unloaded_and_removes_the_staging_file() {
        let mut fetcher = StubFetcher::new();
        fetcher.chunk_size = 64;
        fetcher.chunk_delay = Duration::from_millis(5);
        let big: Vec<u8> = TRIANGLE_OBJ.repeat(200);
        let fetcher = fetcher.with_scene("sBig", &[("big.obj", &big)]);
        let rig = rig(fetcher, 1);

        let desc = SceneDescriptor::new("sBig");
        rig.loader.enqueue(&desc);

        assert!(wait_for(
            || {
                let shared = desc.lock();
                shared
                    .models
                    .first()
                    .map(|m| m.bytes_received() > 0)
                    .unwrap_or(false)
            },
            Duration::from_secs(5)
        ));

        desc.cancel.cancel();
        assert!(wait_for(
            || desc.state.load() == SceneState::Unloaded,
            Duration::from_secs(5)
        ));
        assert!(!rig.staging_dir.join("sBig").join("big.obj").exists());
        rig.loader.shutdown();
    }

    #[test]
    fn unparseable_model_is_a_parse_error() {
        let fetcher = StubFetcher::new().with_scene("bad", &[("bad.obj", b"f 1 2 99\n")]);
        let rig = rig(fetcher, 1);
        let desc = SceneDescriptor::new("bad");
        rig.loader.enqueue(&desc);

        assert!(wait_for(
            || desc.state.load() == SceneState::Error,
            Duration::from_secs(5)
        ));
        rig.loader.shutdown();
    }

    #[test]
    fn reenqueue_from_error_is_allowed() {
        let fetcher = StubFetcher::new().with_scene("sA", &[("m1.obj", TRIANGLE_OBJ)]);
        let rig = rig(fetcher, 1);
        let desc = SceneDescriptor::new("nope");
        rig.loader.enqueue(&desc);
        assert!(wait_for(
            || desc.state.load() == SceneState::Error,
            Duration::from_secs(5)
        ));
        // The UI may explicitly retry out of ERROR.
        assert!(rig.loader.enqueue(&desc));
        rig.loader.shutdown();
    }

    #[test]
    fn stale_upload_task_does_not_install_into_a_new_generation() {
        let desc = SceneDescriptor::new("s");
        desc.lock().adopt(
            vec![Arc::new(ModelProgress::new("m".into(), "m.obj".into(), 1))],
            Vec::new(),
        );

        let uploads = Arc::new(UploadQueue::new());
        let ctx_uploads = uploads.clone();
        let generation = desc.generation();
        let weak = Arc::downgrade(&desc);
        let mesh = MeshData {
            positions: vec![0.0; 9],
            indices: vec![0, 1, 2],
        };
        ctx_uploads.push(Box::new(move |renderer: &mut dyn MeshRenderer| {
            let Some(desc) = weak.upgrade() else { return };
            if desc.generation() != generation {
                return;
            }
            let handle = renderer.upload_mesh(&mesh.positions, &mesh.indices);
            let mut shared = desc.lock();
            if desc.generation() == generation && !shared.mesh_handles.is_empty() {
                shared.mesh_handles[0] = handle;
            } else {
                drop(shared);
                renderer.destroy_mesh(handle);
            }
        }));

        // Unload-and-readopt before the render thread drains.
        desc.bump_generation();

        let mut renderer = NullRenderer::new();
        uploads.drain(&mut renderer);
        assert_eq!(renderer.uploads, 0);
        assert!(desc.lock().mesh_handles[0].is_null());
    }

    #[test]
    fn normalization_produces_a_unit_cube_transform() {
        let mesh = MeshData {
            positions: vec![1.0, 1.0, 1.0, 3.0, 5.0, 2.0],
            indices: vec![0, 1],
        };
        let (transform, bounds) = normalize_mesh(&mesh);

        // Largest extent is 4 (y), so scale is 0.25 and the center maps to 0.
        let center = transform.transform_point3(Vec3::new(2.0, 3.0, 1.5));
        assert!(center.length() < 1e-6);
        let corner = transform.transform_point3(Vec3::new(3.0, 5.0, 2.0));
        assert!((corner.y - 0.5).abs() < 1e-6);
        assert_eq!(bounds.center, Vec3::ZERO);
        assert!((bounds.radius - 0.5).abs() < 1e-6);
    }

    #[test]
    fn degenerate_mesh_normalizes_with_unit_scale() {
        let mesh = MeshData {
            positions: vec![7.0, 7.0, 7.0],
            indices: vec![0],
        };
        let (transform, bounds) = normalize_mesh(&mesh);
        let p = transform.transform_point3(Vec3::splat(7.0));
        assert!(p.length() < 1e-6);
        assert_eq!(bounds.radius, 0.0);
    }
}
