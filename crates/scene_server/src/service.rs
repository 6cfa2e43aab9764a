use api::gen::scene::v1::{
    scene_service_server::{SceneService, SceneServiceServer},
    Chunk, ModelInfo, ModelRequest, SceneManifest, SceneRequest,
};
use futures::Stream;
use std::{
    path::{Component, Path, PathBuf},
    pin::Pin,
    time::Duration,
};
use tokio::{fs, io::AsyncReadExt, sync::mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

/// Thumbnail file names probed in order; the first hit is embedded raw.
const THUMBNAIL_CANDIDATES: &[&str] = &["thumbnail.png", "thumbnail.jpg", "thumb.png", "thumb.jpg"];

/// Filesystem-backed implementation of the `SceneService` RPCs. Scenes are
/// directories under `media_root`; models are the `.obj` files inside them.
pub struct SceneServiceImpl {
    media_root: PathBuf,
    chunk_size: usize,
    chunk_delay: Duration,
}

impl SceneServiceImpl {
    pub fn new(media_root: PathBuf, chunk_size: usize, chunk_delay: Duration) -> Self {
        Self {
            media_root,
            chunk_size: chunk_size.max(1),
            chunk_delay,
        }
    }

    pub fn into_server(self) -> SceneServiceServer<Self> {
        SceneServiceServer::new(self)
    }
}

/// Accepts only plain relative paths: no absolute paths, no `..`, no prefixes.
/// Anything else resolves outside the media tree and is treated as absent.
fn is_safe_rel_path(rel: &str) -> bool {
    !rel.is_empty()
        && Path::new(rel)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

#[tonic::async_trait]
impl SceneService for SceneServiceImpl {
    /// Enumerates the scene directory into an ordered manifest. The order is
    /// sorted by file name so it is stable across runs; clients keep it as
    /// the canonical model index.
    async fn get_scene_manifest(
        &self,
        req: Request<SceneRequest>,
    ) -> Result<Response<SceneManifest>, Status> {
        let scene_id = req.into_inner().scene_id;
        if !is_safe_rel_path(&scene_id) {
            return Err(Status::not_found("scene not found"));
        }

        let scene_dir = self.media_root.join(&scene_id);
        let mut dir = fs::read_dir(&scene_dir)
            .await
            .map_err(|_| Status::not_found("scene not found"))?;

        let mut models = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| Status::internal(format!("scene directory read failed: {e}")))?
        {
            let path = entry.path();
            let meta = match entry.metadata().await {
                Ok(meta) if meta.is_file() => meta,
                _ => continue,
            };
            if path.extension().and_then(|s| s.to_str()) != Some("obj") {
                continue;
            }

            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let rel_path = path
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();

            models.push(ModelInfo {
                name,
                rel_path,
                size_bytes: meta.len(),
            });
        }
        models.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));

        let mut thumbnail = Vec::new();
        for candidate in THUMBNAIL_CANDIDATES {
            if let Ok(bytes) = fs::read(scene_dir.join(candidate)).await {
                thumbnail = bytes;
                break;
            }
        }

        tracing::info!(
            scene_id = %scene_id,
            models = models.len(),
            thumbnail = !thumbnail.is_empty(),
            "Served scene manifest"
        );

        Ok(Response::new(SceneManifest {
            scene_id,
            models,
            thumbnail,
        }))
    }

    type StreamModelStream = Pin<Box<dyn Stream<Item = Result<Chunk, Status>> + Send + 'static>>;

    /// Streams one model file as bounded chunks followed by a single empty
    /// terminator chunk. The bounded channel provides back-pressure: chunks
    /// are only read from disk as fast as the client consumes them.
    async fn stream_model(
        &self,
        req: Request<ModelRequest>,
    ) -> Result<Response<Self::StreamModelStream>, Status> {
        let req = req.into_inner();
        if !is_safe_rel_path(&req.scene_id) || !is_safe_rel_path(&req.model_rel_path) {
            return Err(Status::not_found("model not found"));
        }

        let path = self
            .media_root
            .join(&req.scene_id)
            .join(&req.model_rel_path);

        let meta = fs::metadata(&path)
            .await
            .map_err(|_| Status::not_found("model not found"))?;
        if !meta.is_file() {
            return Err(Status::not_found("model not found"));
        }

        let mut file = fs::File::open(&path)
            .await
            .map_err(|e| Status::internal(format!("failed to open model file: {e}")))?;

        tracing::info!(
            scene_id = %req.scene_id,
            rel_path = %req.model_rel_path,
            size_bytes = meta.len(),
            "Streaming model"
        );

        let (tx, rx) = mpsc::channel::<Result<Chunk, Status>>(4);
        let chunk_size = self.chunk_size;
        let chunk_delay = self.chunk_delay;

        tokio::spawn(async move {
            let mut buf = vec![0u8; chunk_size];
            let mut offset = 0u64;

            loop {
                let read = match file.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        let _ = tx
                            .send(Err(Status::internal(format!("model read failed: {e}"))))
                            .await;
                        return;
                    }
                };

                let chunk = Chunk {
                    data: buf[..read].to_vec(),
                    offset,
                    last: false,
                };
                if tx.send(Ok(chunk)).await.is_err() {
                    // The receiver is gone: the client cancelled the stream.
                    tracing::debug!(offset, "Client cancelled model stream");
                    return;
                }
                offset += read as u64;

                if !chunk_delay.is_zero() {
                    tokio::time::sleep(chunk_delay).await;
                }
            }

            let _ = tx
                .send(Ok(Chunk {
                    data: Vec::new(),
                    offset,
                    last: true,
                }))
                .await;
        });

        Ok(Response::new(
            Box::pin(ReceiverStream::new(rx)) as Self::StreamModelStream
        ))
    }
}
