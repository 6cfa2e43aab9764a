//! Blocking gRPC streaming client.
//!
//! Loader workers are plain OS threads, so this wraps a small tokio runtime
//! and the tonic stub behind synchronous calls; each call parks its worker
//! thread on `Runtime::block_on` while the transport does the async work.

use crate::scene::types::{CancelToken, LoadError};
use api::gen::scene::v1::{scene_service_client::SceneServiceClient, ModelRequest, SceneRequest};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};

/// A scene manifest shaped for descriptor adoption, decoupled from the wire
/// types so test fakes do not need the generated stubs.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub scene_id: String,
    pub models: Vec<ManifestModel>,
    pub thumbnail: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ManifestModel {
    pub name: String,
    pub rel_path: String,
    pub size_bytes: u64,
}

/// Capability seam over the content service: fetch a manifest, stream one
/// model's bytes into a staging file. Implemented by the gRPC client below
/// and by in-process fakes in tests.
///
/// `progress` receives `(bytes_so_far, size_bytes)` after every chunk write.
/// Invocations are non-decreasing in the first argument and run inline with
/// I/O on the calling thread, so the callback must stay cheap.
pub trait SceneFetcher: Send + Sync {
    fn fetch_manifest(&self, scene_id: &str) -> Result<Manifest, LoadError>;

    #[allow(clippy::too_many_arguments)]
    fn stream_model_to_file(
        &self,
        scene_id: &str,
        rel_path: &str,
        out_path: &Path,
        size_bytes: u64,
        progress: &(dyn Fn(u64, u64) + Send + Sync),
        cancel: &CancelToken,
    ) -> Result<(), LoadError>;
}

pub struct GrpcSceneClient {
    runtime: tokio::runtime::Runtime,
    channel: Channel,
}

impl GrpcSceneClient {
    /// Builds the runtime and a lazy channel; no I/O happens until the first
    /// call.
    pub fn connect_lazy(addr: &str) -> Result<Self, LoadError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|e| LoadError::Internal(format!("tokio runtime: {e}")))?;

        let endpoint = Endpoint::from_shared(normalize_addr(addr))
            .map_err(|e| LoadError::Transport(e.to_string()))?
            .keep_alive_while_idle(true)
            .http2_keep_alive_interval(Duration::from_secs(30))
            .keep_alive_timeout(Duration::from_secs(20))
            .connect_timeout(Duration::from_secs(5));

        Ok(Self {
            runtime,
            channel: endpoint.connect_lazy(),
        })
    }

    fn client(&self) -> SceneServiceClient<Channel> {
        SceneServiceClient::new(self.channel.clone())
    }
}

/// The CLI accepts bare `host:port`; tonic wants a scheme.
fn normalize_addr(addr: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_owned()
    } else {
        format!("http://{addr}")
    }
}

fn map_status(status: Status) -> LoadError {
    match status.code() {
        Code::NotFound => LoadError::NotFound,
        Code::Cancelled => LoadError::Cancelled,
        Code::Internal => LoadError::Internal(status.message().to_owned()),
        _ => LoadError::Transport(status.to_string()),
    }
}

impl SceneFetcher for GrpcSceneClient {
    fn fetch_manifest(&self, scene_id: &str) -> Result<Manifest, LoadError> {
        let mut client = self.client();
        let request = SceneRequest {
            scene_id: scene_id.to_owned(),
        };

        self.runtime.block_on(async move {
            let resp = client
                .get_scene_manifest(request)
                .await
                .map_err(map_status)?
                .into_inner();

            Ok(Manifest {
                scene_id: resp.scene_id,
                models: resp
                    .models
                    .into_iter()
                    .map(|m| ManifestModel {
                        name: m.name,
                        rel_path: m.rel_path,
                        size_bytes: m.size_bytes,
                    })
                    .collect(),
                thumbnail: resp.thumbnail,
            })
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
        let mut client = self.client();
        let request = ModelRequest {
            scene_id: scene_id.to_owned(),
            model_rel_path: rel_path.to_owned(),
            offset: 0,
        };

        let result = self.runtime.block_on(async {
            let mut stream = client
                .stream_model(request)
                .await
                .map_err(map_status)?
                .into_inner();

            let mut file = tokio::fs::File::create(out_path).await.map_err(|e| {
                LoadError::Internal(format!("create {}: {e}", out_path.display()))
            })?;

            let mut got = 0u64;
            loop {
                // Polled between chunk reads; dropping `stream` below is what
                // forwards the cancellation to the transport.
                if cancel.is_cancelled() {
                    return Err(LoadError::Cancelled);
                }

                let chunk = match stream.message().await {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => {
                        return Err(LoadError::Transport(
                            "stream ended without terminator".into(),
                        ))
                    }
                    Err(status) => return Err(map_status(status)),
                };

                if chunk.offset != got {
                    return Err(LoadError::Transport(format!(
                        "chunk offset {} does not match received byte count {got}",
                        chunk.offset
                    )));
                }

                if !chunk.data.is_empty() {
                    file.write_all(&chunk.data)
                        .await
                        .map_err(|e| LoadError::Internal(format!("write staging file: {e}")))?;
                    got += chunk.data.len() as u64;
                    progress(got, size_bytes);
                }

                if chunk.last {
                    file.flush()
                        .await
                        .map_err(|e| LoadError::Internal(format!("flush staging file: {e}")))?;
                    return Ok(());
                }
            }
        });

        if result.is_err() {
            // Partial staging files are never left behind.
            let _ = std::fs::remove_file(out_path);
        }
        result
    }
}
