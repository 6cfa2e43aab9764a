use anyhow::{Context, Result};
use clap::Parser;
use scene_viewer::{
    app::{self, FrameContext},
    fault::FaultProbe,
    net::GrpcSceneClient,
    renderer::{context::GfxContext, mesh::WgpuRenderer, NullRenderer},
    scene::{
        loader::{LoaderConfig, SceneLoader},
        scheduler::{SceneScheduler, SchedulerConfig},
        store::SceneStore,
        types::SceneState,
    },
    shutdown,
    ui_log::UiLog,
    upload::UploadQueue,
};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing_subscriber::{fmt, EnvFilter};
use winit::{
    event::{Event, WindowEvent},
    event_loop::EventLoop,
    window::WindowBuilder,
};

/// Interactive scene viewer. Streams models from a scene content server,
/// loads them in the background, and renders whatever has finished
/// uploading while loading continues.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Address of the scene content server.
    #[arg(default_value = "localhost:50051")]
    server_addr: String,

    /// Scene ids to register at startup.
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "scene01,scene02,scene03,scene04,scene05"
    )]
    scenes: Vec<String>,

    /// Loader worker threads.
    #[arg(long, default_value_t = 4, env = "VIEWER_WORKERS")]
    workers: usize,

    /// Admission cap: maximum scenes loading at once.
    #[arg(long, default_value_t = 5, env = "VIEWER_MAX_LOADING")]
    max_loading: usize,

    /// Staging directory for streamed model files.
    #[arg(long, default_value = "tmp")]
    staging_dir: PathBuf,

    /// Artificial delay after each model parse, in milliseconds.
    #[arg(long, default_value_t = 0)]
    parse_delay_ms: u64,

    /// Run the pipeline without a window or GPU (null renderer); exits once
    /// every scene has settled.
    #[arg(long)]
    headless: bool,

    /// Sample loading progress and write fault_test_results.txt when all
    /// scenes finish.
    #[arg(long)]
    fault_probe: bool,
}

fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let args = Args::parse();

    let ui_log = Arc::new(UiLog::new("loading_ui_log.txt"));
    ui_log.append("App started");
    tracing::info!(server_addr = %args.server_addr, "Starting scene viewer");

    let store = Arc::new(SceneStore::new());
    let uploads = Arc::new(UploadQueue::new());
    let fetcher = Arc::new(
        GrpcSceneClient::connect_lazy(&args.server_addr)
            .context("Failed to set up the gRPC client")?,
    );

    let loader = SceneLoader::new(
        fetcher,
        uploads.clone(),
        LoaderConfig {
            worker_count: args.workers,
            staging_dir: args.staging_dir.clone(),
            parse_delay: Duration::from_millis(args.parse_delay_ms),
        },
    );
    let scheduler = SceneScheduler::new(
        store.clone(),
        loader.clone(),
        uploads.clone(),
        args.staging_dir.clone(),
        SchedulerConfig {
            max_loading: args.max_loading,
            ..Default::default()
        },
    );

    for scene_id in &args.scenes {
        scheduler.register(scene_id);
        ui_log.append(&format!("Registered scene {scene_id}"));
    }
    scheduler.start();

    let mut frame = FrameContext::new(store.clone(), uploads.clone(), ui_log.clone());
    if args.fault_probe {
        frame.fault_probe = Some(FaultProbe::start(
            Duration::from_millis(500),
            Duration::from_secs(3),
        ));
        ui_log.append("FaultProbe: started");
    }

    let result = if args.headless {
        run_headless(frame, &scheduler, &loader, &store, &uploads, &ui_log)
    } else {
        run_windowed(frame, scheduler.clone(), loader.clone(), store, uploads, ui_log.clone())
    };

    ui_log.append("Shutdown complete, exiting");
    result
}

fn run_windowed(
    mut frame: FrameContext,
    scheduler: Arc<SceneScheduler>,
    loader: Arc<SceneLoader>,
    store: Arc<SceneStore>,
    uploads: Arc<UploadQueue>,
    ui_log: Arc<UiLog>,
) -> Result<()> {
    let event_loop = EventLoop::new().context("Failed to create event loop")?;
    let window = Arc::new(
        WindowBuilder::new()
            .with_title("Scene Viewer")
            .with_inner_size(winit::dpi::LogicalSize::new(1280.0, 720.0))
            .build(&event_loop)
            .context("Failed to create window")?,
    );

    let gfx = pollster::block_on(GfxContext::new(window.clone()))
        .context("Failed to initialize the render context")?;
    let mut renderer = WgpuRenderer::new(gfx);
    let mut shut_down = false;

    event_loop
        .run(move |event, elwt| match event {
            Event::WindowEvent { event, .. } => match event {
                WindowEvent::CloseRequested => elwt.exit(),
                WindowEvent::Resized(size) => renderer.resize(size),
                WindowEvent::RedrawRequested => {
                    let draws = frame.begin_frame(&mut renderer);
                    let view_proj = app::view_proj(renderer.aspect(), frame.store.len());
                    match renderer.render(&draws, view_proj) {
                        Ok(()) => {}
                        Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                            renderer.reconfigure()
                        }
                        Err(wgpu::SurfaceError::OutOfMemory) => {
                            tracing::error!("Surface out of memory; exiting");
                            elwt.exit();
                        }
                        Err(e) => tracing::warn!(error = %e, "Surface error"),
                    }
                }
                _ => {}
            },
            Event::AboutToWait => window.request_redraw(),
            Event::LoopExiting => {
                if !shut_down {
                    shut_down = true;
                    ui_log.append("App exiting - initiating graceful shutdown");
                    shutdown::run(
                        &scheduler,
                        &loader,
                        &store,
                        &uploads,
                        &mut renderer,
                        &ui_log,
                    );
                }
            }
            _ => {}
        })
        .context("Event loop failed")?;

    Ok(())
}

/// Frame-timer loop against the null renderer; useful on CI and for the
/// fault probe. Ends once nothing is loading and nothing more would be
/// admitted.
fn run_headless(
    mut frame: FrameContext,
    scheduler: &SceneScheduler,
    loader: &SceneLoader,
    store: &SceneStore,
    uploads: &UploadQueue,
    ui_log: &UiLog,
) -> Result<()> {
    tracing::info!("Running headless (null renderer)");
    let mut renderer = NullRenderer::new();

    loop {
        let _ = frame.begin_frame(&mut renderer);

        let snapshot = store.snapshot();
        let busy = snapshot
            .iter()
            .any(|d| matches!(d.state.load(), SceneState::Queued | SceneState::Loading));
        let active = snapshot
            .iter()
            .filter(|d| matches!(d.state.load(), SceneState::Loading | SceneState::Loaded))
            .count();
        let admissible = active < scheduler.config().max_loading
            && snapshot
                .iter()
                .any(|d| d.state.load() == SceneState::Unloaded);

        if !busy && !admissible && uploads.is_empty() {
            break;
        }
        std::thread::sleep(Duration::from_millis(16));
    }

    for desc in store.snapshot() {
        tracing::info!(scene_id = %desc.scene_id, state = ?desc.state.load(), "Final scene state");
    }

    ui_log.append("Headless run settled - initiating graceful shutdown");
    shutdown::run(scheduler, loader, store, uploads, &mut renderer, ui_log);
    Ok(())
}
