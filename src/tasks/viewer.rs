use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wgpu::{self, SurfaceError};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

use crate::config::ParallaxConfig;
use crate::events::BackgroundLoaded;
use crate::parallax::DepthPlane;
use crate::pointer::PointerTracker;

#[derive(Debug)]
enum ViewerEvent {
    Cancelled,
}

type BackgroundReceiver = mpsc::Receiver<BackgroundLoaded>;

struct ViewerApp {
    parallax: ParallaxConfig,
    cancel: CancellationToken,
    pointer: PointerTracker,
    from_loader: BackgroundReceiver,
    /// Arrived before the GPU was ready; uploaded on init.
    pending: Option<BackgroundLoaded>,
    window: Option<Arc<Window>>,
    surface: Option<wgpu::Surface<'static>>,
    surface_config: Option<wgpu::SurfaceConfiguration>,
    device: Option<wgpu::Device>,
    queue: Option<wgpu::Queue>,
    plane: Option<DepthPlane>,
}

impl ViewerApp {
    fn new(
        parallax: ParallaxConfig,
        cancel: CancellationToken,
        pointer: PointerTracker,
        from_loader: BackgroundReceiver,
    ) -> Self {
        Self {
            parallax,
            cancel,
            pointer,
            from_loader,
            pending: None,
            window: None,
            surface: None,
            surface_config: None,
            device: None,
            queue: None,
            plane: None,
        }
    }

    fn ensure_window(&mut self, event_loop: &ActiveEventLoop) -> Option<Arc<Window>> {
        if let Some(window) = self.window.as_ref() {
            return Some(window.clone());
        }

        let attrs = WindowAttributes::default().with_title("Portrait Stage");
        match event_loop.create_window(attrs) {
            Ok(window) => {
                let window = Arc::new(window);
                self.window = Some(window.clone());
                Some(window)
            }
            Err(err) => {
                error!(error = %err, "failed to create viewer window");
                None
            }
        }
    }

    fn init_gpu(&mut self, window: Arc<Window>) -> Result<()> {
        let instance = wgpu::Instance::default();
        let surface = instance
            .create_surface(window.clone())
            .context("failed to create surface")?;
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: Some(&surface),
            force_fallback_adapter: false,
        }))
        .context("failed to acquire GPU adapter")?;

        let caps = surface.get_capabilities(&adapter);
        let format = caps
            .formats
            .iter()
            .copied()
            .find(|fmt| fmt.is_srgb())
            .or_else(|| caps.formats.first().copied())
            .context("surface reports no formats")?;
        let alpha_mode = caps
            .alpha_modes
            .first()
            .copied()
            .unwrap_or(wgpu::CompositeAlphaMode::Auto);

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("viewer-device"),
            required_features: wgpu::Features::empty(),
            required_limits: adapter.limits(),
            ..Default::default()
        }))
        .context("failed to acquire GPU device")?;

        let size = window.inner_size();
        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::AutoVsync,
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &config);
        self.pointer.set_viewport(config.width, config.height);
        info!(
            width = config.width,
            height = config.height,
            format = ?config.format,
            strategy = ?self.parallax.strategy,
            "viewer surface configured",
        );

        let mut plane = DepthPlane::new(&device, format, &self.parallax);
        if let Some(loaded) = self.pending.take() {
            plane.set_images(&device, &queue, &loaded.color, loaded.depth.as_ref());
        }

        self.surface = Some(surface);
        self.surface_config = Some(config);
        self.device = Some(device);
        self.queue = Some(queue);
        self.plane = Some(plane);
        Ok(())
    }

    fn handle_resize(&mut self, new_size: winit::dpi::PhysicalSize<u32>) {
        let (Some(surface), Some(device), Some(config)) = (
            self.surface.as_ref(),
            self.device.as_ref(),
            self.surface_config.as_mut(),
        ) else {
            return;
        };

        config.width = new_size.width.max(1);
        config.height = new_size.height.max(1);
        surface.configure(device, config);
        self.pointer.set_viewport(config.width, config.height);
        debug!(
            width = config.width,
            height = config.height,
            "viewer surface resized",
        );
        self.request_redraw();
    }

    /// Drain the loader channel, keeping only the newest background.
    fn poll_loader(&mut self) {
        let mut latest = None;
        loop {
            match self.from_loader.try_recv() {
                Ok(loaded) => latest = Some(loaded),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        let Some(loaded) = latest else {
            return;
        };
        match (self.device.as_ref(), self.queue.as_ref(), self.plane.as_mut()) {
            (Some(device), Some(queue), Some(plane)) => {
                plane.set_images(device, queue, &loaded.color, loaded.depth.as_ref());
            }
            _ => self.pending = Some(loaded),
        }
    }

    fn draw(&mut self, event_loop: &ActiveEventLoop) {
        let sample = self.pointer.tick();
        let (Some(surface), Some(device), Some(queue), Some(config), Some(window), Some(plane)) = (
            self.surface.as_ref(),
            self.device.as_ref(),
            self.queue.as_ref(),
            self.surface_config.as_ref(),
            self.window.as_ref(),
            self.plane.as_ref(),
        ) else {
            return;
        };

        let frame = match surface.get_current_texture() {
            Ok(frame) => frame,
            Err(SurfaceError::Outdated) | Err(SurfaceError::Lost) => {
                info!("viewer surface lost; reconfiguring");
                let size = window.inner_size();
                self.handle_resize(size);
                return;
            }
            Err(SurfaceError::OutOfMemory) => {
                error!("viewer surface out of memory; exiting event loop");
                event_loop.exit();
                return;
            }
            Err(SurfaceError::Timeout) => {
                warn!("viewer surface acquisition timed out");
                return;
            }
            Err(SurfaceError::Other) => {
                warn!("viewer surface reported an unknown error; retrying");
                let size = window.inner_size();
                self.handle_resize(size);
                return;
            }
        };

        plane.update(queue, sample, (config.width, config.height));

        let view = frame
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("viewer-encoder"),
        });
        {
            let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("background-pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    depth_slice: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });
            plane.draw(&mut rpass);
        }

        queue.submit(std::iter::once(encoder.finish()));
        frame.present();
    }

    fn request_redraw(&self) {
        if let Some(window) = self.window.as_ref() {
            window.request_redraw();
        }
    }
}

impl ApplicationHandler<ViewerEvent> for ViewerApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.cancel.is_cancelled() {
            event_loop.exit();
            return;
        }

        let Some(window) = self.ensure_window(event_loop) else {
            event_loop.exit();
            return;
        };

        if self.device.is_none() {
            if let Err(err) = self.init_gpu(window) {
                error!(error = ?err, "failed to initialize GPU state");
                event_loop.exit();
                return;
            }
        }

        self.request_redraw();
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        let Some(window) = self.window.as_ref() else {
            return;
        };
        if window.id() != window_id {
            return;
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("viewer window close requested");
                event_loop.exit();
            }
            WindowEvent::Resized(new_size) => {
                self.handle_resize(new_size);
            }
            WindowEvent::ScaleFactorChanged {
                mut inner_size_writer,
                ..
            } => {
                let size = window.inner_size();
                let _ = inner_size_writer.request_inner_size(size);
                self.handle_resize(size);
            }
            WindowEvent::CursorMoved { position, .. } => {
                self.pointer.moved((position.x, position.y));
            }
            WindowEvent::CursorLeft { .. } => {
                self.pointer.left();
            }
            WindowEvent::RedrawRequested => {
                self.draw(event_loop);
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        self.poll_loader();
        // Smoothing animates every frame; vsync paces the loop.
        self.request_redraw();
    }

    fn user_event(&mut self, event_loop: &ActiveEventLoop, event: ViewerEvent) {
        match event {
            ViewerEvent::Cancelled => {
                info!("viewer received cancellation event");
                event_loop.exit();
            }
        }
    }
}

/// Runs the preview window on the calling (main) thread until closed or
/// cancelled. Pointer samples are published through `pointer`'s subscribers.
pub fn run_windowed(
    from_loader: BackgroundReceiver,
    pointer: PointerTracker,
    cancel: CancellationToken,
    parallax: ParallaxConfig,
) -> Result<()> {
    let event_loop = EventLoop::<ViewerEvent>::with_user_event()
        .build()
        .context("failed to build viewer event loop")?;
    let proxy = event_loop.create_proxy();

    let cancel_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            let _ = proxy.send_event(ViewerEvent::Cancelled);
        })
    };

    let mut app = ViewerApp::new(parallax, cancel, pointer, from_loader);
    let run_result = event_loop.run_app(&mut app);
    cancel_task.abort();

    run_result.context("viewer event loop failed")
}
