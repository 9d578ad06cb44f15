// Wayland integration module
// Owns the protocol object graph and drives the configure -> draw -> commit handshake

use crate::error::OverlayError;
use crate::geometry::TargetGeometry;
use crate::packer;
use crate::scaler::ScaledImage;
use crate::shm::ShmRegion;
use crate::signal::ShutdownSignal;
use anyhow::{Context, Result};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use smithay_client_toolkit::{
    compositor::{CompositorHandler, CompositorState},
    delegate_compositor, delegate_layer, delegate_output, delegate_registry, delegate_shm,
    output::{OutputHandler, OutputState},
    registry::{ProvidesRegistryState, RegistryState},
    registry_handlers,
    shell::{
        wlr_layer::{
            Anchor, KeyboardInteractivity, Layer, LayerShell, LayerShellHandler, LayerSurface,
            LayerSurfaceConfigure,
        },
        WaylandSurface,
    },
    shm::{Shm, ShmHandler},
};
use std::os::fd::AsFd;
use wayland_client::{
    backend::WaylandError,
    globals::{registry_queue_init, GlobalList},
    protocol::{wl_buffer, wl_output, wl_region, wl_shm, wl_shm_pool, wl_surface},
    Connection, Dispatch, EventQueue, QueueHandle,
};

pub const SHM_INTERFACE: &str = "wl_shm";
pub const COMPOSITOR_INTERFACE: &str = "wl_compositor";
pub const LAYER_SHELL_INTERFACE: &str = "zwlr_layer_shell_v1";
pub const OUTPUT_INTERFACE: &str = "wl_output";

/// Globals the session cares about. Everything else in the registry is
/// ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Shm,
    Compositor,
    LayerShell,
    Output,
}

impl Interest {
    const ALL: [Interest; 4] = [
        Interest::Shm,
        Interest::Compositor,
        Interest::LayerShell,
        Interest::Output,
    ];

    pub fn interface(self) -> &'static str {
        match self {
            Interest::Shm => SHM_INTERFACE,
            Interest::Compositor => COMPOSITOR_INTERFACE,
            Interest::LayerShell => LAYER_SHELL_INTERFACE,
            Interest::Output => OUTPUT_INTERFACE,
        }
    }

    pub fn from_interface(interface: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|i| i.interface() == interface)
    }

    pub fn is_mandatory(self) -> bool {
        !matches!(self, Interest::Output)
    }
}

/// What one registry snapshot announced
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Announced {
    pub shm: bool,
    pub compositor: bool,
    pub layer_shell: bool,
    pub outputs: usize,
}

impl Announced {
    pub fn from_interfaces<'a>(interfaces: impl IntoIterator<Item = &'a str>) -> Self {
        let mut announced = Self::default();
        for interface in interfaces {
            match Interest::from_interface(interface) {
                Some(Interest::Shm) => announced.shm = true,
                Some(Interest::Compositor) => announced.compositor = true,
                Some(Interest::LayerShell) => announced.layer_shell = true,
                Some(Interest::Output) => announced.outputs += 1,
                None => continue,
            }
            debug!("Global of interest: {}", interface);
        }
        announced
    }

    fn has(&self, interest: Interest) -> bool {
        match interest {
            Interest::Shm => self.shm,
            Interest::Compositor => self.compositor,
            Interest::LayerShell => self.layer_shell,
            Interest::Output => self.outputs > 0,
        }
    }

    /// Interfaces of mandatory globals that were not announced
    pub fn missing(&self) -> Vec<&'static str> {
        Interest::ALL
            .into_iter()
            .filter(|i| i.is_mandatory() && !self.has(*i))
            .map(Interest::interface)
            .collect()
    }

    pub fn require_mandatory(&self) -> Result<(), OverlayError> {
        let missing = self.missing();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(OverlayError::Protocol(format!(
                "compositor does not provide {}",
                missing.join(", ")
            )))
        }
    }
}

/// The mandatory globals, bound
struct BoundGlobals {
    layer_shell: LayerShell,
    compositor: CompositorState,
    shm: Shm,
}

impl BoundGlobals {
    fn bind(globals: &GlobalList, qh: &QueueHandle<OverlayApp>) -> Result<Self> {
        let announced = globals.contents().with_list(|list| {
            Announced::from_interfaces(list.iter().map(|g| g.interface.as_str()))
        });
        debug!("Registry snapshot: {:?}", announced);
        announced.require_mandatory()?;

        let shm = Shm::bind(globals, qh).context("Failed to bind wl_shm")?;
        let compositor = CompositorState::bind(globals, qh).context("Failed to bind wl_compositor")?;
        let layer_shell = LayerShell::bind(globals, qh).context("Failed to bind zwlr_layer_shell_v1")?;

        Ok(Self {
            layer_shell,
            compositor,
            shm,
        })
    }
}

/// Pick the output whose announced name is exactly `requested`
pub fn select_output<T: Clone>(
    requested: &str,
    candidates: &[(T, Option<String>)],
) -> Result<T, OverlayError> {
    candidates
        .iter()
        .find(|(_, name)| name.as_deref() == Some(requested))
        .map(|(output, _)| output.clone())
        .ok_or_else(|| OverlayError::Protocol(format!("output not found: {requested}")))
}

/// Session progress, in the order the phases are entered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Enumerating,
    AwaitingOutput,
    SurfaceCreated,
    AwaitingConfigure,
    Configured { frames: u64 },
}

/// How the dispatch loop ended without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Signal(&'static str),
    Closed,
}

/// Layer surface placement
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub anchor: Anchor,
    pub margin: i32,
    pub output: Option<String>,
    pub namespace: String,
}

/// The surface side of one frame submission
pub trait Presenter {
    type Buffer;

    /// Echo the size the compositor settled on
    fn set_size(&mut self, width: u32, height: u32);

    /// Create a protocol buffer backed by `region`
    fn create_buffer(&mut self, region: &ShmRegion, geometry: TargetGeometry) -> Self::Buffer;

    /// Attach `buffer` at (0, 0), damage all of it and commit
    fn attach_and_commit(&mut self, buffer: &Self::Buffer, geometry: TargetGeometry);
}

/// Size to echo back for a configure. Zero means the compositor left the
/// choice to us.
pub fn settled_size(proposed: (u32, u32), geometry: TargetGeometry) -> (u32, u32) {
    match proposed {
        (0, 0) => {
            debug!(
                "Compositor left the size to us, using {}x{}",
                geometry.width, geometry.height
            );
            (geometry.width, geometry.height)
        }
        (0, _) | (_, 0) => {
            warn!(
                "Compositor proposed {}x{}, keeping {}x{}",
                proposed.0, proposed.1, geometry.width, geometry.height
            );
            (geometry.width, geometry.height)
        }
        size => size,
    }
}

/// Answer one configure: re-assert the size, pack a fresh shared memory
/// buffer, hand it over and commit.
///
/// The region is unmapped and closed before the commit; the returned
/// buffer lives on the compositor side until it is released.
pub fn present_frame<P: Presenter>(
    presenter: &mut P,
    image: &ScaledImage,
    proposed: (u32, u32),
) -> Result<P::Buffer, OverlayError> {
    let geometry = image.geometry();
    let (width, height) = settled_size(proposed, geometry);
    presenter.set_size(width, height);

    let mut region = ShmRegion::allocate(geometry.byte_len())?;
    packer::pack(image.pixels(), region.as_mut_slice())?;
    let buffer = presenter.create_buffer(&region, geometry);
    drop(region);

    presenter.attach_and_commit(&buffer, geometry);
    Ok(buffer)
}

/// Presents into the real layer surface
struct SurfacePresenter<'a> {
    layer: &'a LayerSurface,
    shm: &'a wl_shm::WlShm,
    qh: &'a QueueHandle<OverlayApp>,
}

impl Presenter for SurfacePresenter<'_> {
    type Buffer = wl_buffer::WlBuffer;

    fn set_size(&mut self, width: u32, height: u32) {
        self.layer.set_size(width, height);
    }

    fn create_buffer(&mut self, region: &ShmRegion, geometry: TargetGeometry) -> wl_buffer::WlBuffer {
        // ShmRegion::allocate caps the length at i32::MAX
        let pool = self.shm.create_pool(region.as_fd(), region.len() as i32, self.qh, ());
        let buffer = pool.create_buffer(
            0,
            geometry.width as i32,
            geometry.height as i32,
            geometry.stride() as i32,
            wl_shm::Format::Argb8888,
            self.qh,
            (),
        );
        pool.destroy();
        buffer
    }

    fn attach_and_commit(&mut self, buffer: &wl_buffer::WlBuffer, geometry: TargetGeometry) {
        let surface = self.layer.wl_surface();
        surface.attach(Some(buffer), 0, 0);
        surface.damage_buffer(0, 0, geometry.width as i32, geometry.height as i32);
        surface.commit();
    }
}

/// Main Wayland session state
struct OverlayApp {
    // Declared in reverse creation order, which is the teardown order
    layer_surface: Option<LayerSurface>,
    image: ScaledImage,
    output_state: OutputState,
    globals: BoundGlobals,
    registry_state: RegistryState,

    phase: Phase,
    buffers_in_flight: usize,
    error: Option<OverlayError>,
    closed: bool,
}

impl OverlayApp {
    fn new(
        registry_state: RegistryState,
        globals: BoundGlobals,
        output_state: OutputState,
        image: ScaledImage,
    ) -> Self {
        Self {
            layer_surface: None,
            image,
            output_state,
            globals,
            registry_state,
            phase: Phase::Enumerating,
            buffers_in_flight: 0,
            error: None,
            closed: false,
        }
    }

    fn enter(&mut self, phase: Phase) {
        debug!("Session phase {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    /// Outputs with the names they announced so far
    fn named_outputs(&self) -> Vec<(wl_output::WlOutput, Option<String>)> {
        self.output_state
            .outputs()
            .map(|output| {
                let name = self.output_state.info(&output).and_then(|info| info.name);
                (output, name)
            })
            .collect()
    }

    /// Create the click-through overlay surface and make the initial,
    /// buffer-less commit
    fn create_layer_surface(
        &mut self,
        qh: &QueueHandle<Self>,
        config: &SessionConfig,
        output: Option<&wl_output::WlOutput>,
    ) {
        let geometry = self.image.geometry();
        let surface = self.globals.compositor.create_surface(qh);

        // An empty input region lets every pointer event fall through
        let region = self.globals.compositor.wl_compositor().create_region(qh, ());
        surface.set_input_region(Some(&region));
        region.destroy();

        let layer_surface = self.globals.layer_shell.create_layer_surface(
            qh,
            surface,
            Layer::Overlay,
            Some(config.namespace.as_str()),
            output,
        );
        layer_surface.set_size(geometry.width, geometry.height);
        layer_surface.set_anchor(config.anchor);
        layer_surface.set_margin(config.margin, config.margin, config.margin, config.margin);
        layer_surface.set_keyboard_interactivity(KeyboardInteractivity::None);

        // Commit without a buffer to request the first configure
        layer_surface.commit();

        self.layer_surface = Some(layer_surface);
        self.enter(Phase::SurfaceCreated);
    }

    /// Destroy protocol objects newest first, then flush the destructors
    fn teardown(self, conn: &Connection) {
        let OverlayApp {
            layer_surface,
            image,
            output_state,
            globals,
            registry_state,
            buffers_in_flight,
            ..
        } = self;

        debug!("Tearing down ({} buffer(s) still held by the compositor)", buffers_in_flight);
        drop(layer_surface);
        drop(output_state);
        drop(globals);
        drop(registry_state);
        drop(image);

        if let Err(e) = conn.flush() {
            debug!("Flush during teardown failed: {}", e);
        }
    }
}

impl CompositorHandler for OverlayApp {
    fn scale_factor_changed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        new_factor: i32,
    ) {
        debug!("Scale factor changed to {}", new_factor);
    }

    fn transform_changed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _new_transform: wl_output::Transform,
    ) {
    }

    fn frame(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _time: u32,
    ) {
    }

    fn surface_enter(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        output: &wl_output::WlOutput,
    ) {
        let name = self.output_state.info(output).and_then(|info| info.name);
        debug!("Surface entered output {:?}", name);
    }

    fn surface_leave(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _output: &wl_output::WlOutput,
    ) {
    }
}

impl OutputHandler for OverlayApp {
    fn output_state(&mut self) -> &mut OutputState {
        &mut self.output_state
    }

    fn new_output(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        output: wl_output::WlOutput,
    ) {
        let name = self.output_state.info(&output).and_then(|info| info.name);
        debug!("New output {:?}", name);
    }

    fn update_output(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _output: wl_output::WlOutput,
    ) {
    }

    fn output_destroyed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _output: wl_output::WlOutput,
    ) {
        debug!("Output destroyed");
    }
}

impl LayerShellHandler for OverlayApp {
    fn closed(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, _layer: &LayerSurface) {
        info!("Layer surface closed");
        self.closed = true;
    }

    fn configure(
        &mut self,
        _conn: &Connection,
        qh: &QueueHandle<Self>,
        layer: &LayerSurface,
        configure: LayerSurfaceConfigure,
        serial: u32,
    ) {
        // The toolkit has already sent ack_configure for this serial
        debug!("Configure {} proposing {:?}", serial, configure.new_size);

        let mut presenter = SurfacePresenter {
            layer,
            shm: self.globals.shm.wl_shm(),
            qh,
        };
        if let Err(e) = present_frame(&mut presenter, &self.image, configure.new_size) {
            self.error = Some(e);
            return;
        }

        self.buffers_in_flight += 1;
        if self.buffers_in_flight > 1 {
            warn!("{} buffers held by the compositor", self.buffers_in_flight);
        }

        let frames = match self.phase {
            Phase::Configured { frames } => frames + 1,
            _ => 1,
        };
        if frames == 1 {
            let geometry = self.image.geometry();
            info!("First frame committed ({}x{})", geometry.width, geometry.height);
        }
        self.enter(Phase::Configured { frames });
    }
}

impl ShmHandler for OverlayApp {
    fn shm_state(&mut self) -> &mut Shm {
        &mut self.globals.shm
    }
}

impl ProvidesRegistryState for OverlayApp {
    fn registry(&mut self) -> &mut RegistryState {
        &mut self.registry_state
    }

    registry_handlers![OutputState];
}

impl Dispatch<wl_shm_pool::WlShmPool, ()> for OverlayApp {
    fn event(
        _state: &mut Self,
        _pool: &wl_shm_pool::WlShmPool,
        _event: wl_shm_pool::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<wl_buffer::WlBuffer, ()> for OverlayApp {
    fn event(
        state: &mut Self,
        buffer: &wl_buffer::WlBuffer,
        event: wl_buffer::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wl_buffer::Event::Release = event {
            // The compositor is done with it and we never reuse buffers
            buffer.destroy();
            state.buffers_in_flight = state.buffers_in_flight.saturating_sub(1);
            debug!("Buffer released ({} in flight)", state.buffers_in_flight);
        }
    }
}

impl Dispatch<wl_region::WlRegion, ()> for OverlayApp {
    fn event(
        _state: &mut Self,
        _region: &wl_region::WlRegion,
        _event: wl_region::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

// Delegate macros
delegate_compositor!(OverlayApp);
delegate_output!(OverlayApp);
delegate_layer!(OverlayApp);
delegate_shm!(OverlayApp);
delegate_registry!(OverlayApp);

/// Run the overlay until a shutdown signal, the compositor closing the
/// surface, or a fatal error
pub fn run(image: ScaledImage, config: SessionConfig, mut shutdown: ShutdownSignal) -> Result<Shutdown> {
    debug!("Session phase {:?}", Phase::Connecting);
    info!("Connecting to Wayland display");
    let conn = Connection::connect_to_env().context("Failed to connect to Wayland display")?;

    // One full round-trip of the registry
    let (globals, mut event_queue) =
        registry_queue_init(&conn).context("Failed to initialize registry")?;
    let qh = event_queue.handle();

    let bound = BoundGlobals::bind(&globals, &qh)?;
    let mut app = OverlayApp::new(
        RegistryState::new(&globals),
        bound,
        OutputState::new(&globals, &qh),
        image,
    );

    let output = match config.output.as_deref() {
        Some(requested) => {
            app.enter(Phase::AwaitingOutput);
            event_queue
                .roundtrip(&mut app)
                .context("Failed to receive output information")?;

            let candidates = app.named_outputs();
            for (_, name) in &candidates {
                debug!("Announced output {:?}", name);
            }
            let output = select_output(requested, &candidates)?;
            info!("Using output {}", requested);
            Some(output)
        }
        None => None,
    };

    app.create_layer_surface(&qh, &config, output.as_ref());
    app.enter(Phase::AwaitingConfigure);

    let result = dispatch_loop(&mut event_queue, &mut app, &mut shutdown);
    app.teardown(&conn);
    result
}

/// What the dispatch loop checks after every batch of events
trait SessionStatus {
    /// A fatal error raised by a handler, taken once
    fn take_error(&mut self) -> Option<OverlayError>;

    /// The compositor closed the surface
    fn is_closed(&self) -> bool;
}

impl SessionStatus for OverlayApp {
    fn take_error(&mut self) -> Option<OverlayError> {
        self.error.take()
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Block on the Wayland socket and the shutdown descriptor together,
/// dispatching events strictly in arrival order
fn dispatch_loop<S: SessionStatus>(
    event_queue: &mut EventQueue<S>,
    app: &mut S,
    shutdown: &mut ShutdownSignal,
) -> Result<Shutdown> {
    loop {
        event_queue
            .dispatch_pending(app)
            .context("Failed to dispatch Wayland events")?;
        if let Some(e) = app.take_error() {
            return Err(e.into());
        }
        if app.is_closed() {
            return Ok(Shutdown::Closed);
        }

        event_queue.flush().map_err(connection_lost)?;

        let Some(guard) = event_queue.prepare_read() else {
            continue;
        };

        let (wayland_ready, signal_ready) = {
            let mut fds = [
                PollFd::new(guard.connection_fd(), PollFlags::POLLIN),
                PollFd::new(shutdown.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e).context("Failed to poll"),
            }
            (is_ready(&fds[0]), is_ready(&fds[1]))
        };

        if signal_ready {
            drop(guard);
            if let Some(name) = shutdown.take()? {
                info!("Received {}", name);
                return Ok(Shutdown::Signal(name));
            }
            continue;
        }

        if wayland_ready {
            match guard.read() {
                Ok(_) => {}
                Err(WaylandError::Io(e)) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(connection_lost(e).into()),
            }
        }
    }
}

fn is_ready(fd: &PollFd) -> bool {
    fd.revents()
        .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR))
}

fn connection_lost(e: WaylandError) -> OverlayError {
    OverlayError::Protocol(format!("connection to the compositor lost: {e}"))
}
