//! Viewer application implementation.

use anyhow::Context as _;
use glam::Vec3;
use tracing::info;

use dk_app::{AppContext, DkApp, FrameContext};
use dk_gpu::Mesh;

/// Seconds for the clear colour to cycle once through the hue wheel.
const HUE_PERIOD: f32 = 6.0;

/// Triangle uploaded at start-up to exercise the staging path.
const TRIANGLE: [Vec3; 3] = [
    Vec3::new(0.0, -0.5, 0.0),
    Vec3::new(0.5, 0.5, 0.0),
    Vec3::new(-0.5, 0.5, 0.0),
];

/// Command line options of the viewer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewerParams {
    /// Exit after this many frames.
    pub frames: Option<u64>,
    pub vsync: bool,
}

impl ViewerParams {
    /// Parse the process arguments.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_args(std::env::args().skip(1))
    }

    /// Parse options from `args` (without the program name).
    pub fn from_args<I>(args: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut params = Self::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--frames" => {
                    let value = args.next().context("--frames needs a value")?;
                    let frames = value
                        .parse()
                        .with_context(|| format!("invalid frame count: {value}"))?;
                    params.frames = Some(frames);
                }
                "--vsync" => params.vsync = true,
                other => anyhow::bail!("unknown option: {other} (see --help)"),
            }
        }

        Ok(params)
    }
}

/// Viewer application state.
pub struct Viewer {
    params: ViewerParams,
    mesh: Mesh,
    time: f32,
    rendered: u64,
}

impl DkApp for Viewer {
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
        let params = ViewerParams::from_env()?;
        info!("Viewer config: {params:?}");

        let mut mesh = Mesh::new(0);
        mesh.add_vertices(&TRIANGLE);
        let device = ctx.gpu.device();
        let queue = ctx.gpu.graphics_queue();
        let cmd = ctx.transfer_command_buffer()?;
        mesh.init_buffer(device, cmd, &queue).context("Failed to upload vertices")?;
        info!("Uploaded {} vertices", mesh.vertex_count());

        Ok(Self {
            params,
            mesh,
            time: 0.0,
            rendered: 0,
        })
    }

    fn update(&mut self, _ctx: &AppContext, dt: f32) {
        self.time = (self.time + dt) % HUE_PERIOD;
    }

    fn render(&mut self, _ctx: &AppContext, frame: &mut FrameContext<'_>) -> anyhow::Result<()> {
        frame.begin_render_pass(clear_color(self.time / HUE_PERIOD))?;
        frame.end_render_pass()?;
        self.rendered += 1;
        Ok(())
    }

    fn on_resize(&mut self, _ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        info!("Viewport now {width}x{height}");
        Ok(())
    }

    fn should_exit(&self) -> bool {
        self.params
            .frames
            .is_some_and(|frames| self.rendered >= frames)
    }

    fn cleanup(&mut self, _ctx: &mut AppContext) {
        info!("Rendered {} frames", self.rendered);
        self.mesh.finalize();
    }
}

/// Fully saturated colour at `hue` (0..1) on the colour wheel.
fn clear_color(hue: f32) -> [f32; 4] {
    let h = hue.rem_euclid(1.0) * 6.0;
    let x = 1.0 - (h % 2.0 - 1.0).abs();
    let (r, g, b) = match h {
        h if h < 1.0 => (1.0, x, 0.0),
        h if h < 2.0 => (x, 1.0, 0.0),
        h if h < 3.0 => (0.0, 1.0, x),
        h if h < 4.0 => (0.0, x, 1.0),
        h if h < 5.0 => (x, 0.0, 1.0),
        _ => (1.0, 0.0, x),
    };
    [r, g, b, 1.0]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn parses_options() {
        let params = ViewerParams::from_args(args(&["--vsync", "--frames", "120"])).unwrap();
        assert_eq!(
            params,
            ViewerParams {
                frames: Some(120),
                vsync: true,
            }
        );
        assert_eq!(ViewerParams::from_args(args(&[])).unwrap(), ViewerParams::default());
    }

    #[test]
    fn rejects_bad_options() {
        assert!(ViewerParams::from_args(args(&["--frames"])).is_err());
        assert!(ViewerParams::from_args(args(&["--frames", "lots"])).is_err());
        assert!(ViewerParams::from_args(args(&["--fullscreen"])).is_err());
    }

    #[test]
    fn clear_color_walks_the_hue_wheel() {
        assert_eq!(clear_color(0.0), [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(clear_color(0.25), [0.5, 1.0, 0.0, 1.0]);
        assert_eq!(clear_color(0.5), [0.0, 1.0, 1.0, 1.0]);
        assert_eq!(clear_color(1.0), clear_color(0.0));
    }
}
