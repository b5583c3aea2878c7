//! Server configuration and the command-line surface
//!
//! Flags keep the underscore spelling of the upstream tool
//! (`--cuda_device`, `--max_sessions`, ...). The frame-rate denominator is
//! fixed at 1 and the GPU solver is mandatory, so neither appears on the
//! command line.

use clap::Parser;

use crate::engine::ExecutionOption;

/// Default model descriptor shipped with the engine sample data.
pub const DEFAULT_MODEL_PATH: &str = "_data/generated/audio2face-sdk/samples/data/mark/model.json";

/// Immutable server configuration, parsed once at startup.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "a2f-server",
    about = "WebSocket audio-to-face blendshape inference server"
)]
pub struct ServerConfig {
    /// Bind host (IPv4)
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Bind port
    #[arg(long, default_value_t = 8765)]
    pub port: u16,

    /// CUDA device id
    #[arg(long = "cuda_device", default_value_t = 0)]
    pub cuda_device: i32,

    /// Max concurrent sessions
    #[arg(long = "max_sessions", default_value_t = 4)]
    pub max_sessions: usize,

    /// Path to model.json
    #[arg(long = "model", default_value = DEFAULT_MODEL_PATH)]
    pub model_json_path: String,

    /// Use the diffusion model variant
    #[arg(long)]
    pub diffusion: bool,

    /// Diffusion identity index
    #[arg(long = "identity", default_value_t = 0)]
    pub diffusion_identity: usize,

    /// Diffusion constant noise
    #[arg(
        long = "constant_noise",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub diffusion_constant_noise: bool,

    /// Execution option: SkinTongue|Skin|Tongue|None
    #[arg(
        long = "execution_option",
        default_value = "SkinTongue",
        value_parser = parse_execution_option
    )]
    pub execution_option: ExecutionOption,

    /// Frame rate numerator (denominator is fixed at 1)
    #[arg(long = "fps", default_value_t = 60)]
    pub fps_numerator: usize,

    #[arg(skip = 1usize)]
    pub fps_denominator: usize,

    #[arg(skip = true)]
    pub use_gpu_solver: bool,
}

fn parse_execution_option(value: &str) -> Result<ExecutionOption, String> {
    ExecutionOption::parse(value).ok_or_else(|| format!("Unsupported execution option: {value}"))
}
