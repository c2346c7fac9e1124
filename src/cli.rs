use clap::Parser;

#[derive(Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Settings file. Without it, `config.yaml` is read if present.
    #[arg(short, long)]
    pub config: Option<String>,

    /// Source descriptor overriding the configured one
    /// (`auto`, a camera index, `video=<name>`, an RTSP URL or a file path).
    #[arg(short, long)]
    pub source: Option<String>,

    /// Stop after this many frames. 0 runs until interrupted.
    #[arg(short = 'n', long)]
    pub max_frames: Option<u64>,
}

impl Cli {
    /// Initialization function for the Cli object.
    /// Keeps the rest of the binary decoupled from `clap`.
    pub fn init() -> Self {
        Cli::parse()
    }
}
