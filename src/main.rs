mod cli;

use log::{debug, error, info, warn};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use cli::Cli;
use stream_sampler::predict::{ColorPredictor, InferenceEvent, Metrics, Predictor};
use stream_sampler::{
    FrameReader, FrameSource, ReaderError, ReaderState, Settings, SystemClock, parse_configuration,
};

/// Notes:
/// 1. The consumer pulls through the async stream, so a slow predictor skips
///    frames instead of queueing them behind the reader.
/// 2. The reader is stopped on every exit path, including Ctrl-C.
#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let args = Cli::init();
    let mut settings = match parse_configuration(args.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            error!("failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(source) = args.source {
        settings.source = source;
    }
    if let Some(max_frames) = args.max_frames {
        settings.consumer.max_frames = max_frames;
    }

    match run(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(settings: Settings) -> Result<(), ReaderError> {
    let reader = Arc::new(FrameReader::with_opener(
        settings.descriptor()?,
        settings.reader_config()?,
        settings.opener(),
        Arc::new(SystemClock),
    )?);
    let name = reader.name().to_string();
    reader.start()?;

    let predictor = ColorPredictor::new(settings.consumer.class_topk);
    let mut metrics = Metrics::new(settings.consumer.metrics_log_every);
    let max_frames = settings.consumer.max_frames;
    let mut stream = reader.read_stream_async(settings.consumer.poll_interval());

    debug!("[{name}] running asynchronous consumer");
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        let frame = tokio::select! {
            _ = &mut shutdown => {
                info!("[{name}] interrupted");
                break;
            }
            frame = stream.next() => frame,
        };
        let Some(frame) = frame else {
            warn!(
                "[{name}] reader ended: {}",
                reader.status().last_error.unwrap_or_default()
            );
            break;
        };

        let started = Instant::now();
        let topk = predictor.predict(&frame);
        let latency = started.elapsed();
        let event = InferenceEvent::new(&frame, &name, latency, topk);
        let serialized = serde_json::to_string(&event);
        match &serialized {
            Ok(line) => println!("{line}"),
            Err(e) => error!("[{name}] could not serialize frame {}: {e}", frame.sequence),
        }
        metrics.record(latency, serialized.is_err());

        if max_frames > 0 && metrics.frames() >= max_frames {
            info!("[{name}] reached {max_frames} frames");
            break;
        }
    }

    let failed = reader.state() == ReaderState::Failed;
    let stopping = Arc::clone(&reader);
    if let Err(e) = tokio::task::spawn_blocking(move || stopping.stop()).await {
        error!("[{name}] reader shutdown task failed: {e}");
    }

    let stats = reader.stats();
    info!(
        "[{name}] decoded={} published={} sampled_out={} reconnect_attempts={} file_loops={}",
        stats.decoded, stats.published, stats.sampled_out, stats.reconnect_attempts, stats.file_loops
    );

    if failed {
        return Err(ReaderError::ReconnectExhausted {
            attempts: settings.reader.max_reconnect_attempts.unwrap_or_default(),
        });
    }
    Ok(())
}
