//! GStreamer decoding.
//!
//! Every source becomes `source ! [decodebin !] videoconvert ! appsink`, with the
//! sink fixed to packed RGB. Live sources drop stale buffers at the sink; files
//! play at their native rate so that they pace like a live feed.

use gstreamer::prelude::*;
use gstreamer::{ClockTime, Element, ElementFactory, MessageType, MessageView, Pipeline, State};
use gstreamer_app::AppSink;
use gstreamer_video::{VideoCapsBuilder, VideoFormat, VideoInfo};
use image::RgbImage;
use log::{debug, warn};
use std::time::Duration;

use super::backend::{BackendOpener, CameraBackend, CameraSelector};
use super::{Capture, SourceDescriptor};
use crate::error::{OpenError, ReadError};

/// How one source element is made and wired.
#[derive(Clone, Debug, PartialEq, Eq)]
struct SourcePlan {
    factory: &'static str,
    properties: Vec<(&'static str, String)>,
    /// Output is compressed and goes through `decodebin`.
    decode: bool,
    /// Source pads only appear once the stream is negotiated.
    dynamic_pads: bool,
    live: bool,
}

fn stream_plan(descriptor: &SourceDescriptor, rtsp_latency_ms: u32) -> Result<SourcePlan, OpenError> {
    match descriptor {
        SourceDescriptor::Rtsp(url) => Ok(SourcePlan {
            factory: "rtspsrc",
            properties: vec![
                ("location", url.clone()),
                ("latency", rtsp_latency_ms.to_string()),
            ],
            decode: true,
            dynamic_pads: true,
            live: true,
        }),
        SourceDescriptor::File(path) => Ok(SourcePlan {
            factory: "filesrc",
            properties: vec![("location", path.display().to_string())],
            decode: true,
            dynamic_pads: false,
            live: false,
        }),
        other => Err(OpenError::InvalidDescriptor(other.to_string())),
    }
}

fn camera_plan(selector: &CameraSelector, backend: CameraBackend) -> Result<SourcePlan, OpenError> {
    let unsupported = || OpenError::UnsupportedSelector {
        backend: backend.to_string(),
        selector: selector.to_string(),
    };
    let (factory, property) = match (backend, selector) {
        (CameraBackend::V4l2, CameraSelector::Index(index)) => {
            ("v4l2src", ("device", format!("/dev/video{index}")))
        }
        (CameraBackend::V4l2, CameraSelector::Name(name)) if name.starts_with("/dev/") => {
            ("v4l2src", ("device", name.clone()))
        }
        (CameraBackend::V4l2, CameraSelector::Name(_)) => return Err(unsupported()),
        (CameraBackend::AvFoundation, CameraSelector::Index(index)) => {
            ("avfvideosrc", ("device-index", index.to_string()))
        }
        (CameraBackend::AvFoundation, CameraSelector::Name(_)) => return Err(unsupported()),
        (CameraBackend::MediaFoundation, CameraSelector::Index(index)) => {
            ("mfvideosrc", ("device-index", index.to_string()))
        }
        (CameraBackend::MediaFoundation, CameraSelector::Name(name)) => {
            ("mfvideosrc", ("device-name", name.clone()))
        }
        (CameraBackend::DirectShow, CameraSelector::Index(index)) => {
            ("dshowvideosrc", ("device-index", index.to_string()))
        }
        (CameraBackend::DirectShow, CameraSelector::Name(name)) => {
            ("dshowvideosrc", ("device-name", name.clone()))
        }
    };
    Ok(SourcePlan {
        factory,
        properties: vec![property],
        decode: false,
        dynamic_pads: false,
        live: true,
    })
}

/// Opens sources as GStreamer pipelines. A source only counts as open once it
/// has delivered a first frame within `open_timeout`.
#[derive(Clone, Debug)]
pub struct GstreamerOpener {
    open_timeout: Duration,
    rtsp_latency_ms: u32,
}

impl Default for GstreamerOpener {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl GstreamerOpener {
    pub fn new(open_timeout: Duration) -> Self {
        Self {
            open_timeout,
            rtsp_latency_ms: 0,
        }
    }

    /// Jitter buffer of `rtspsrc`. 0 favours freshness over smoothness.
    pub fn with_rtsp_latency(mut self, latency_ms: u32) -> Self {
        self.rtsp_latency_ms = latency_ms;
        self
    }

    fn launch(&self, plan: &SourcePlan, location: &str) -> Result<PipelineCapture, OpenError> {
        gstreamer::init().map_err(|e| OpenError::BackendUnavailable(e.to_string()))?;
        let unreachable = |reason: String| OpenError::Unreachable {
            location: location.to_string(),
            reason,
        };

        let pipeline = build_pipeline(plan).map_err(|e| unreachable(e.to_string()))?;
        let appsink = pipeline
            .by_name("sink")
            .and_then(|sink| sink.downcast::<AppSink>().ok())
            .ok_or_else(|| unreachable("pipeline has no appsink".to_string()))?;

        debug!("starting pipeline for {location}");
        let mut capture = PipelineCapture {
            pipeline,
            appsink,
            pending: None,
            closed: false,
        };
        if let Err(e) = capture.pipeline.set_state(State::Playing) {
            capture.close();
            return Err(unreachable(e.to_string()));
        }

        match capture.pull(self.open_timeout) {
            Ok(image) => {
                capture.pending = Some(image);
                Ok(capture)
            }
            Err(ReadError::Timeout(timeout)) => {
                capture.close();
                Err(OpenError::NoFrames {
                    location: location.to_string(),
                    timeout,
                })
            }
            Err(e) => {
                capture.close();
                Err(unreachable(e.to_string()))
            }
        }
    }
}

impl BackendOpener for GstreamerOpener {
    fn open_stream(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn Capture>, OpenError> {
        let plan = stream_plan(descriptor, self.rtsp_latency_ms)?;
        Ok(Box::new(self.launch(&plan, &descriptor.to_string())?))
    }

    fn open_camera(
        &self,
        selector: &CameraSelector,
        backend: CameraBackend,
    ) -> Result<Box<dyn Capture>, OpenError> {
        let plan = camera_plan(selector, backend)?;
        Ok(Box::new(
            self.launch(&plan, &format!("{backend} camera {selector}"))?,
        ))
    }
}

fn build_pipeline(plan: &SourcePlan) -> Result<Pipeline, gstreamer::glib::BoolError> {
    let pipeline = Pipeline::default();

    let mut source = ElementFactory::make(plan.factory).name("source");
    for (name, value) in &plan.properties {
        source = source.property_from_str(name, value);
    }
    let source = source.build()?;
    let convert = ElementFactory::make("videoconvert").build()?;
    let appsink = AppSink::builder()
        .name("sink")
        .caps(&VideoCapsBuilder::new().format(VideoFormat::Rgb).build())
        .max_buffers(1)
        .drop(plan.live)
        .sync(!plan.live)
        .build();

    pipeline.add_many([&source, &convert, appsink.upcast_ref()])?;
    convert.link(&appsink)?;

    let upstream = if plan.decode {
        let decode = ElementFactory::make("decodebin").build()?;
        pipeline.add(&decode)?;
        if plan.dynamic_pads {
            link_on_pad_added(&source, &decode);
        } else {
            source.link(&decode)?;
        }
        decode
    } else {
        source
    };

    if plan.decode || plan.dynamic_pads {
        link_on_pad_added(&upstream, &convert);
    } else {
        upstream.link(&convert)?;
    }
    Ok(pipeline)
}

/// Links the first video pad `from` exposes to the sink pad of `to`.
fn link_on_pad_added(from: &Element, to: &Element) {
    let to = to.downgrade();
    from.connect_pad_added(move |element, src_pad| {
        let Some(to) = to.upgrade() else {
            return;
        };
        let Some(sink_pad) = to.static_pad("sink") else {
            return;
        };
        let caps = src_pad
            .current_caps()
            .map(|caps| caps.to_string())
            .unwrap_or_default();
        if sink_pad.is_linked() || src_pad.is_linked() || !caps.contains("video") {
            return;
        }
        if let Err(e) = src_pad.link(&sink_pad) {
            warn!("could not link {} to {}: {e:?}", element.name(), to.name());
        }
    });
}

struct PipelineCapture {
    pipeline: Pipeline,
    appsink: AppSink,
    /// Frame decoded by the open probe, handed out by the first read.
    pending: Option<RgbImage>,
    closed: bool,
}

impl PipelineCapture {
    fn pull(&mut self, timeout: Duration) -> Result<RgbImage, ReadError> {
        self.check_bus()?;
        let wait = ClockTime::from_nseconds(u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX));
        match self.appsink.try_pull_sample(wait) {
            Some(sample) => sample_to_image(&sample),
            None if self.appsink.is_eos() => Err(ReadError::EndOfStream),
            None => {
                self.check_bus()?;
                Err(ReadError::Timeout(timeout))
            }
        }
    }

    fn check_bus(&self) -> Result<(), ReadError> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.pop_filtered(&[MessageType::Error]) {
            if let MessageView::Error(err) = message.view() {
                return Err(ReadError::Decode(match err.debug() {
                    Some(debug) => format!("{} ({debug})", err.error()),
                    None => err.error().to_string(),
                }));
            }
        }
        Ok(())
    }
}

impl Capture for PipelineCapture {
    fn read_frame(&mut self, timeout: Duration) -> Result<RgbImage, ReadError> {
        if self.closed {
            return Err(ReadError::Decode("pipeline is closed".to_string()));
        }
        match self.pending.take() {
            Some(image) => Ok(image),
            None => self.pull(timeout),
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pending = None;
        if let Err(e) = self.pipeline.set_state(State::Null) {
            warn!("failed to shut down pipeline: {e}");
        }
    }
}

impl Drop for PipelineCapture {
    fn drop(&mut self) {
        self.close();
    }
}

fn sample_to_image(sample: &gstreamer::Sample) -> Result<RgbImage, ReadError> {
    let caps = sample
        .caps()
        .ok_or_else(|| ReadError::Decode("sample without caps".to_string()))?;
    let info = VideoInfo::from_caps(caps).map_err(|e| ReadError::Decode(e.to_string()))?;
    let buffer = sample
        .buffer()
        .ok_or_else(|| ReadError::Decode("sample without buffer".to_string()))?;
    let map = buffer
        .map_readable()
        .map_err(|e| ReadError::Decode(e.to_string()))?;

    let stride = info
        .stride()
        .first()
        .and_then(|&stride| usize::try_from(stride).ok())
        .ok_or_else(|| ReadError::Decode("invalid row stride".to_string()))?;
    pack_rows(map.as_slice(), info.width(), info.height(), stride)
}

/// Copies padded RGB rows into a tightly packed image.
fn pack_rows(data: &[u8], width: u32, height: u32, stride: usize) -> Result<RgbImage, ReadError> {
    let row = width as usize * 3;
    let rows = height as usize;
    if stride < row || data.len() < stride * rows.saturating_sub(1) + row {
        return Err(ReadError::Decode(format!(
            "{} bytes is too short for {width}x{height} at stride {stride}",
            data.len()
        )));
    }

    let mut packed = Vec::with_capacity(row * rows);
    for line in data.chunks(stride).take(rows) {
        packed.extend_from_slice(&line[..row]);
    }
    RgbImage::from_raw(width, height, packed)
        .ok_or_else(|| ReadError::Decode("frame size mismatch".to_string()))
}
