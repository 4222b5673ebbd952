use crate::processing::frame::Frame;
use tokio::sync::mpsc;

/// Anything that yields decoded frames: a local capture device or a stream
/// delivered by a paired phone.
pub trait FrameSource {
    /// Latest frame, if one is available. Never blocks.
    fn next_frame(&mut self) -> Option<Frame>;

    fn label(&self) -> &str;
}

/// Frames received over a peer media channel.
pub struct ChannelFrameSource {
    label: String,
    receiver: mpsc::Receiver<Frame>,
    closed: bool,
}

impl ChannelFrameSource {
    pub fn new(label: impl Into<String>, receiver: mpsc::Receiver<Frame>) -> Self {
        Self {
            label: label.into(),
            receiver,
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl FrameSource for ChannelFrameSource {
    /// Drains the channel and returns the newest frame; older queued frames are
    /// dropped so a slow consumer never falls behind real time.
    fn next_frame(&mut self) -> Option<Frame> {
        let mut latest = None;
        loop {
            match self.receiver.try_recv() {
                Ok(frame) => latest = Some(frame),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.closed = true;
                    break;
                }
            }
        }
        latest
    }

    fn label(&self) -> &str {
        &self.label
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceOrigin {
    Local,
    Remote { code: String },
}

/// The camera source currently feeding the motion detector.
pub struct CameraSlot {
    source: Box<dyn FrameSource + Send>,
    origin: SourceOrigin,
}

impl CameraSlot {
    pub fn local(source: Box<dyn FrameSource + Send>) -> Self {
        Self {
            source,
            origin: SourceOrigin::Local,
        }
    }

    pub fn origin(&self) -> &SourceOrigin {
        &self.origin
    }

    pub fn label(&self) -> &str {
        self.source.label()
    }

    /// Binds a new source, returning the one it replaces.
    pub fn substitute(
        &mut self,
        source: Box<dyn FrameSource + Send>,
        origin: SourceOrigin,
    ) -> Box<dyn FrameSource + Send> {
        self.origin = origin;
        std::mem::replace(&mut self.source, source)
    }

    pub fn next_frame(&mut self) -> Option<Frame> {
        self.source.next_frame()
    }
}
