//! Media-source sink: appends fragmented-MP4 segments to a source buffer
//! with backpressure.
//!
//! The embedder supplies the actual buffer (a media-source extension wrapper
//! or a file/socket in tests) behind [`SourceBuffer`]. Appends only happen
//! while the buffer's update flag is clear; the embedder signals update-end
//! by ticking the pipeline, which drains the next queued segment. Every init
//! segment opens a fresh buffer, removing the previous one first.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::PipelineError;
use crate::pipe::{MediaPipe, Payload, SegmentKind, SetupConfig};

/// One append target; `updating` mirrors the media-source update flag.
pub trait SourceBuffer: Send {
    fn append(&mut self, segment: Bytes) -> Result<(), PipelineError>;
    fn updating(&self) -> bool;
    /// Detach the buffer from its media source.
    fn remove(&mut self);
}

/// Creates source buffers for a codec tag.
pub trait SourceBufferFactory: Send + Sync {
    fn create(&self, codec_tag: &str) -> Result<Box<dyn SourceBuffer>, PipelineError>;
}

/// Leaf pipe feeding a source buffer.
pub struct MediaSourceSink {
    factory: Arc<dyn SourceBufferFactory>,
    buffer: Option<Box<dyn SourceBuffer>>,
    queue: VecDeque<Bytes>,
    errored: bool,
    cleaned: bool,
}

impl MediaSourceSink {
    pub fn new(factory: Arc<dyn SourceBufferFactory>) -> Self {
        Self {
            factory,
            buffer: None,
            queue: VecDeque::new(),
            errored: false,
            cleaned: false,
        }
    }

    /// Queued segments not yet appended.
    pub fn backlog(&self) -> usize {
        self.queue.len()
    }

    fn pump(&mut self) {
        let Some(buffer) = self.buffer.as_mut() else {
            return;
        };
        while !buffer.updating() {
            let Some(segment) = self.queue.pop_front() else {
                return;
            };
            if let Err(error) = buffer.append(segment) {
                tracing::error!(%error, "source buffer append failed");
                self.errored = true;
                return;
            }
        }
    }
}

impl MediaPipe for MediaSourceSink {
    fn setup(&mut self, _config: &SetupConfig) -> Result<(), PipelineError> {
        // The buffer itself is created lazily: its codec tag is only known
        // once the first init segment arrives.
        Ok(())
    }

    fn submit(&mut self, payload: Payload) -> Result<(), PipelineError> {
        if self.cleaned || self.errored {
            return Ok(());
        }
        let Payload::Segment(segment) = payload else {
            return Err(PipelineError::Bitstream(format!(
                "media source sink expects segments, got {:?}",
                payload.kind()
            )));
        };

        if segment.kind == SegmentKind::Init {
            if let Some(mut old) = self.buffer.take() {
                old.remove();
            }
            self.queue.clear();
            match self.factory.create(&segment.codec_tag) {
                Ok(buffer) => {
                    tracing::info!(codec = %segment.codec_tag, "opened source buffer");
                    self.buffer = Some(buffer);
                }
                Err(error) => {
                    tracing::error!(%error, codec = %segment.codec_tag, "source buffer creation failed");
                    self.errored = true;
                    return Err(PipelineError::Configuration(error.to_string()));
                }
            }
        }

        self.queue.push_back(segment.data);
        self.pump();
        Ok(())
    }

    fn tick(&mut self) {
        // update-end: the buffer finished the previous append.
        self.pump();
    }

    fn poll_request_idr(&mut self) -> bool {
        false
    }

    fn cleanup(&mut self) {
        if let Some(mut buffer) = self.buffer.take() {
            buffer.remove();
        }
        self.queue.clear();
        self.cleaned = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::Segment;
    use std::sync::Mutex;

    /// Buffer that stays "updating" until ticked.
    struct SlowBuffer {
        log: Arc<Mutex<Vec<Bytes>>>,
        updating: Arc<Mutex<bool>>,
        removed: Arc<Mutex<u32>>,
    }

    impl SourceBuffer for SlowBuffer {
        fn append(&mut self, segment: Bytes) -> Result<(), PipelineError> {
            self.log.lock().unwrap().push(segment);
            *self.updating.lock().unwrap() = true;
            Ok(())
        }

        fn updating(&self) -> bool {
            *self.updating.lock().unwrap()
        }

        fn remove(&mut self) {
            *self.removed.lock().unwrap() += 1;
        }
    }

    #[derive(Default)]
    struct SlowFactory {
        log: Arc<Mutex<Vec<Bytes>>>,
        updating: Arc<Mutex<bool>>,
        removed: Arc<Mutex<u32>>,
        created: Mutex<u32>,
    }

    impl SourceBufferFactory for SlowFactory {
        fn create(&self, _codec_tag: &str) -> Result<Box<dyn SourceBuffer>, PipelineError> {
            *self.created.lock().unwrap() += 1;
            Ok(Box::new(SlowBuffer {
                log: Arc::clone(&self.log),
                updating: Arc::clone(&self.updating),
                removed: Arc::clone(&self.removed),
            }))
        }
    }

    fn segment(kind: SegmentKind, byte: u8) -> Payload {
        Payload::Segment(Segment {
            kind,
            data: Bytes::from(vec![byte]),
            codec_tag: "avc1.42e01e".to_string(),
        })
    }

    #[test]
    fn appends_gated_on_update_flag() {
        let factory = Arc::new(SlowFactory::default());
        let mut sink = MediaSourceSink::new(Arc::clone(&factory) as Arc<dyn SourceBufferFactory>);
        sink.setup(&SetupConfig::default()).unwrap();

        sink.submit(segment(SegmentKind::Init, 1)).unwrap();
        sink.submit(segment(SegmentKind::Media, 2)).unwrap();
        sink.submit(segment(SegmentKind::Media, 3)).unwrap();

        // Only the init segment went through; the buffer is now updating.
        assert_eq!(factory.log.lock().unwrap().len(), 1);
        assert_eq!(sink.backlog(), 2);

        // update-end drives the next append.
        *factory.updating.lock().unwrap() = false;
        sink.tick();
        assert_eq!(factory.log.lock().unwrap().len(), 2);
        *factory.updating.lock().unwrap() = false;
        sink.tick();
        assert_eq!(factory.log.lock().unwrap().len(), 3);
        assert_eq!(sink.backlog(), 0);
    }

    #[test]
    fn reconfiguration_replaces_buffer() {
        let factory = Arc::new(SlowFactory::default());
        let mut sink = MediaSourceSink::new(Arc::clone(&factory) as Arc<dyn SourceBufferFactory>);
        sink.setup(&SetupConfig::default()).unwrap();

        sink.submit(segment(SegmentKind::Init, 1)).unwrap();
        sink.submit(segment(SegmentKind::Media, 2)).unwrap();
        sink.submit(segment(SegmentKind::Init, 3)).unwrap();

        assert_eq!(*factory.created.lock().unwrap(), 2);
        assert_eq!(*factory.removed.lock().unwrap(), 1, "previous buffer removed");
        // Pending media for the old buffer was discarded.
        assert_eq!(sink.backlog(), 1);
    }

    #[test]
    fn cleanup_removes_buffer_and_drops_later_submissions() {
        let factory = Arc::new(SlowFactory::default());
        let mut sink = MediaSourceSink::new(Arc::clone(&factory) as Arc<dyn SourceBufferFactory>);
        sink.setup(&SetupConfig::default()).unwrap();
        sink.submit(segment(SegmentKind::Init, 1)).unwrap();
        sink.cleanup();
        assert_eq!(*factory.removed.lock().unwrap(), 1);

        sink.submit(segment(SegmentKind::Media, 2)).unwrap();
        assert_eq!(sink.backlog(), 0);
    }
}
