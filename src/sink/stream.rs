//! Streaming video sink
//!
//! A single `video-encoder` thread owns the encoder and feeds it frames in
//! the order they were enqueued. Any fatal encoder error stops the whole
//! pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::{debug, info, warn};

use crate::desktop::types::{Frame, FrameJob};
use crate::error::{EncoderError, EncoderResult, RecorderError, Result};
use crate::pipeline::channel::{ChannelReceiver, Received};
use crate::sink::encoder::{EncoderFactory, EncoderSpec, VideoEncoder};
use crate::sink::{FrameSink, PipelineFault, SinkCounters, SinkHandle, RECV_TIMEOUT};

/// An open encoder plus the ordering state of its input
pub struct EncoderSession {
    encoder: Box<dyn VideoEncoder>,
    accepted: u64,
    last_sequence: Option<u64>,
    closed: bool,
}

impl EncoderSession {
    pub fn new(encoder: Box<dyn VideoEncoder>) -> Self {
        Self {
            encoder,
            accepted: 0,
            last_sequence: None,
            closed: false,
        }
    }

    /// Writes a frame; sequences must strictly increase
    pub fn submit(&mut self, frame: &Frame) -> EncoderResult<()> {
        if self.closed {
            return Err(EncoderError::Closed);
        }
        if let Some(last) = self.last_sequence {
            if frame.sequence <= last {
                return Err(EncoderError::OutOfOrder {
                    last,
                    sequence: frame.sequence,
                });
            }
        }

        self.encoder.write(&frame.data)?;
        self.last_sequence = Some(frame.sequence);
        self.accepted += 1;
        Ok(())
    }

    /// Closes the encoder; later calls are no-ops
    pub fn close(&mut self) -> EncoderResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.encoder.close()
    }

    /// Frames the encoder accepted
    pub fn accepted(&self) -> u64 {
        self.accepted
    }
}

/// Streams frames into one encoder
pub struct StreamSink {
    factory: Arc<dyn EncoderFactory>,
    spec: EncoderSpec,
}

impl StreamSink {
    pub fn new(factory: Arc<dyn EncoderFactory>, spec: EncoderSpec) -> Self {
        Self { factory, spec }
    }
}

impl FrameSink for StreamSink {
    fn start(
        self: Box<Self>,
        receiver: ChannelReceiver<FrameJob>,
        running: Arc<AtomicBool>,
        fault: Arc<PipelineFault>,
    ) -> Result<SinkHandle> {
        // Opened here so a missing encoder fails the start
        let encoder = self.factory.open(&self.spec)?;
        let kill_switch = encoder.kill_switch();
        let session = EncoderSession::new(encoder);
        let counters = Arc::new(SinkCounters::default());
        let thread_counters = Arc::clone(&counters);

        let name = "video-encoder".to_string();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || encode_loop(&receiver, &running, &fault, &thread_counters, session))
            .map_err(|source| RecorderError::ThreadSpawn {
                name: name.clone(),
                source,
            })?;

        info!("Streaming sink started -> {}", self.spec.output.display());
        Ok(SinkHandle::new(vec![(name, handle)], counters).with_kill_switch(kill_switch))
    }
}

fn encode_loop(
    receiver: &ChannelReceiver<FrameJob>,
    running: &AtomicBool,
    fault: &PipelineFault,
    counters: &SinkCounters,
    mut session: EncoderSession,
) {
    loop {
        match receiver.recv_timeout(RECV_TIMEOUT) {
            Received::Item(job) => match session.submit(&job.frame) {
                Ok(()) => {
                    counters.record_written();
                    debug!("Encoded frame {}", job.frame.sequence);
                }
                Err(e) if !e.is_fatal() => {
                    counters.record_failed();
                    warn!("Skipping frame {}: {}", job.frame.sequence, e);
                }
                Err(e) => {
                    counters.record_failed();
                    running.store(false, Ordering::SeqCst);
                    fault.record(e);
                    drop(job);

                    if let Err(e) = session.close() {
                        debug!("Encoder close after fault: {}", e);
                    }
                    discard_remaining(receiver, counters);
                    return;
                }
            },
            Received::Shutdown | Received::Disconnected => break,
            Received::Timeout => {}
        }
    }

    let accepted = session.accepted();
    match session.close() {
        Ok(()) => info!("Video encoder finished, {} frames accepted", accepted),
        Err(e) => {
            running.store(false, Ordering::SeqCst);
            fault.record(e);
        }
    }
}

/// Consumes frames after a fault so the channel still drains
///
/// Runs until the shutdown message arrives, since the producer may enqueue
/// one last frame after the fault.
fn discard_remaining(receiver: &ChannelReceiver<FrameJob>, counters: &SinkCounters) {
    loop {
        match receiver.recv_timeout(RECV_TIMEOUT) {
            Received::Item(job) => {
                counters.record_failed();
                debug!("Discarding frame {} after encoder fault", job.frame.sequence);
            }
            Received::Shutdown | Received::Disconnected => break,
            Received::Timeout => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desktop::types::{CaptureTime, CursorSample};
    use crate::pipeline::channel::bounded;
    use crate::sink::encoder::QualityPreset;
    use parking_lot::Mutex;
    use std::path::PathBuf;
    use std::time::Duration;

    /// Sequence numbers decoded from the frames, in arrival order
    #[derive(Default)]
    struct Recorded {
        frames: Vec<u64>,
        closes: u32,
    }

    struct MemoryEncoder {
        recorded: Arc<Mutex<Recorded>>,
        fail_after: Option<usize>,
    }

    impl VideoEncoder for MemoryEncoder {
        fn write(&mut self, frame: &[u8]) -> EncoderResult<()> {
            let mut recorded = self.recorded.lock();
            if Some(recorded.frames.len()) == self.fail_after {
                return Err(EncoderError::Write(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "pipe closed",
                )));
            }
            let mut stamp = [0u8; 8];
            stamp.copy_from_slice(&frame[..8]);
            recorded.frames.push(u64::from_le_bytes(stamp));
            Ok(())
        }

        fn close(&mut self) -> EncoderResult<()> {
            self.recorded.lock().closes += 1;
            Ok(())
        }
    }

    struct MemoryFactory {
        recorded: Arc<Mutex<Recorded>>,
        fail_after: Option<usize>,
    }

    impl EncoderFactory for MemoryFactory {
        fn open(&self, _spec: &EncoderSpec) -> EncoderResult<Box<dyn VideoEncoder>> {
            Ok(Box::new(MemoryEncoder {
                recorded: Arc::clone(&self.recorded),
                fail_after: self.fail_after,
            }))
        }
    }

    fn spec() -> EncoderSpec {
        EncoderSpec {
            program: "memory".to_string(),
            width: 2,
            height: 2,
            fps: 10.0,
            quality: QualityPreset::Low,
            output: PathBuf::from("unused.webm"),
            exit_timeout: Duration::from_secs(1),
        }
    }

    /// A 2x2 frame whose first eight bytes carry its sequence number
    fn job(sequence: u64) -> FrameJob {
        let time = CaptureTime::new(chrono::Local::now(), Duration::from_millis(sequence * 100));
        let mut data = vec![0u8; 16];
        data[..8].copy_from_slice(&sequence.to_le_bytes());
        FrameJob {
            frame: Frame::new(2, 2, data, sequence, time),
            cursor: CursorSample { x: 0.0, y: 0.0, time },
        }
    }

    fn memory_session() -> (EncoderSession, Arc<Mutex<Recorded>>) {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let encoder = MemoryEncoder {
            recorded: Arc::clone(&recorded),
            fail_after: None,
        };
        (EncoderSession::new(Box::new(encoder)), recorded)
    }

    #[test]
    fn test_session_rejects_regression() {
        let (mut session, recorded) = memory_session();
        session.submit(&job(1).frame).unwrap();
        session.submit(&job(3).frame).unwrap();

        assert!(matches!(
            session.submit(&job(3).frame),
            Err(EncoderError::OutOfOrder { last: 3, sequence: 3 })
        ));
        assert!(matches!(
            session.submit(&job(2).frame),
            Err(EncoderError::OutOfOrder { last: 3, sequence: 2 })
        ));
        assert_eq!(session.accepted(), 2);
        assert_eq!(recorded.lock().frames, vec![1, 3]);
    }

    #[test]
    fn test_session_closes_once() {
        let (mut session, recorded) = memory_session();
        session.close().unwrap();
        session.close().unwrap();
        assert_eq!(recorded.lock().closes, 1);
        assert!(matches!(session.submit(&job(0).frame), Err(EncoderError::Closed)));
    }

    #[test]
    fn test_frames_stream_in_order() {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let factory = Arc::new(MemoryFactory {
            recorded: Arc::clone(&recorded),
            fail_after: None,
        });
        let (tx, rx) = bounded(8);
        let running = Arc::new(AtomicBool::new(true));
        let fault = Arc::new(PipelineFault::new());

        let handle = Box::new(StreamSink::new(factory, spec()))
            .start(rx, Arc::clone(&running), Arc::clone(&fault))
            .unwrap();
        for i in [3, 4, 7, 9, 12] {
            tx.try_send(job(i)).unwrap();
        }
        assert!(tx.wait_drained(Duration::from_secs(5)));

        let report = handle.shutdown(&tx, Duration::from_secs(1)).unwrap();
        assert_eq!(report.frames_written, 5);
        assert!(!fault.is_set());
        let recorded = recorded.lock();
        assert_eq!(recorded.frames, vec![3, 4, 7, 9, 12]);
        assert_eq!(recorded.closes, 1);
    }

    #[test]
    fn test_write_failure_faults_pipeline() {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let factory = Arc::new(MemoryFactory {
            recorded: Arc::clone(&recorded),
            fail_after: Some(2),
        });
        let (tx, rx) = bounded(8);
        let running = Arc::new(AtomicBool::new(true));
        let fault = Arc::new(PipelineFault::new());

        let handle = Box::new(StreamSink::new(factory, spec()))
            .start(rx, Arc::clone(&running), Arc::clone(&fault))
            .unwrap();
        for i in 0..5 {
            tx.try_send(job(i)).unwrap();
        }
        assert!(tx.wait_drained(Duration::from_secs(5)));

        assert!(!running.load(Ordering::SeqCst));
        assert!(matches!(
            fault.take(),
            Some(RecorderError::Encoder(EncoderError::Write(_)))
        ));

        let report = handle.shutdown(&tx, Duration::from_secs(1)).unwrap();
        assert_eq!(report.frames_written, 2);
        assert_eq!(report.frames_failed, 3);
        assert_eq!(recorded.lock().frames, vec![0, 1]);
        assert_eq!(recorded.lock().closes, 1);
    }
}
