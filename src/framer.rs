use bytes::{BufMut, Bytes, BytesMut};
use tokio::select;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace};
use crate::config::QueueConnConfig;
use crate::data_type::DataType;
use crate::error::{QueueConnError, QueueConnResult};
use crate::frame_io::FrameSource;
use crate::key_frame::KeyFrameGate;
use crate::send_cache::SendCache;
use crate::sequence::Sequence;
use crate::slice_header::SliceHeader;
use crate::transport::SendPipeline;

struct FramerInner {
    send_cache: SendCache,
    next_sequence: Sequence,
    key_frame_gate: KeyFrameGate,
}

/// The sending side of a connection: slices frames, numbers the slices, keeps them in the
///  [SendCache] and writes them. It is also the NACK responder, replaying cached slices the peer
///  reports missing.
pub struct Framer {
    max_slice_payload: usize,
    inner: RwLock<FramerInner>,
    send_pipeline: SendPipeline,

    resend_sender: mpsc::Sender<Bytes>,
    resend_receiver: Mutex<mpsc::Receiver<Bytes>>,
}

impl Framer {
    pub fn new(config: &QueueConnConfig, send_pipeline: SendPipeline) -> Framer {
        let (resend_sender, resend_receiver) = mpsc::channel(config.resend_queue_capacity);

        Framer {
            max_slice_payload: config.max_slice_payload(),
            inner: RwLock::new(FramerInner {
                send_cache: SendCache::new(config.send_cache_size),
                next_sequence: Sequence::FIRST,
                key_frame_gate: KeyFrameGate::new(config.wait_for_key_frame),
            }),
            send_pipeline,
            resend_sender,
            resend_receiver: Mutex::new(resend_receiver),
        }
    }

    /// Pulls frames from `source` and sends them until something fails. Pending re-sends are
    ///  always written before the next frame is pulled.
    ///
    /// This returns only with an error: either the source failed (or ended), or writing failed.
    pub async fn run<S: FrameSource + ?Sized>(&self, source: &mut S, data_type: DataType) -> QueueConnResult<()> {
        let mut resend_receiver = self.resend_receiver.lock().await;

        loop {
            select! {
                biased;
                Some(raw) = resend_receiver.recv() => {
                    trace!("re-sending datagram of {} bytes", raw.len());
                    self.send_pipeline.send_datagram(&raw).await?;
                }
                frame = source.next_frame() => {
                    let frame = frame.map_err(QueueConnError::SourceFailed)?;
                    self.send_frame(data_type, &frame).await?;
                }
            }
        }
    }

    /// Slices a frame and sends the slices, returning the number of slices sent. An empty frame
    ///  results in no slices, and video frames are dropped while the key frame gate is closed.
    ///
    /// Every audio slice is a frame start for the receiver, so audio frames that do not fit into
    ///  a single slice are dropped.
    pub async fn send_frame(&self, data_type: DataType, frame: &[u8]) -> QueueConnResult<usize> {
        if data_type == DataType::Audio && frame.len() > self.max_slice_payload {
            debug!("dropping audio frame of {} bytes: exceeds the slice payload of {} bytes", frame.len(), self.max_slice_payload);
            return Ok(0);
        }

        let datagrams = {
            let mut inner = self.inner.write().await;
            if !inner.key_frame_gate.admit(data_type, frame) {
                debug!("dropping {} frame of {} bytes before the first key frame", data_type, frame.len());
                return Ok(0);
            }

            let mut datagrams = Vec::with_capacity(frame.len().div_ceil(self.max_slice_payload));
            for chunk in frame.chunks(self.max_slice_payload) {
                let sequence = inner.next_sequence;
                inner.next_sequence = sequence.next();

                let mut buf = BytesMut::with_capacity(SliceHeader::SERIALIZED_LEN + chunk.len());
                SliceHeader::new(sequence, data_type).ser(&mut buf);
                buf.put_slice(chunk);
                let raw = buf.freeze();

                trace!("slice #{}: {} payload bytes", sequence, chunk.len());
                inner.send_cache.insert(sequence, raw.clone());
                datagrams.push(raw);
            }
            datagrams
        };

        for raw in &datagrams {
            self.send_pipeline.send_datagram(raw).await?;
        }
        Ok(datagrams.len())
    }

    /// Schedules a re-send of the requested slice. Fails with [QueueConnError::CacheEvicted] if
    ///  the slice is no longer in the cache, which is not fatal: the peer will skip the frame.
    pub async fn on_nack(&self, requested: Sequence) -> QueueConnResult<()> {
        let raw = self.inner.read().await
            .send_cache.get(requested)?;

        debug!("received NACK for #{}", requested);
        match self.resend_sender.try_send(raw) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("resend queue is full - dropping re-send of #{}", requested),
            Err(TrySendError::Closed(_)) => {}
        }
        Ok(())
    }

    /// Drops all cached slices and pending re-sends
    pub async fn clear(&self) {
        self.inner.write().await
            .send_cache.clear();

        let mut resend_receiver = self.resend_receiver.lock().await;
        while resend_receiver.try_recv().is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use rstest::rstest;
    use tokio::runtime::Builder;
    use crate::transport::MockDatagramTransport;

    type SentLog = Arc<std::sync::Mutex<Vec<Vec<u8>>>>;

    fn recording_transport() -> (MockDatagramTransport, SentLog) {
        let sent: SentLog = Default::default();
        let sent2 = sent.clone();

        let mut transport = MockDatagramTransport::new();
        transport.expect_send()
            .returning(move |buf| {
                sent2.lock().unwrap().push(buf.to_vec());
                Ok(buf.len())
            });
        (transport, sent)
    }

    fn test_config(mtu: usize) -> QueueConnConfig {
        let mut config = QueueConnConfig::default_ice();
        config.mtu = mtu;
        config.send_cache_size = 8;
        config.wait_for_key_frame = false;
        config
    }

    #[rstest]
    #[case::empty(vec![], vec![])]
    #[case::single(vec![1,2,3], vec![vec![0,0,0,1, 1, 1,2,3]])]
    #[case::exact(vec![1,2,3,4,5], vec![vec![0,0,0,1, 1, 1,2,3,4,5]])]
    #[case::two(vec![1,2,3,4,5,6], vec![vec![0,0,0,1, 1, 1,2,3,4,5], vec![0,0,0,2, 1, 6]])]
    #[case::three(vec![1,2,3,4,5,6,7,8,9,10,11], vec![vec![0,0,0,1, 1, 1,2,3,4,5], vec![0,0,0,2, 1, 6,7,8,9,10], vec![0,0,0,3, 1, 11]])]
    fn test_send_frame(#[case] frame: Vec<u8>, #[case] expected: Vec<Vec<u8>>) {
        let (transport, sent) = recording_transport();
        let framer = Framer::new(&test_config(10), SendPipeline::new(Arc::new(transport)));

        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let num_slices = framer.send_frame(DataType::PrimaryVideo, &frame).await.unwrap();
            assert_eq!(num_slices, expected.len());
            assert_eq!(*sent.lock().unwrap(), expected);

            let inner = framer.inner.read().await;
            for raw in &expected {
                let sequence = Sequence::from_raw(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]));
                assert_eq!(inner.send_cache.get(sequence).unwrap().as_ref(), raw.as_slice());
            }
        });
    }

    #[test]
    fn test_sequences_continue_across_frames() {
        let (transport, sent) = recording_transport();
        let framer = Framer::new(&test_config(10), SendPipeline::new(Arc::new(transport)));

        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            framer.send_frame(DataType::PrimaryVideo, &[1,2,3,4,5,6]).await.unwrap();
            framer.send_frame(DataType::PrimaryVideo, &[7]).await.unwrap();

            let sequences = sent.lock().unwrap().iter()
                .map(|raw| raw[3])
                .collect::<Vec<_>>();
            assert_eq!(sequences, vec![1, 2, 3]);
        });
    }

    #[test]
    fn test_key_frame_gate() {
        let (transport, sent) = recording_transport();
        let mut config = test_config(100);
        config.wait_for_key_frame = true;
        let framer = Framer::new(&config, SendPipeline::new(Arc::new(transport)));

        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            assert_eq!(framer.send_frame(DataType::PrimaryVideo, &[0,0,0,1,0x41,1]).await.unwrap(), 0);
            assert_eq!(framer.send_frame(DataType::PrimaryVideo, &[0,0,0,1,0x65,1]).await.unwrap(), 1);
            assert_eq!(framer.send_frame(DataType::PrimaryVideo, &[0,0,0,1,0x41,2]).await.unwrap(), 1);

            let sent = sent.lock().unwrap();
            assert_eq!(sent.len(), 2);
            assert_eq!(sent[0][..4], [0,0,0,1]);
        });
    }

    #[rstest]
    #[case::fits(vec![1,2,3,4,5], 1)]
    #[case::oversized(vec![1,2,3,4,5,6], 0)]
    fn test_audio_frame_must_fit_into_a_slice(#[case] frame: Vec<u8>, #[case] expected_slices: usize) {
        let (transport, sent) = recording_transport();
        let framer = Framer::new(&test_config(10), SendPipeline::new(Arc::new(transport)));

        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            assert_eq!(framer.send_frame(DataType::Audio, &frame).await.unwrap(), expected_slices);
            assert_eq!(sent.lock().unwrap().len(), expected_slices);

            // a dropped frame does not consume a sequence number
            framer.send_frame(DataType::Audio, &[7]).await.unwrap();
            let last = sent.lock().unwrap().last().cloned().unwrap();
            assert_eq!(last[..4], (expected_slices as u32 + 1).to_be_bytes());
        });
    }

    #[rstest]
    #[case::cached(3, true)]
    #[case::not_sent(20, false)]
    #[case::evicted(1, false)]
    fn test_on_nack(#[case] requested: u32, #[case] expected_resend: bool) {
        let (transport, _) = recording_transport();
        let framer = Framer::new(&test_config(6), SendPipeline::new(Arc::new(transport)));

        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            // ten single-byte slices, the cache of 8 retains #3 to #10
            framer.send_frame(DataType::PrimaryVideo, &[0,1,2,3,4,5,6,7,8,9]).await.unwrap();

            let result = framer.on_nack(Sequence::from_raw(requested)).await;
            let mut resend_receiver = framer.resend_receiver.lock().await;
            if expected_resend {
                result.unwrap();
                let raw = resend_receiver.try_recv().unwrap();
                assert_eq!(raw.as_ref(), &[0,0,0,requested as u8, 1, requested as u8 - 1]);
            }
            else {
                assert!(matches!(result, Err(QueueConnError::CacheEvicted(s)) if s == Sequence::from_raw(requested)));
                assert!(resend_receiver.try_recv().is_err());
            }
        });
    }

    #[test]
    fn test_resend_queue_full() {
        let (transport, _) = recording_transport();
        let mut config = test_config(100);
        config.resend_queue_capacity = 1;
        let framer = Framer::new(&config, SendPipeline::new(Arc::new(transport)));

        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            framer.send_frame(DataType::Audio, &[1]).await.unwrap();
            framer.on_nack(Sequence::FIRST).await.unwrap();
            framer.on_nack(Sequence::FIRST).await.unwrap();

            let mut resend_receiver = framer.resend_receiver.lock().await;
            assert!(resend_receiver.try_recv().is_ok());
            assert!(resend_receiver.try_recv().is_err());
        });
    }

    #[test]
    fn test_run_resends_first() {
        let (transport, sent) = recording_transport();
        let framer = Framer::new(&test_config(100), SendPipeline::new(Arc::new(transport)));

        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            framer.send_frame(DataType::Audio, &[9]).await.unwrap();
            framer.on_nack(Sequence::FIRST).await.unwrap();

            let (frame_sender, mut source) = mpsc::channel(4);
            frame_sender.send(Bytes::from_static(&[5])).await.unwrap();
            drop(frame_sender);

            let result = framer.run(&mut source, DataType::Audio).await;
            assert!(matches!(result, Err(QueueConnError::SourceFailed(_))));

            assert_eq!(*sent.lock().unwrap(), vec![
                vec![0,0,0,1, 3, 9],
                vec![0,0,0,1, 3, 9],
                vec![0,0,0,2, 3, 5],
            ]);
        });
    }

    #[test]
    fn test_run_short_write() {
        let mut transport = MockDatagramTransport::new();
        transport.expect_send()
            .once()
            .returning(|buf| Ok(buf.len() - 1));
        let framer = Framer::new(&test_config(100), SendPipeline::new(Arc::new(transport)));

        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (frame_sender, mut source) = mpsc::channel(4);
            frame_sender.send(Bytes::from_static(&[1,2,3])).await.unwrap();

            let result = framer.run(&mut source, DataType::Audio).await;
            assert!(matches!(result, Err(QueueConnError::ShortWrite { written: 7, expected: 8 })));
        });
    }

    #[test]
    fn test_clear() {
        let (transport, _) = recording_transport();
        let framer = Framer::new(&test_config(100), SendPipeline::new(Arc::new(transport)));

        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            framer.send_frame(DataType::Audio, &[1]).await.unwrap();
            framer.on_nack(Sequence::FIRST).await.unwrap();
            framer.clear().await;

            assert!(framer.resend_receiver.lock().await.try_recv().is_err());
            assert!(framer.on_nack(Sequence::FIRST).await.is_err());
        });
    }
}
