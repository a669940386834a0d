use std::io;
use std::sync::Arc;
use async_trait::async_trait;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashSet;
use tokio::select;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::trace;
use crate::sequence::Sequence;
use crate::slice_header::SliceHeader;
use crate::transport::DatagramTransport;

struct LossInjector {
    drop_once: FxHashSet<Sequence>,
    loss_probability: f64,
    rng: StdRng,
    dropped: Vec<Sequence>,
}

impl LossInjector {
    fn should_drop(&mut self, datagram: &[u8]) -> bool {
        let mut buf = datagram;
        let Ok(header) = SliceHeader::deser(&mut buf) else {
            return false;
        };

        let lost = (header.data_type.is_media() && self.drop_once.remove(&header.sequence))
            || (self.loss_probability > 0.0 && self.rng.gen_bool(self.loss_probability));
        if lost {
            trace!("loopback: dropping {} datagram #{}", header.data_type, header.sequence);
            self.dropped.push(header.sequence);
        }
        lost
    }
}

/// One end of an in-memory datagram link with loss injection on the sending side
pub struct LoopbackTransport {
    outgoing: mpsc::UnboundedSender<Bytes>,
    incoming: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    closed: watch::Sender<bool>,
    loss: std::sync::Mutex<LossInjector>,
}

/// Creates two connected in-memory transports. Datagrams are delivered in order unless dropped.
pub fn loopback_pair() -> (Arc<LoopbackTransport>, Arc<LoopbackTransport>) {
    let (a_to_b, b_from_a) = mpsc::unbounded_channel();
    let (b_to_a, a_from_b) = mpsc::unbounded_channel();

    (
        Arc::new(LoopbackTransport::new(a_to_b, a_from_b)),
        Arc::new(LoopbackTransport::new(b_to_a, b_from_a)),
    )
}

impl LoopbackTransport {
    fn new(outgoing: mpsc::UnboundedSender<Bytes>, incoming: mpsc::UnboundedReceiver<Bytes>) -> LoopbackTransport {
        LoopbackTransport {
            outgoing,
            incoming: Mutex::new(incoming),
            closed: watch::Sender::new(false),
            loss: std::sync::Mutex::new(LossInjector {
                drop_once: Default::default(),
                loss_probability: 0.0,
                rng: StdRng::seed_from_u64(0),
                dropped: Vec::new(),
            }),
        }
    }

    /// The first transmission of each of these data slices is dropped; re-sends go through
    pub fn drop_once(&self, sequences: impl IntoIterator<Item = u32>) {
        if let Ok(mut loss) = self.loss.lock() {
            loss.drop_once.extend(sequences.into_iter().map(Sequence::from_raw));
        }
    }

    /// Drops every datagram (NACKs and re-sends included) with the given probability, using a
    ///  seeded RNG so a test run is reproducible
    pub fn set_random_loss(&self, probability: f64, seed: u64) {
        if let Ok(mut loss) = self.loss.lock() {
            loss.loss_probability = probability;
            loss.rng = StdRng::seed_from_u64(seed);
        }
    }

    /// The header sequences of all datagrams dropped so far
    pub fn dropped(&self) -> Vec<Sequence> {
        self.loss.lock()
            .map(|loss| loss.dropped.clone())
            .unwrap_or_default()
    }

    /// Closes this end: all pending and future calls fail
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    fn closed_error() -> io::Error {
        io::Error::from(io::ErrorKind::ConnectionAborted)
    }
}

#[async_trait]
impl DatagramTransport for LoopbackTransport {
    async fn send(&self, datagram: &[u8]) -> io::Result<usize> {
        if *self.closed.borrow() {
            return Err(Self::closed_error());
        }

        let lost = self.loss.lock()
            .map(|mut loss| loss.should_drop(datagram))
            .unwrap_or(false);
        if !lost {
            self.outgoing.send(Bytes::copy_from_slice(datagram))
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        }
        Ok(datagram.len())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut closed = self.closed.subscribe();
        let mut incoming = self.incoming.lock().await;

        select! {
            _ = closed.wait_for(|c| *c) => Err(Self::closed_error()),
            datagram = incoming.recv() => {
                let datagram = datagram.ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))?;
                let len = datagram.len().min(buf.len());
                buf[..len].copy_from_slice(&datagram[..len]);
                Ok(len)
            }
        }
    }
}
