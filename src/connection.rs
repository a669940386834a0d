use std::future::Future;
use std::sync::Arc;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use crate::config::QueueConnConfig;
use crate::data_node::Datagram;
use crate::data_type::DataType;
use crate::error::{QueueConnError, QueueConnResult};
use crate::frame_io::{FrameSink, FrameSource};
use crate::framer::Framer;
use crate::reassembly::ReassemblyQueue;
use crate::sequence::Sequence;
use crate::transport::{DatagramTransport, SendPipeline};

/// Lifecycle notifications and diagnostics for a connection
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Started,
    /// The receiver gave up on a gap after `from` and resumed at the key-aligned slice `to`; the
    ///  frame being assembled at `from` was dropped
    GapSkipped { from: Sequence, to: Sequence },
    /// A fragment without a frame start was dropped
    FrameDropped { sequence: Sequence },
    /// The connection is closed. `error` is `None` if the owner closed it.
    Closed { error: Option<Arc<QueueConnError>> },
}

/// Application callback for [ConnectionEvent]s. This is called from the connection's loops, so
///  implementations should return quickly.
#[cfg_attr(test, automock)]
pub trait ConnectionObserver: Send + Sync + 'static {
    fn on_event(&self, event: ConnectionEvent);
}

/// The frames this side sends to the peer, all of them of the same type
pub struct OutgoingStream {
    pub data_type: DataType,
    pub source: Box<dyn FrameSource>,
}

/// A queue connection over an already negotiated datagram transport, not started yet
pub struct QueueConn {
    config: Arc<QueueConnConfig>,
    transport: Arc<dyn DatagramTransport>,
    label: String,
}

impl QueueConn {
    pub fn new(config: QueueConnConfig, transport: Arc<dyn DatagramTransport>) -> anyhow::Result<QueueConn> {
        config.validate()?;

        Ok(QueueConn {
            config: Arc::new(config),
            transport,
            label: "queueconn".to_string(),
        })
    }

    /// The label is recorded in the connection's tracing span
    pub fn with_label(mut self, label: impl Into<String>) -> QueueConn {
        self.label = label.into();
        self
    }

    /// Spawns the connection's loops on the current tokio runtime: the send loop (if there is an
    ///  outgoing stream), the reader loop and the reassembly consumer loop.
    ///
    /// The first fatal error in any of them closes the connection as a whole.
    pub fn start(self, outgoing: Option<OutgoingStream>, observer: Option<Arc<dyn ConnectionObserver>>) -> ConnectionHandle {
        let span = info_span!("conn", label = %self.label);

        let send_pipeline = SendPipeline::new(self.transport.clone());
        let framer = Arc::new(Framer::new(&self.config, send_pipeline.clone()));
        let reassembly_queue = Arc::new(ReassemblyQueue::new(self.config.get_effective_reassembly_config()));

        let (sink, frames) = mpsc::channel(self.config.sink_capacity);
        let (error_sender, error_receiver) = mpsc::channel(3);
        let (close_sender, close_receiver) = oneshot::channel();

        let mut loops = Vec::new();

        if let Some(OutgoingStream { data_type, mut source }) = outgoing {
            let framer = framer.clone();
            loops.push(spawn_loop(error_sender.clone(), span.clone(), async move {
                framer.run(source.as_mut(), data_type).await
            }));
        }

        {
            let transport = self.transport.clone();
            let framer = framer.clone();
            let reassembly_queue = reassembly_queue.clone();
            let mtu = self.config.mtu;
            loops.push(spawn_loop(error_sender.clone(), span.clone(), async move {
                read_loop(transport.as_ref(), &framer, &reassembly_queue, mtu).await
            }));
        }

        {
            let reassembly_queue = reassembly_queue.clone();
            let poll_interval = self.config.consume_poll_interval;
            let observer = observer.clone();
            loops.push(spawn_loop(error_sender, span.clone(), async move {
                reassembly_queue.run_consumer(poll_interval, &sink, &send_pipeline, observer.as_deref()).await
            }));
        }

        span.in_scope(|| info!("connection started"));
        if let Some(observer) = &observer {
            observer.on_event(ConnectionEvent::Started);
        }

        let supervisor = tokio::spawn(supervise(loops, error_receiver, close_receiver, framer, reassembly_queue, observer)
            .instrument(span));

        ConnectionHandle {
            frames,
            close_sender: Some(close_sender),
            supervisor,
        }
    }
}

fn spawn_loop<F>(error_sender: mpsc::Sender<QueueConnError>, span: tracing::Span, f: F) -> JoinHandle<()>
where F: Future<Output = QueueConnResult<()>> + Send + 'static
{
    tokio::spawn(async move {
        if let Err(e) = f.await {
            debug!("loop terminated: {}", e);
            let _ = error_sender.send(e).await;
        }
    }.instrument(span))
}

/// Parses incoming datagrams, passing slices to the reassembly queue and NACKs to the framer.
///
/// Both sides must be configured with the same MTU. The receive buffer has one byte of headroom
///  so that a bigger datagram is detected instead of being silently truncated.
async fn read_loop(transport: &dyn DatagramTransport, framer: &Framer, reassembly_queue: &ReassemblyQueue, mtu: usize) -> QueueConnResult<()> {
    let mut buf = vec![0u8; mtu + 1];

    loop {
        let len = transport.recv(&mut buf).await?;
        if len > mtu {
            return Err(QueueConnError::DatagramTooLarge { mtu });
        }

        match Datagram::parse(&buf[..len])? {
            Datagram::Media(node) => reassembly_queue.insert(node).await,
            Datagram::Nack(requested) => {
                if let Err(e) = framer.on_nack(requested).await {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    debug!("NACK for #{} is ignored: {}", requested, e);
                }
            }
        }
    }
}

async fn supervise(
    loops: Vec<JoinHandle<()>>,
    mut error_receiver: mpsc::Receiver<QueueConnError>,
    close_receiver: oneshot::Receiver<()>,
    framer: Arc<Framer>,
    reassembly_queue: Arc<ReassemblyQueue>,
    observer: Option<Arc<dyn ConnectionObserver>>,
) -> Option<Arc<QueueConnError>> {
    let error = select! {
        Some(e) = error_receiver.recv() => Some(Arc::new(e)),
        _ = close_receiver => None,
    };

    for l in &loops {
        l.abort();
    }
    framer.clear().await;
    reassembly_queue.clear().await;

    match &error {
        Some(e) => warn!("connection closed: {}", e),
        None => info!("connection closed"),
    }
    if let Some(observer) = &observer {
        observer.on_event(ConnectionEvent::Closed { error: error.clone() });
    }
    error
}

/// The owner's side of a running connection. Dropping the handle closes the connection.
pub struct ConnectionHandle {
    frames: FrameSink,
    close_sender: Option<oneshot::Sender<()>>,
    supervisor: JoinHandle<Option<Arc<QueueConnError>>>,
}

impl ConnectionHandle {
    /// Reassembled frames from the peer, in order. Closing or dropping this receiver closes the
    ///  connection on the next completed frame.
    pub fn frames(&mut self) -> &mut FrameSink {
        &mut self.frames
    }

    pub async fn recv_frame(&mut self) -> Option<Bytes> {
        self.frames.recv().await
    }

    /// Requests an orderly shutdown
    pub fn close(&mut self) {
        if let Some(close_sender) = self.close_sender.take() {
            let _ = close_sender.send(());
        }
    }

    /// Waits for the connection to be closed, returning the error that closed it, or `None` if
    ///  the owner closed it
    pub async fn closed(self) -> Option<Arc<QueueConnError>> {
        let ConnectionHandle { frames, close_sender, supervisor } = self;
        // keep both alive while waiting: dropping them would close the connection
        let _keep = (frames, close_sender);

        match supervisor.await {
            Ok(error) => error,
            Err(e) => {
                warn!("connection supervisor failed: {}", e);
                None
            }
        }
    }
}
