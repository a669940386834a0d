use clap::Parser;
use clap_derive::Parser;
use bytes::{BufMut, Bytes, BytesMut};
use queueconn::config::QueueConnConfig;
use queueconn::connection::{ConnectionEvent, ConnectionObserver, OutgoingStream, QueueConn};
use queueconn::data_type::DataType;
use queueconn::test_util::loopback_pair;
use queueconn::transport::DatagramTransport;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use anyhow::anyhow;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep};
use tracing::{info, warn, Level};

/// Streams synthetic H.264-like frames from one queue connection to another
#[derive(Parser)]
struct Args {
    #[clap(long, default_value_t = 300)]
    frames: u32,

    /// bytes per frame; frames bigger than a datagram are sliced
    #[clap(long, default_value_t = 20_000)]
    frame_size: usize,

    /// probability of losing a datagram on the in-memory link
    #[clap(long, default_value_t = 0.01)]
    loss: f64,

    /// use two UDP sockets on localhost instead of the lossy in-memory link
    #[clap(long, default_value_t = false)]
    udp: bool,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

#[derive(Default)]
struct GapCounter {
    gaps_skipped: AtomicUsize,
}

impl ConnectionObserver for GapCounter {
    fn on_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::GapSkipped { from, to } => {
                info!("skipped from #{} to #{}", from, to);
                self.gaps_skipped.fetch_add(1, Ordering::Relaxed);
            }
            ConnectionEvent::Closed { error: Some(e) } => warn!("closed: {}", e),
            _ => {}
        }
    }
}

/// An IDR frame every 30 frames, all others non-IDR. The frame number follows the NAL header so
///  the receiver can check what arrived.
fn synthetic_frame(number: u32, size: usize) -> Bytes {
    let nal_header = if number % 30 == 0 { 0x65 } else { 0x41 };

    let mut buf = BytesMut::with_capacity(size.max(9));
    buf.put_slice(&[0, 0, 0, 1, nal_header]);
    buf.put_u32(number);
    while buf.len() < size {
        buf.put_u8(0xab);
    }
    buf.freeze()
}

async fn udp_pair() -> anyhow::Result<(Arc<dyn DatagramTransport>, Arc<dyn DatagramTransport>)> {
    let a = UdpSocket::bind("127.0.0.1:0").await?;
    let b = UdpSocket::bind("127.0.0.1:0").await?;
    a.connect(b.local_addr()?).await?;
    b.connect(a.local_addr()?).await?;

    let a: Arc<dyn DatagramTransport> = Arc::new(a);
    let b: Arc<dyn DatagramTransport> = Arc::new(b);
    Ok((a, b))
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if !(0.0..1.0).contains(&args.loss) {
        return Err(anyhow!("loss probability must be in [0, 1)"));
    }

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .try_init()
        .ok();

    let (sender_transport, receiver_transport): (Arc<dyn DatagramTransport>, Arc<dyn DatagramTransport>) = if args.udp {
        udp_pair().await?
    }
    else {
        let (a, b) = loopback_pair();
        a.set_random_loss(args.loss, 4711);
        b.set_random_loss(args.loss, 4712);
        (a as Arc<dyn DatagramTransport>, b as Arc<dyn DatagramTransport>)
    };

    let (frame_sender, source) = mpsc::channel(8);
    let _sender = QueueConn::new(QueueConnConfig::default_ice(), sender_transport)?
        .with_label("sender")
        .start(Some(OutgoingStream { data_type: DataType::PrimaryVideo, source: Box::new(source) }), None);

    let observer = Arc::new(GapCounter::default());
    let mut receiver = QueueConn::new(QueueConnConfig::default_ice(), receiver_transport)?
        .with_label("receiver")
        .start(None, Some(observer.clone() as Arc<dyn ConnectionObserver>));

    let num_frames = args.frames;
    let frame_size = args.frame_size;
    tokio::spawn(async move {
        let mut ticks = interval(Duration::from_millis(33));
        for number in 0..num_frames {
            ticks.tick().await;
            if frame_sender.send(synthetic_frame(number, frame_size)).await.is_err() {
                break;
            }
        }
        // keep the source open so the last frames can still be repaired
        sleep(Duration::from_secs(1)).await;
    });

    let mut received = 0usize;
    let mut corrupted = 0usize;
    let deadline = sleep(Duration::from_millis(33) * num_frames + Duration::from_millis(500));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            frame = receiver.recv_frame() => {
                let Some(frame) = frame else { break; };
                received += 1;
                if frame.len() != frame_size {
                    corrupted += 1;
                }
            }
            _ = &mut deadline => break,
        }
    }

    info!(
        "sent {} frames, received {} ({} corrupted), {} gaps skipped",
        num_frames, received, corrupted, observer.gaps_skipped.load(Ordering::Relaxed),
    );
    receiver.close();
    Ok(())
}
