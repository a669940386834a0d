use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::sync::mpsc;

/// Where the sending side gets its encoded frames from, one whole frame per call.
///
/// NB: `next_frame` is raced against pending re-sends, so it must be cancel-safe: a frame must
///      not be lost when the returned future is dropped before completion.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> anyhow::Result<Bytes>;
}

/// A closed channel is an error: the sending side has nothing left to do, and the connection is
///  torn down
#[async_trait]
impl FrameSource for mpsc::Receiver<Bytes> {
    async fn next_frame(&mut self) -> anyhow::Result<Bytes> {
        match self.recv().await {
            Some(frame) => Ok(frame),
            None => bail!("frame source channel was closed"),
        }
    }
}

/// The receiving end of reassembled frames. The channel is bounded, so a slow consumer
///  back-pressures the reassembly queue's consumer loop.
pub type FrameSink = mpsc::Receiver<Bytes>;

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::runtime::Builder;

    #[test]
    fn test_channel_source() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (send, mut source) = mpsc::channel(4);
            send.send(Bytes::from_static(b"abc")).await.unwrap();
            drop(send);

            assert_eq!(source.next_frame().await.unwrap(), Bytes::from_static(b"abc"));
            assert!(source.next_frame().await.is_err());
        });
    }
}
