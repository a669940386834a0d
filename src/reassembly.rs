use std::time::Duration;
use bytes::Bytes;
use tokio::select;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, trace};
use crate::config::{ReassemblyConfig, StreamStart};
use crate::connection::{ConnectionEvent, ConnectionObserver};
use crate::data_node::{nack_datagram, DataNode};
use crate::error::{QueueConnError, QueueConnResult};
use crate::safe_converter::PrecheckedCast;
use crate::sequence::Sequence;
use crate::transport::SendPipeline;

/// The outcome of a single consume step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeStep {
    /// The stream has not started yet
    Idle,
    /// The head's successor is missing, and it is too early to do anything about it
    Waiting(Sequence),
    /// The head's successor continued the head's frame and was appended to it
    Merged,
    /// A complete frame, confirmed by the key-aligned slice following it
    Emitted(Bytes),
    /// The head's successor is still missing, and a re-send should be requested
    Nack(Sequence),
    /// The frame at `from` was abandoned because of a persistent gap, and consumption resumes
    ///  at the key-aligned slice `to`
    GapSkipped { from: Sequence, to: Sequence },
    /// The head was a fragment without a frame start and was dropped
    OrphanDropped { sequence: Sequence, resumed_at: Sequence },
}

impl ConsumeStep {
    /// `true` if the step moved the cursor or changed the ring, i.e. the next step may have
    ///  something to do immediately
    pub fn made_progress(&self) -> bool {
        matches!(self, ConsumeStep::Merged | ConsumeStep::Emitted(_) | ConsumeStep::GapSkipped { .. } | ConsumeStep::OrphanDropped { .. })
    }
}

/// The receiver's ring of slices that were received but not consumed yet, and the state machine
///  that turns them into frames.
///
/// A slice with sequence `s` lives in slot `s mod N`. The cursor is the sequence of the *head*,
///  i.e. the node that accumulates the frame currently being assembled: contiguous continuation
///  slices are merged into it, and it is emitted only when the next slice is key-aligned, so
///  that a frame is never emitted before it is known to be complete.
///
/// A slot holding a node with a sequence other than the one looked for counts as empty.
pub struct ReassemblyRing {
    config: ReassemblyConfig,
    slots: Vec<Option<DataNode>>,

    /// `None` until the start of the stream arrives
    cursor: Option<Sequence>,
    /// `true` once the configured start of the stream was seen
    started: bool,
    /// the head at the time the ring was lapped; nothing before it is accepted anymore
    floor: Option<Sequence>,

    /// consume steps since the head's successor was last NACK'ed
    lost_counter: u32,
    /// consume steps since the head's successor was first found missing
    timeout_counter: u32,
}

impl ReassemblyRing {
    /// NB: panics if the ring size is not a power of two. Configurations derived from a
    ///  validated [crate::config::QueueConnConfig] always satisfy this.
    pub fn new(config: ReassemblyConfig) -> ReassemblyRing {
        assert!(config.ring_size.is_power_of_two(), "reassembly ring size must be a power of two");

        ReassemblyRing {
            slots: vec![None; config.ring_size],
            config,
            cursor: None,
            started: false,
            floor: None,
            lost_counter: 0,
            timeout_counter: 0,
        }
    }

    pub fn cursor(&self) -> Option<Sequence> {
        self.cursor
    }

    /// Stores a received slice, returning `false` if it was dropped as a duplicate or because it
    ///  is older than the head.
    ///
    /// A slice that is a full ring ahead of the head means the ring was lapped: the frame being
    ///  assembled can not be completed anymore, and the stream restarts at the next key-aligned
    ///  slice.
    pub fn insert(&mut self, node: DataNode) -> bool {
        if let Some(head) = self.cursor.or(self.floor) {
            if node.sequence.is_before(head) {
                trace!("dropping slice #{}: already consumed up to #{}", node.sequence, head);
                return false;
            }
        }
        if let Some(head) = self.cursor {
            if head.distance_to(node.sequence) >= self.config.ring_size.prechecked_cast() {
                debug!("slice #{} laps the reassembly ring at head #{} - restarting at the next key frame", node.sequence, head);
                self.cursor = None;
                self.floor = Some(head);
                self.reset_counters();
            }
        }

        let slot = node.sequence.slot(self.slots.len());
        if let Some(existing) = &self.slots[slot] {
            if existing.sequence == node.sequence {
                trace!("dropping duplicate slice #{}", node.sequence);
                return false;
            }
            trace!("slice #{} overwrites unconsumed slice #{}", node.sequence, existing.sequence);
        }

        if self.cursor.is_none() && self.is_stream_start(&node) {
            debug!("stream starts at {}", node);
            self.cursor = Some(node.sequence);
            self.started = true;
        }

        trace!("inserted {}", node);
        self.slots[slot] = Some(node);
        true
    }

    fn is_stream_start(&self, node: &DataNode) -> bool {
        match self.config.stream_start {
            StreamStart::Sequence(start) if !self.started => node.sequence == start,
            _ => node.is_key_frame_start,
        }
    }

    /// Advances the state machine by one step
    pub fn consume_step(&mut self) -> ConsumeStep {
        let Some(head_seq) = self.cursor else {
            return ConsumeStep::Idle;
        };
        let Some(head_is_key) = self.node_at(head_seq).map(|n| n.is_key_frame_start) else {
            return ConsumeStep::Idle;
        };

        let next_seq = head_seq.next();
        match self.node_at(next_seq).map(|n| n.is_key_frame_start) {
            None => self.on_missing_successor(head_seq, next_seq),
            Some(false) => {
                self.merge(head_seq, next_seq);
                ConsumeStep::Merged
            }
            Some(true) if head_is_key => {
                self.reset_counters();
                self.cursor = Some(next_seq);
                match self.take_node(head_seq) {
                    Some(head) => {
                        trace!("emitting frame {}", head);
                        ConsumeStep::Emitted(head.payload.freeze())
                    }
                    None => ConsumeStep::Idle,
                }
            }
            Some(true) => {
                debug!("dropping fragment #{} without a frame start", head_seq);
                let resumed_at = self.skip_to_next_key(head_seq)
                    .unwrap_or(next_seq);
                ConsumeStep::OrphanDropped { sequence: head_seq, resumed_at }
            }
        }
    }

    fn on_missing_successor(&mut self, head_seq: Sequence, missing: Sequence) -> ConsumeStep {
        self.lost_counter += 1;
        self.timeout_counter += 1;

        if self.lost_counter <= self.config.nack_wait {
            return ConsumeStep::Waiting(missing);
        }

        if self.timeout_counter <= self.config.skip_threshold {
            debug!("slice #{} is missing - requesting re-send", missing);
            self.lost_counter = 0;
            return ConsumeStep::Nack(missing);
        }

        match self.skip_to_next_key(head_seq) {
            Some(to) => {
                debug!("giving up on slice #{} - skipping from #{} to #{}", missing, head_seq, to);
                ConsumeStep::GapSkipped { from: head_seq, to }
            }
            None => {
                debug!("giving up on slice #{}, but there is no key frame to skip to yet", missing);
                self.reset_counters();
                ConsumeStep::Waiting(missing)
            }
        }
    }

    /// Appends the successor's payload to the head, moving the head to the successor's slot
    fn merge(&mut self, head_seq: Sequence, next_seq: Sequence) {
        let (Some(mut head), Some(next)) = (self.take_node(head_seq), self.take_node(next_seq)) else {
            return;
        };

        head.payload.extend_from_slice(&next.payload);
        head.sequence = next_seq;
        trace!("merged #{} into head, now {}", next_seq, head);

        let slot = next_seq.slot(self.slots.len());
        self.slots[slot] = Some(head);
        self.cursor = Some(next_seq);
        self.reset_counters();
    }

    /// Moves the cursor to the nearest key-aligned node after `from`, discarding everything in
    ///  between including `from` itself. Leaves the cursor unchanged if there is no such node.
    fn skip_to_next_key(&mut self, from: Sequence) -> Option<Sequence> {
        let target = (1..self.slots.len())
            .map(|offset| from.plus(offset.prechecked_cast()))
            .find(|&s| self.node_at(s).is_some_and(|n| n.is_key_frame_start))?;

        let mut discarded = from;
        while discarded != target {
            if let Some(node) = self.take_node(discarded) {
                trace!("discarding {}", node);
            }
            discarded = discarded.next();
        }

        self.cursor = Some(target);
        self.reset_counters();
        Some(target)
    }

    fn reset_counters(&mut self) {
        self.lost_counter = 0;
        self.timeout_counter = 0;
    }

    fn node_at(&self, sequence: Sequence) -> Option<&DataNode> {
        self.slots[sequence.slot(self.slots.len())].as_ref()
            .filter(|n| n.sequence == sequence)
    }

    fn take_node(&mut self, sequence: Sequence) -> Option<DataNode> {
        let idx = sequence.slot(self.slots.len());
        let slot = &mut self.slots[idx];
        match slot {
            Some(n) if n.sequence == sequence => slot.take(),
            _ => None,
        }
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut()
            .for_each(|slot| *slot = None);
        self.cursor = None;
        self.started = false;
        self.floor = None;
        self.reset_counters();
    }
}

/// The [ReassemblyRing] shared between the reader loop (inserting) and the consumer loop
pub struct ReassemblyQueue {
    ring: RwLock<ReassemblyRing>,
    notify: Notify,
}

impl ReassemblyQueue {
    pub fn new(config: ReassemblyConfig) -> ReassemblyQueue {
        ReassemblyQueue {
            ring: RwLock::new(ReassemblyRing::new(config)),
            notify: Notify::new(),
        }
    }

    pub async fn insert(&self, node: DataNode) {
        if self.ring.write().await.insert(node) {
            self.notify.notify_one();
        }
    }

    /// Runs consume steps for as long as they make progress, returning the steps that require
    ///  action from the caller
    pub async fn consume_available(&self) -> Vec<ConsumeStep> {
        let mut ring = self.ring.write().await;

        let mut result = Vec::new();
        loop {
            let step = ring.consume_step();
            let made_progress = step.made_progress();
            match step {
                ConsumeStep::Idle | ConsumeStep::Waiting(_) | ConsumeStep::Merged => {}
                step => result.push(step),
            }
            if !made_progress {
                return result;
            }
        }
    }

    /// The consumer loop: runs consume steps whenever a slice was inserted and at least every
    ///  `poll_interval`, hands completed frames to the sink and writes NACKs.
    ///
    /// This returns only with an error, i.e. if the sink was closed or a NACK could not be
    ///  written.
    pub async fn run_consumer(
        &self,
        poll_interval: Duration,
        sink: &mpsc::Sender<Bytes>,
        send_pipeline: &SendPipeline,
        observer: Option<&dyn ConnectionObserver>,
    ) -> QueueConnResult<()> {
        let mut ticks = interval(poll_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = self.notify.notified() => {}
                _ = ticks.tick() => {}
            }

            // the ring lock is released here, so a slow sink does not block the reader loop
            for step in self.consume_available().await {
                match step {
                    ConsumeStep::Emitted(frame) => {
                        sink.send(frame).await
                            .map_err(|_| QueueConnError::SinkClosed)?;
                    }
                    ConsumeStep::Nack(requested) => {
                        send_pipeline.send_datagram(&nack_datagram(requested)).await?;
                    }
                    ConsumeStep::GapSkipped { from, to } => {
                        if let Some(observer) = observer {
                            observer.on_event(ConnectionEvent::GapSkipped { from, to });
                        }
                    }
                    ConsumeStep::OrphanDropped { sequence, .. } => {
                        if let Some(observer) = observer {
                            observer.on_event(ConnectionEvent::FrameDropped { sequence });
                        }
                    }
                    ConsumeStep::Idle | ConsumeStep::Waiting(_) | ConsumeStep::Merged => {}
                }
            }
        }
    }

    pub async fn clear(&self) {
        self.ring.write().await.clear();
    }
}
