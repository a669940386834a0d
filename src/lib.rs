//! A low-latency media transport on top of an unreliable datagram connection (e.g. a negotiated
//!  ICE path over UDP). Encoded frames are sliced to fit a datagram, numbered, and re-assembled
//!  on the receiving side; lost slices are repaired by negative acknowledgement (NACK) or,
//!  if repair takes too long, skipped.
//!
//! ## Design goals
//!
//! * Live continuity over completeness: a video call prefers dropping one stale frame to stalling
//!   the pipeline
//!   * a missing slice is waited for, then NACK'ed, then given up on - the receiver skips to the
//!     next key-aligned slice
//!   * retransmission is bounded by the sender's cache of recently sent slices
//! * Frame boundary integrity: frames are delivered whole or not at all
//!   * a frame is only emitted once the *next* key-aligned slice has arrived, confirming that no
//!     further fragments belong to it. This costs one frame of latency.
//! * Bounded memory: both the sender's cache and the receiver's ring have a fixed number of slots
//!   addressed by `sequence mod N`
//! * No handshake and no in-place reconnection: a fatal error tears down the whole connection,
//!   and the owner has to negotiate a new one
//!
//! ## Datagram format
//!
//! Every datagram carries a fixed header followed by the payload:
//!
//! ```ascii
//! 0: sequence (u32 BE)
//! 4: data type (u8): 1 = primary video, 2 = secondary video, 3 = audio, 4 = NACK
//! 5: payload (up to MTU - 5 bytes)
//! ```
//!
//! Data sequences start at 1 for a fresh connection and are incremented per slice. A NACK is not
//!  part of the data sequence: its header sequence is 0, and its payload is the requested
//!  sequence (u32 BE).
//!
//! A slice is *key-aligned* if its payload starts with an H.264 Annex-B start code
//!  (`00 00 00 01`), i.e. it begins an independently decodable unit. Audio slices are always
//!  key-aligned.
//!
//! ## Receiving
//!
//! Received slices go into a ring. A cursor points to the head, the slice accumulating the frame
//!  being assembled, and each consume step looks at the slot after it:
//! * a continuation slice is appended to the head
//! * a key-aligned slice completes the head, which is emitted
//! * a missing slice is counted: after `nack_wait` steps it is NACK'ed, and after
//!   `skip_threshold` steps the head's frame is dropped and the cursor skips to the nearest
//!   key-aligned slice
//!
//! ## Concurrency
//!
//! Each connection runs three tokio tasks: the send loop (pulling frames from a [frame_io::FrameSource]),
//!  the reader loop and the consumer loop feeding the bounded frame sink. Writes from the send
//!  loop and NACKs from the consumer loop go through a shared, serialized writer.

pub mod config;
pub mod error;
pub mod sequence;
pub mod safe_converter;
pub mod data_type;
pub mod slice_header;
pub mod data_node;
pub mod key_frame;
pub mod transport;
pub mod send_cache;
pub mod framer;
pub mod reassembly;
pub mod frame_io;
pub mod connection;
pub mod test_util;
