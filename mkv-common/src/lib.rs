//! # MuxKV Common
//!
//! Purpose: Wire-level building blocks shared by every MuxKV component:
//! the RESP3 codec, the decoded reply type, command encoding with buffer
//! reuse, cluster hash slots, and the error taxonomy.
//!
//! ## Design Principles
//! 1. **Encode Once**: A command is serialized exactly once, when it is built.
//! 2. **Incremental Decoding**: Frames are parsed straight out of a growing
//!    `BytesMut` so partial reads never lose data.
//! 3. **Binary-Safe**: Every argument and bulk payload is raw bytes.
//! 4. **Closed Reply Set**: Replies are one enum; accessors fail on mismatch.

pub mod command;
pub mod error;
pub mod resp;
pub mod slot;

pub use command::{BufferPool, Command, CommandBuilder, CommandWriter, Encoded, SlotMode};
pub use error::{is_nil, Error, ProtocolError, Result};
pub use resp::{decode, encode_args, Decoder, RespValue};
pub use slot::{hash_slot, SLOT_COUNT};
