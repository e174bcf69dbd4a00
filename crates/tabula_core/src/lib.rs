pub mod consts;
pub mod errors;
pub mod utils;
pub mod hash;
pub mod ctx;
pub mod config;
pub mod chunks;
pub mod message;
pub mod prolly;
pub mod tuple;
pub mod schema;
pub mod table;
pub mod root;
pub mod editor;

pub use chunks::{Chunk, ChunkStore, FileChunkStore, MemoryChunkStore};
pub use config::{ChunkConfig, EngineConfig, PartitionConfig};
pub use ctx::Ctx;
pub use editor::{AutoIncrementTracker, BatchMode, Database, EditorState, TableEditor, WriteMode, WriteSession};
pub use errors::{Result, TabulaError};
pub use hash::Address;
pub use message::{Message, MessageKind};
pub use prolly::{Edits, NodeStore, ProllyMap};
pub use root::RootValue;
pub use schema::{Check, Column, Index, Row, Schema};
pub use table::{Partition, PartitionIter, Table};
pub use tuple::{Encoding, Value};
