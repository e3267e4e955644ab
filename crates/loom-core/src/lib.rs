pub mod chunks;
pub mod ids;
pub mod state;
pub mod thinking;
pub mod time;
pub mod tokens;

pub use chunks::{ContentType, StreamChunk};
pub use thinking::ThinkingBlock;
