/*!
# NeoBase Runtime

The session-oriented database fabric behind the NeoBase chat surface:
per-chat owned connections over heterogeneous engines, schema discovery
with structural checksums, the LLM query pipeline with transactional
execution and rollback, and the SSE stream bus.

## Architecture

- **Drivers**: engine-specific connect/ping/execute/schema behind one
  capability set, selected through a closed engine tag
- **Connection Manager**: per-chat connection ownership, lifecycle,
  heartbeats, idle reaping, credential encryption
- **Schema Service**: cached discovery, checksum-based drift detection,
  diffing, LLM-oriented rendering
- **LLM Clients**: OpenAI / Gemini / Ollama behind one structured-output
  contract
- **Chat Pipeline**: user message → schema refresh → LLM → proposed
  queries → transactional execution, streamed end to end
- **Stream Bus**: per-(chat, stream) bounded fan-out with heartbeats and
  cancellation
*/

pub mod config;
pub mod connections;
pub mod crypto;
pub mod drivers;
pub mod errors;
pub mod llm;
pub mod pipeline;
pub mod repositories;
pub mod schema;
pub mod streams;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::Config;
pub use connections::{ConnectionManager, ConnectionManagerConfig};
pub use crypto::FieldCipher;
pub use errors::{ErrorCode, NeoError, NeoResult};
pub use pipeline::ChatPipeline;
pub use schema::SchemaService;
pub use streams::{CancelHandle, StreamBus};
pub use types::{DatabaseType, StreamEventKind, StreamResponse};
