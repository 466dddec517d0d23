mod supervisor;

pub use supervisor::{spawn_supervised, SpawnSpec, CHUNK_SIZE, POLL_INTERVAL_MS};
