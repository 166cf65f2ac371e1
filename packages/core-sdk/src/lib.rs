pub mod codec;
pub mod config;
pub mod db;
pub mod discovery;
pub mod error;
pub mod llm;
pub mod models;
pub mod music;
pub mod normalize;
pub mod retry;
pub mod server;
pub mod telemetry;
pub mod track_cache;
pub mod verify;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::config::{GatewayConfig, MusicConfig};
    pub use crate::db::{self, RecordStore, SqliteStore};
    pub use crate::error::GatewayError;
    pub use crate::llm::ChatClient;
    pub use crate::models;
    pub use crate::music::{MusicResolver, SearchKind};
    pub use crate::server;
    pub use crate::telemetry;
    pub use crate::track_cache::TrackUrlCache;
}
