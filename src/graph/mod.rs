pub mod engine;
pub mod store;

pub use engine::{
    EdgeResult, Episode, ExtractedEntity, ExtractedFact, HistoryEdge, SearchResult, SourceType,
    TemporalMemoryEngine,
};
pub use store::{GraphHandle, GraphStoreDriver};
