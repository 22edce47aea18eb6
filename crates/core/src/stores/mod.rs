pub mod memory;
pub mod neo4j;

pub use memory::InMemoryHistory;
pub use neo4j::Neo4jChatHistory;
