//! The relational sink: schema, id allocation and the writer.

pub mod ids;
pub mod schema;
pub mod writer;

pub use ids::IdAllocator;
pub use writer::SqlWriter;
