pub mod dataset;
pub mod metadata;
pub mod query_result;
pub mod semantic_query;
pub mod tenant;

pub use dataset::*;
pub use metadata::*;
pub use query_result::*;
pub use semantic_query::*;
pub use tenant::*;
