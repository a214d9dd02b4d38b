pub mod schema;
pub mod transformer;

pub use schema::{SchemaEnforcer, TableSchema};
pub use transformer::{PayloadMetadata, RelationalPayload, RelationalTransformer, Row};
