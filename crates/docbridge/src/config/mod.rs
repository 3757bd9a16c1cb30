//! Server and mapping configuration.

mod types;
mod validation;

pub use types::{
    ConsecutiveConfig, DocumentTypeRule, FieldMapping, FunctionServer, MappingConfig,
    ProcessedMarker, ServerConfig, TableConfig, ValueMapping,
};
pub use validation::{validate_function_template, validate_mapping};
