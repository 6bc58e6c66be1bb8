pub mod path_processing;
pub mod response;
pub mod text_processing;

pub use path_processing::expand_tilde;
pub use response::{JsonParseError, parse_response_json_strict, truncate_response_preview};
pub use text_processing::{redact_json, redact_sensitive};
