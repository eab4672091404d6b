mod configuration;
mod utils;

pub use configuration::{init_otel, OtelGuard};
pub use utils::{add_span_link_from_record, extract_span_context_from, extract_span_context_from_xray};
