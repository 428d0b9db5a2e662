pub mod backoff;
pub mod ids;
pub mod subscribe;
pub mod validate;

pub use backoff::{Backoff, MAX_BACKOFF_MILLIS};
pub use ids::{generate_event_id, generate_id};
pub use subscribe::{SubscriptionCallback, Unsubscribe};
pub use validate::{
    validate_document_value, validate_identifier, validate_key_path, validate_paging_take,
};
