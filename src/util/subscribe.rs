use std::sync::Arc;

use crate::error::NimbusError;

/// Callback invoked with every subscription delivery or terminal error.
pub type SubscriptionCallback<T> = Arc<dyn Fn(Result<T, NimbusError>) + Send + Sync + 'static>;

/// Handle returned from `subscribe`; dropping it does nothing, calling it
/// detaches the listener (and tears down the server registration once the
/// last listener for a hash is gone).
pub type Unsubscribe = Box<dyn FnOnce() + Send + 'static>;
