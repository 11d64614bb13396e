use std::time::Duration;

pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Run a blocking HTTP call without stalling the async runtime when one is
/// active. Library callers outside a runtime just run it inline.
pub(crate) fn call_blocking<T>(call: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(_) => tokio::task::block_in_place(call),
        Err(_) => call(),
    }
}
