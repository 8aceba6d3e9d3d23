/// `tracing::trace!` stamped with the current worker thread name
#[macro_export]
macro_rules! worker_trace {
    ($fmt:expr) => {
        tracing::trace!("{} at {:?}", $fmt, std::thread::current().name());
    };
    ($fmt:expr, $($args:tt)*) => {
        let log = format!($fmt,$($args)*);
        tracing::trace!("{} at {:?}", log, std::thread::current().name());
    };
}
/// `tracing::debug!` stamped with the current worker thread name
#[macro_export]
macro_rules! worker_debug {
    ($fmt:expr) => {
        tracing::debug!("{} at {:?}", $fmt, std::thread::current().name());
    };
    ($fmt:expr, $($args:tt)*) => {
        let log = format!($fmt,$($args)*);
        tracing::debug!("{} at {:?}", log, std::thread::current().name());
    };
}
/// `tracing::info!` stamped with the current worker thread name
#[macro_export]
macro_rules! worker_info {
    ($fmt:expr) => {
        tracing::info!("{} at {:?}", $fmt, std::thread::current().name());
    };
    ($fmt:expr, $($args:tt)*) => {
        let log = format!($fmt,$($args)*);
        tracing::info!("{} at {:?}", log, std::thread::current().name());
    };
}
/// `tracing::warn!` stamped with the current worker thread name
#[macro_export]
macro_rules! worker_warn {
    ($fmt:expr) => {
        tracing::warn!("{} at {:?}", $fmt, std::thread::current().name());
    };
    ($fmt:expr, $($args:tt)*) => {
        let log = format!($fmt,$($args)*);
        tracing::warn!("{} at {:?}", log, std::thread::current().name());
    };
}
/// `tracing::error!` stamped with the current worker thread name
#[macro_export]
macro_rules! worker_error {
    ($fmt:expr) => {
        tracing::error!("{} at {:?}", $fmt, std::thread::current().name());
    };
    ($fmt:expr, $($args:tt)*) => {
        let log = format!($fmt,$($args)*);
        tracing::error!("{} at {:?}", log, std::thread::current().name());
    };
}
