#[macro_export]
macro_rules! log {
    // log!(Level::Info, "a {} event", "log");
    ($level:expr, $($arg:tt)+) => {{
        let level: $crate::Level = $level;
        if level.enabled() {
            $crate::log_impl(level, ::core::module_path!(), ::core::format_args!($($arg)+))
        }
    }};
}

#[macro_export]
macro_rules! error {
    // error!("a {} event", "log")
    ($($arg:tt)+) => ($crate::log!($crate::Level::Error, $($arg)+))
}

#[macro_export]
macro_rules! warn {
    // warn!("a {} event", "log")
    ($($arg:tt)+) => ($crate::log!($crate::Level::Warn, $($arg)+))
}

#[macro_export]
macro_rules! info {
    // info!("a {} event", "log")
    ($($arg:tt)+) => ($crate::log!($crate::Level::Info, $($arg)+))
}

#[macro_export]
macro_rules! debug {
    // debug!("a {} event", "log")
    ($($arg:tt)+) => ($crate::log!($crate::Level::Debug, $($arg)+))
}

#[macro_export]
macro_rules! trace {
    // trace!("a {} event", "log")
    ($($arg:tt)+) => ($crate::log!($crate::Level::Trace, $($arg)+))
}

#[macro_export]
macro_rules! span {
    // span!(Level::Info, "alloc_pages")
    ($level:expr, $name:expr) => {{
        let level: $crate::Level = $level;
        if level.enabled() {
            $crate::Span::new(level, $name, None)
        } else {
            $crate::Span::disabled()
        }
    }};
    // span!(Level::Info, "alloc_pages", order = order, node = nid)
    ($level:expr, $name:expr, $($key:ident = $value:expr),+ $(,)?) => {{
        let level: $crate::Level = $level;
        if level.enabled() {
            $crate::Span::new(
                level,
                $name,
                Some(&[$((::core::stringify!($key), &$value as &dyn $crate::Loggable)),+]),
            )
        } else {
            $crate::Span::disabled()
        }
    }};
}

#[macro_export]
macro_rules! error_span {
    ($($arg:tt)+) => ($crate::span!($crate::Level::Error, $($arg)+))
}

#[macro_export]
macro_rules! warn_span {
    ($($arg:tt)+) => ($crate::span!($crate::Level::Warn, $($arg)+))
}

#[macro_export]
macro_rules! info_span {
    ($($arg:tt)+) => ($crate::span!($crate::Level::Info, $($arg)+))
}

#[macro_export]
macro_rules! debug_span {
    ($($arg:tt)+) => ($crate::span!($crate::Level::Debug, $($arg)+))
}

#[macro_export]
macro_rules! trace_span {
    ($($arg:tt)+) => ($crate::span!($crate::Level::Trace, $($arg)+))
}
