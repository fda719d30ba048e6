use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;
#[cfg(feature = "python")]
pub use python::{init_python_logging, reset_python_logging_cache, set_python_log_level_str};

static RUST_LOG_ONCE: Once = Once::new();

/// Level from `BIORADIO_LOG`, then `RUST_LOG`, default `info`.
fn env_level() -> LevelFilter {
    std::env::var("BIORADIO_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info)
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

pub fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input.and_then(|s| s.parse::<LevelFilter>().ok())
}

/// Initialize stderr logging for binaries. `override_level` wins over the
/// environment (used by `-v` on the CLI).
pub fn init_rust_logging(override_level: Option<LevelFilter>) {
    let level = override_level.unwrap_or_else(env_level);
    RUST_LOG_ONCE.call_once(|| {
        let env = Env::new().filter_or("BIORADIO_LOG", level_to_str(level));
        let mut builder = env_logger::Builder::from_env(env);
        if let Some(level) = override_level {
            builder.filter_level(level);
        }
        builder
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .init();
    });
}

#[cfg(feature = "python")]
mod python {
    use std::collections::HashMap;
    use std::sync::{Mutex, MutexGuard, Once, PoisonError};

    use log::{LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use pyo3::prelude::*;
    use pyo3::types::{PyAny, PyModule, PyTuple};

    use super::{env_level, parse_level};

    static PY_LOG_ONCE: Once = Once::new();
    static PY_LOGGER: OnceCell<&'static PyLogger> = OnceCell::new();

    fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
        m.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forwards `log` records into Python's `logging`, one Python logger per
    /// Rust target (`bioradio_link::radio` -> `bioradio_link.radio`).
    struct PyLogger {
        top_filter: Mutex<LevelFilter>,
        logging_mod: Py<PyModule>,
        cache: Mutex<HashMap<String, (LevelFilter, Py<PyAny>)>>, // target -> (effective_level, logger)
    }

    impl PyLogger {
        fn new(py: Python<'_>, top_filter: LevelFilter) -> PyResult<Self> {
            let logging = py.import("logging")?;
            Ok(Self {
                top_filter: Mutex::new(top_filter),
                logging_mod: logging.into(),
                cache: Mutex::new(HashMap::new()),
            })
        }

        fn map_level(level: log::Level) -> usize {
            match level {
                log::Level::Error => 40,
                log::Level::Warn => 30,
                log::Level::Info => 20,
                log::Level::Debug => 10,
                log::Level::Trace => 5,
            }
        }

        fn extract_max_level(logger: &Bound<'_, PyAny>) -> PyResult<LevelFilter> {
            use log::Level::*;
            for l in &[Trace, Debug, Info, Warn, Error] {
                let enabled = logger
                    .call_method1("isEnabledFor", (Self::map_level(*l),))?
                    .is_truthy()?;
                if enabled {
                    return Ok(l.to_level_filter());
                }
            }
            Ok(LevelFilter::Off)
        }

        fn logger_for(&self, py: Python<'_>, target: &str) -> PyResult<(LevelFilter, Py<PyAny>)> {
            let mut cache = lock(&self.cache);
            if let Some((level, logger)) = cache.get(target) {
                return Ok((*level, logger.clone_ref(py)));
            }
            let logger = self
                .logging_mod
                .bind(py)
                .getattr("getLogger")?
                .call1((target,))?;
            let max_level = Self::extract_max_level(&logger).unwrap_or(LevelFilter::Off);
            let logger = logger.unbind();
            cache.insert(target.to_string(), (max_level, logger.clone_ref(py)));
            Ok((max_level, logger))
        }

        fn forward(&self, py: Python<'_>, record: &Record) -> PyResult<()> {
            let target = record.target().replace("::", ".");
            let (enabled_level, logger) = self.logger_for(py, &target)?;
            let level = record.level().to_level_filter();
            if level > enabled_level || level > *lock(&self.top_filter) {
                return Ok(());
            }

            let none = py.None();
            let logger = logger.bind(py);
            let rec = logger.call_method1(
                "makeRecord",
                (
                    &target,
                    Self::map_level(record.level()),
                    record.file(),
                    record.line().unwrap_or_default(),
                    record.args().to_string(),
                    PyTuple::empty(py),
                    &none, // exc_info
                    &none, // func
                    &none, // extra
                ),
            )?;
            logger.call_method1("handle", (rec,))?;
            Ok(())
        }
    }

    impl Log for PyLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level().to_level_filter() <= *lock(&self.top_filter)
        }

        fn log(&self, record: &Record) {
            if !self.enabled(record.metadata()) {
                return;
            }
            Python::attach(|py| {
                if let Err(e) = self.forward(py, record) {
                    e.restore(py);
                }
            });
        }

        fn flush(&self) {}
    }

    fn install(py: Python<'_>, level: LevelFilter) -> PyResult<&'static PyLogger> {
        PY_LOGGER
            .get_or_try_init(|| {
                PyLogger::new(py, level).map(|logger| &*Box::leak(Box::new(logger)))
            })
            .copied()
    }

    /// Route Rust logs into Python's `logging`. Safe to call repeatedly.
    pub fn init_python_logging(py: Python<'_>) -> PyResult<()> {
        let level = env_level();
        let mut result = Ok(());
        PY_LOG_ONCE.call_once(|| match install(py, level) {
            Ok(logger) => {
                if log::set_logger(logger).is_ok() {
                    log::set_max_level(level);
                }
            }
            Err(e) => result = Err(e),
        });
        result
    }

    /// Drop cached per-target loggers (after changing Python logging config).
    pub fn reset_python_logging_cache() {
        if let Some(logger) = PY_LOGGER.get() {
            lock(&logger.cache).clear();
        }
    }

    /// Set the minimum forwarded level; `None` falls back to the environment.
    pub fn set_python_log_level_str(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        let level = parse_level(level).unwrap_or_else(env_level);
        let logger = install(py, level)?;
        *lock(&logger.top_filter) = level;
        reset_python_logging_cache();
        log::set_max_level(level);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_round_trip_through_parse() {
        for level in [
            LevelFilter::Off,
            LevelFilter::Error,
            LevelFilter::Warn,
            LevelFilter::Info,
            LevelFilter::Debug,
            LevelFilter::Trace,
        ] {
            assert_eq!(parse_level(Some(level_to_str(level))), Some(level));
        }
        assert_eq!(parse_level(Some("loud")), None);
        assert_eq!(parse_level(None), None);
    }
}
