use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global subscriber. `RUST_LOG` overrides the default `info`.
/// Calling it twice is harmless; the second call leaves the first in place.
pub fn init_logging(component: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    let installed = if json {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true).json())
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()
    };

    if installed.is_ok() {
        info!(
            component = component,
            version = env!("CARGO_PKG_VERSION"),
            "Loom initialized"
        );
    }
}

/// Evaluates `$body`, a `Result`, logs the outcome with its duration and
/// hands the result back unchanged.
#[macro_export]
macro_rules! log_operation {
    ($op:expr, $body:expr) => {{
        let started = std::time::Instant::now();
        let result = $body;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => tracing::info!(operation = $op, elapsed_ms, "Operation succeeded"),
            Err(e) => tracing::error!(operation = $op, elapsed_ms, error = %e, "Operation failed"),
        }
        result
    }};
}
