use std::time::Duration;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the fmt subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("framecast=debug"));
    let fmt_layer = fmt::layer().with_timer(fmt::time::uptime());

    let registry = tracing_subscriber::registry().with(filter).with(fmt_layer);

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}

/// Time between frames at `rate` frames per second.
///
/// Non-positive or non-finite rates fall back to one second.
pub fn frame_period(rate: f64) -> Duration {
    if rate.is_finite() && rate > 0.0 {
        Duration::from_secs_f64(1.0 / rate)
    } else {
        Duration::from_secs(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_from_rate() {
        assert_eq!(frame_period(25.0), Duration::from_millis(40));
        assert_eq!(frame_period(0.0), Duration::from_secs(1));
        assert_eq!(frame_period(f64::NAN), Duration::from_secs(1));
    }
}
