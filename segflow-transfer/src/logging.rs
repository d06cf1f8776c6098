use std::sync::Once;

use log::LevelFilter;

static INIT: Once = Once::new();

const DEFAULT_FILTER: &str = "info,segflow_transfer=debug";

pub fn ensure_initialized() {
    if log::max_level() != LevelFilter::Off {
        return;
    }

    INIT.call_once(|| {
        let filter_str =
            std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_FILTER.to_string());
        let filter: logforth::filter::EnvFilter =
            filter_str.parse().unwrap_or_else(|_| "info".into());

        logforth::starter_log::builder()
            .dispatch(|d| d.filter(filter).append(logforth::append::Stderr::default()))
            .apply();
    });
}
