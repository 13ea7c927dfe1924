//! 可观测性：tracing 订阅器初始化（RUST_LOG 优先于配置中的级别）

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LogSection;

pub fn init(log: &LogSection) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    if log.format.eq_ignore_ascii_case("json") {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}
