use tracing_subscriber::{
    self, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

pub fn setup_logging() {
    let fmt = <tracing_subscriber::fmt::Layer<Registry> as Layer<Registry>>::with_filter(
        tracing_subscriber::fmt::layer(),
        EnvFilter::from_default_env(),
    );
    let _ = tracing_subscriber::registry().with(fmt).try_init();
}
