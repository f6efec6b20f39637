use tracing_subscriber::{prelude::*, EnvFilter, Registry};

/// Initialize tracing
///
/// `RUST_LOG` overrides the default `info` filter. With `json` set, events are
/// emitted as one JSON object per line instead of the compact text format.
pub fn init(json: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().or(EnvFilter::try_new("info"))?;

    let (compact, structured) = if json {
        (None, Some(tracing_subscriber::fmt::layer().json()))
    } else {
        (Some(tracing_subscriber::fmt::layer().compact()), None)
    };

    let collector = Registry::default().with(compact).with(structured).with(env_filter);

    tracing::subscriber::set_global_default(collector)?;
    Ok(())
}
