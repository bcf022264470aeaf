use crate::cli::app_config::Cli;
use crate::http::handler::HttpClient;
use crate::trace::tracer::Tracer;
use clap::Parser;
use prometheus::{Encoder, TextEncoder};
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

pub async fn main_with_error() -> Result<(), anyhow::Error> {
    let cli: Cli = Cli::parse();

    do_request(cli).await
}
async fn do_request(cli: Cli) -> Result<(), anyhow::Error> {
    let log_level = match cli.verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy()
        .add_directive("hyper_util=off".parse()?);
    let subscriber = tracing_subscriber::fmt()
        .with_level(true)
        .without_time()
        .with_target(false)
        .with_span_events(FmtSpan::NONE)
        .with_max_level(log_level)
        .with_env_filter(filter)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let uri: hyper::Uri = cli.url.parse()?;
    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        _ => return Err(anyhow!("Can not find scheme in the uri:{}.", uri)),
    }

    // Metric registration happens once; a second tracer with the same
    // namespace would fail here, not during a request.
    let tracer = Tracer::new(&cli.namespace)?;

    let mut client = HttpClient::new();
    for _ in 0..cli.repeat.max(1) {
        let summary = client.request(&cli, &tracer).await?;
        if cli.time {
            println!("{}", summary);
        }
    }

    if cli.metrics {
        let families = prometheus::default_registry().gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        print!("{}", String::from_utf8(buffer)?);
    }

    Ok(())
}
