use clap::Parser as _;
use itho_wifi_tools::commands;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

#[derive(clap::Parser)]
#[clap(version, about, author)]
enum Commands {
    Status(commands::status::Args),
    Speed(commands::speed::Args),
    SetSpeed(commands::set_speed::Args),
    Vremote(commands::vremote::Args),
    Watch(commands::watch::Args),
    Serve(commands::serve::Args),
}

fn end<E: std::error::Error>(r: Result<(), E>) {
    std::process::exit(match r {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            let mut cause = e.source();
            while let Some(e) = cause {
                eprintln!("  because: {e}");
                cause = e.source();
            }
            1
        }
    });
}

fn main() {
    let filter = match std::env::var("ITHO_WIFI_TOOLS_LOG") {
        Ok(description) => description
            .parse::<tracing_subscriber::filter::targets::Targets>()
            .expect("ITHO_WIFI_TOOLS_LOG must be a valid filter description"),
        Err(_) => tracing_subscriber::filter::targets::Targets::new()
            .with_default(tracing::level_filters::LevelFilter::INFO),
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    match Commands::parse() {
        Commands::Status(args) => end(commands::status::run(args)),
        Commands::Speed(args) => end(commands::speed::run(args)),
        Commands::SetSpeed(args) => end(commands::set_speed::run(args)),
        Commands::Vremote(args) => end(commands::vremote::run(args)),
        Commands::Watch(args) => end(commands::watch::run(args)),
        Commands::Serve(args) => end(commands::serve::run(args)),
    }
}
