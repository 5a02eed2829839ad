mod client;
mod daemon;
mod opts;

fn main() {
    let opts = opts::Opt::from_env();

    let log_level_filter = if opts.log_debug { log::LevelFilter::Debug } else { log::LevelFilter::Info };
    if std::env::var("RUST_LOG").is_ok() {
        pretty_env_logger::init_timed();
    } else {
        pretty_env_logger::formatted_timed_builder()
            .filter(Some("trayward"), log_level_filter)
            .filter(Some("notifier_watcher"), log_level_filter)
            .init();
    }

    let result = match opts.action {
        opts::Action::Daemon => daemon::run(),
        opts::Action::Items => client::list_items(),
    };

    if let Err(err) = result {
        eprintln!("{:?}", err);
        std::process::exit(1);
    }
}
