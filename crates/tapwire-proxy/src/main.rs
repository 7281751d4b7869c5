use tapwire_proxy::{LogAddon, Options, Proxy};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let options = match load_options() {
        Ok(options) => options,
        Err(message) => {
            eprintln!("tapwire: {message}");
            std::process::exit(1);
        }
    };

    init_logging(&options);

    let mut proxy = match Proxy::new(options) {
        Ok(proxy) => proxy,
        Err(error) => {
            eprintln!("tapwire: {error}");
            std::process::exit(1);
        }
    };
    proxy.add_addon(Box::new(LogAddon));

    let handle = proxy.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.shutdown();
        }
    });

    if let Err(error) = proxy.start().await {
        eprintln!("tapwire: {error}");
        std::process::exit(1);
    }
}

/// `tapwire [-f options.json]`; flags live in the JSON options document.
fn load_options() -> Result<Options, String> {
    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        None => Ok(Options::default()),
        Some("-f") => {
            let path = args
                .next()
                .ok_or_else(|| "-f requires a file path".to_string())?;
            Options::from_json_file(&path).map_err(|error| error.to_string())
        }
        Some(other) => Err(format!("unknown argument {other:?}, expected -f <file>")),
    }
}

fn init_logging(options: &Options) {
    let default_level = if options.debug > 0 { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let with_caller = options.debug >= 2;

    if options.log_file.is_empty() {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_file(with_caller)
            .with_line_number(with_caller)
            .init();
        return;
    }

    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&options.log_file)
    {
        Ok(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_file(with_caller)
                .with_line_number(with_caller)
                .with_ansi(false)
                .with_writer(std::sync::Arc::new(file))
                .init();
        }
        Err(error) => {
            eprintln!("tapwire: cannot open log file {}: {error}", options.log_file);
            std::process::exit(1);
        }
    }
}
