use clap::{Parser, Subcommand};
use rfgen::config::{self, CachePolicy, Options};
use rfgen::generator::FaviconGenerator;
use rfgen::progress::LogObserver;
use rfgen::watch::{self, NotifyBackend, SessionMessage, WatchSession};
use rfgen::{cache, output};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter.
const LOG_ENV: &str = "RFGEN_LOG";

fn version_string() -> &'static str {
    let on_tag = env!("ON_RELEASE_TAG");
    if on_tag == "true" {
        env!("CARGO_PKG_VERSION")
    } else {
        let hash = env!("GIT_HASH");
        if hash.is_empty() {
            "dev@unknown"
        } else {
            // Leaked once at startup
            Box::leak(format!("dev@{hash}").into_boxed_str())
        }
    }
}

#[derive(Parser)]
#[command(name = "rfgen")]
#[command(about = "Generate favicon bundles with RealFaviconGenerator")]
#[command(long_about = "\
Generate favicon bundles with RealFaviconGenerator

The source image and generation settings are sent to the RealFaviconGenerator
service. Responses are cached by a fingerprint of the request, so unchanged
settings never hit the network twice. The destination directory always mirrors
exactly one generated bundle, and the returned markup is injected into your
HTML files.

Project layout:

  .
  ├── rfgen.toml          # Tool options (rfgen gen-config)
  ├── rfg.json            # Generation settings (design, settings, versioning)
  ├── favicon.png         # Source image, discovered when src is not set
  └── index.html          # Patched between <!-- RFG start --> / <!-- RFG end -->
                          # markers, or merged into <head>

The API key is read from rfg.json (apiKey), the inline config, or RFG_API_KEY.

Run 'rfgen gen-config' to generate a documented rfgen.toml.")]
#[command(version = version_string())]
struct Cli {
    /// Tool options file
    #[arg(long, default_value = config::DEFAULT_OPTIONS_FILE, global = true)]
    options: PathBuf,

    /// Destination directory for the bundle
    #[arg(long, global = true)]
    dest: Option<PathBuf>,

    /// Source image: path, URL, or glob pattern
    #[arg(long, global = true)]
    src: Option<String>,

    /// HTML files to patch (repeatable)
    #[arg(long = "html", global = true)]
    html: Vec<String>,

    /// Always call the service; never reuse a cached response
    #[arg(long, global = true, conflicts_with = "cache_ttl")]
    no_cache: bool,

    /// Expire cached responses after this many seconds
    #[arg(long, global = true)]
    cache_ttl: Option<u64>,

    /// Verbose logging; echo request and response on service failures
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate the bundle and patch HTML files
    Build,
    /// Build, then rebuild whenever the source image changes
    Watch,
    /// Empty the destination directory
    Clean {
        /// Also drop the cached response for the current configuration
        #[arg(long)]
        cache: bool,
    },
    /// Print the fingerprint of the resolved request
    Fingerprint,
    /// Print a stock rfgen.toml with all options documented
    GenConfig,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    match cli.command {
        Command::Build => {
            let report = build_generator(&cli)?.run()?;
            output::print_report(&report);
        }
        Command::Watch => {
            let mut generator = build_generator(&cli)?;
            let report = generator.run()?;
            output::print_report(&report);
            watch_source(&mut generator)?;
        }
        Command::Clean { cache } => {
            let mut generator = build_generator(&cli)?;
            generator.clean()?;
            println!("Cleaned {}", generator.dest().display());
            if cache {
                let fingerprint = generator.evict_cached()?;
                println!("Evicted cache entry {fingerprint}");
            }
        }
        Command::Fingerprint => {
            let mut generator = build_generator(&cli)?;
            let fingerprint = generator.fingerprint()?;
            let cached = match generator.cache().lookup(&fingerprint)? {
                Some(entry) => !cache::is_expired(&entry, &generator.options().cache),
                None => false,
            };
            println!("{}", output::format_fingerprint(&fingerprint, cached));
        }
        Command::GenConfig => {
            print!("{}", config::stock_options_toml());
        }
    }

    Ok(())
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// A generator for the current directory, logging progress.
fn build_generator(cli: &Cli) -> Result<FaviconGenerator, Box<dyn std::error::Error>> {
    let options = load_options(cli)?;
    let root = std::env::current_dir()?;
    Ok(FaviconGenerator::new(options, root).with_observer(LogObserver))
}

/// Options file overlaid with command-line flags.
fn load_options(cli: &Cli) -> Result<Options, config::ConfigError> {
    let mut options = Options::load(&cli.options)?;
    if let Some(dest) = &cli.dest {
        options.dest = dest.clone();
    }
    if let Some(src) = &cli.src {
        options.src = Some(src.clone());
    }
    if !cli.html.is_empty() {
        options.html_files = cli.html.clone();
    }
    if cli.no_cache {
        options.cache = CachePolicy::Disabled;
    } else if let Some(ttl) = cli.cache_ttl {
        options.cache = CachePolicy::ttl(ttl);
    }
    options.debug |= cli.debug;
    options.validate()?;
    Ok(options)
}

/// Run a watch session on the source image until Ctrl-C.
fn watch_source(generator: &mut FaviconGenerator) -> Result<(), Box<dyn std::error::Error>> {
    let settings = generator.options().watch.clone();
    if !settings.enabled {
        tracing::info!("watching disabled in options; exiting after one run");
        return Ok(());
    }

    let path = generator.watch_path()?;
    let (tx, rx) = watch::channel();
    let poll = settings
        .poll
        .then(|| Duration::from_millis(settings.poll_interval_ms));
    let backend = NotifyBackend::new(&path, tx.clone(), poll)?;
    ctrlc::set_handler(move || {
        let _ = tx.send(SessionMessage::Stop);
    })?;

    let mut session = WatchSession::new(
        path,
        backend,
        rx,
        Duration::from_millis(settings.debounce_ms),
    );
    session.run(generator)?;
    tracing::info!("stopped watching");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn parse(tmp: &TempDir, args: &[&str]) -> Cli {
        let options = tmp.path().join("rfgen.toml");
        let mut argv = vec!["rfgen", "--options", options.to_str().unwrap()];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn zero_cache_ttl_flag_disables_the_cache() {
        let tmp = TempDir::new().unwrap();
        let options = load_options(&parse(&tmp, &["--cache-ttl", "0", "build"])).unwrap();
        assert!(matches!(options.cache, CachePolicy::Disabled));

        let options = load_options(&parse(&tmp, &["--cache-ttl", "30", "build"])).unwrap();
        assert!(matches!(options.cache, CachePolicy::Ttl(30)));
    }

    #[test]
    fn flags_override_the_options_file() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("rfgen.toml"), "dest = \"from-file\"\n").unwrap();
        let cli = parse(&tmp, &["--dest", "from-flag", "--html", "a.html", "build"]);
        let options = load_options(&cli).unwrap();
        assert_eq!(options.dest, PathBuf::from("from-flag"));
        assert_eq!(options.html_files, vec!["a.html".to_string()]);
    }

    #[test]
    fn clean_accepts_cache_flag() {
        let tmp = TempDir::new().unwrap();
        let cli = parse(&tmp, &["clean", "--cache"]);
        assert!(matches!(cli.command, Command::Clean { cache: true }));
    }
}
