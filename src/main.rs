use anyhow::{anyhow, Context, Result};
use clap::{App, Arg, ArgMatches};
use pagemill::build::Builder;
use pagemill::config::{parse_addr, parse_template_list, Config, Overrides};
use pagemill::serve::serve;
use pagemill::watch::Watcher;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = App::new("pagemill")
        .version(env!("CARGO_PKG_VERSION"))
        .about(
            "Builds a static site by mirroring an input directory, rendering \
             template pages against a shared set of templates",
        )
        .arg(path_arg("in", "Input dir"))
        .arg(path_arg("out", "Output dir"))
        .arg(path_arg("data", "Data dir (for the json and read template functions)"))
        .arg(path_arg(
            "templates",
            "Whitespace separated list of template files/dirs. The first one is \
             the base template (required)",
        ))
        .arg(path_arg(
            "addr",
            "Address to serve the output dir on (e.g. :8080), if provided",
        ))
        .arg(path_arg("max-open", "Max number of files to open at once"))
        .arg(path_arg(
            "config",
            "Project file (default: search for pagemill.yaml from the current directory)",
        ))
        .arg(
            Arg::with_name("verbose")
                .long("verbose")
                .short("v")
                .help("Verbose output"),
        )
        .get_matches();

    let filter = match matches.is_present("verbose") {
        true => EnvFilter::new("debug"),
        false => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_config(&matches)?;
    config.validate()?;

    // The first build must succeed completely; later rebuilds only log.
    let builder = Builder::new(config.clone());
    let report = builder
        .build_with(|e| tracing::error!("{}", e))
        .await
        .context("Building site")?;
    if !report.is_complete() {
        return Err(anyhow!(
            "{} file(s) failed to build",
            report.failures.len()
        ));
    }

    if let Some(addr) = config.addr {
        let watcher = Watcher::new(config.watched_paths(), config.poll_interval);
        tokio::spawn(watcher.run(builder));
        serve(addr, &config.output_dir)
            .await
            .with_context(|| format!("Serving on {}", addr))?;
    }

    Ok(())
}

fn path_arg<'a, 'b>(name: &'a str, help: &'b str) -> Arg<'a, 'b> {
    Arg::with_name(name).long(name).takes_value(true).help(help)
}

fn load_config(matches: &ArgMatches) -> Result<Config> {
    let config = match matches.value_of("config") {
        Some(path) => Config::from_project_file(&PathBuf::from(path))?,
        None => Config::from_directory(&std::env::current_dir()?)?,
    };

    let max_open = match matches.value_of("max-open") {
        Some(n) => Some(
            n.parse::<usize>()
                .with_context(|| format!("Invalid --max-open '{}'", n))?,
        ),
        None => None,
    };
    let addr = match matches.value_of("addr") {
        Some(addr) => Some(parse_addr(addr).context("Parsing --addr")?),
        None => None,
    };

    Ok(config.with_overrides(Overrides {
        input_dir: matches.value_of("in").map(PathBuf::from),
        output_dir: matches.value_of("out").map(PathBuf::from),
        data_dir: matches.value_of("data").map(PathBuf::from),
        templates: matches.value_of("templates").map(parse_template_list),
        addr,
        max_open,
    }))
}
