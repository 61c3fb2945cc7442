// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use gethostname::gethostname;
use prometheus::Registry;
use tokio::select;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use grokmetrics::bounded_channel::bounded;
use grokmetrics::config::{self, Config, InputType, Protocol};
use grokmetrics::grok::Patterns;
use grokmetrics::metrics::Metric;
use grokmetrics::monitoring::SelfMonitoring;
use grokmetrics::pipeline::Pipeline;
use grokmetrics::server::ScrapeServer;
use grokmetrics::tail::file::{run_file_tailer, DEFAULT_POLL_INTERVAL};
use grokmetrics::tail::multi::MultiTailer;
use grokmetrics::tail::stdin::run_stdin_tailer;
use grokmetrics::tail::Tailer;

#[derive(Debug, Parser)]
#[command(name = "grokmetrics")]
#[command(bin_name = "grokmetrics")]
#[command(version = get_version(), about, long_about = None)]
pub struct Arguments {
    /// Path to the config file. Try '--config ./example/config.yml' to get started
    #[arg(long, env = "GROKMETRICS_CONFIG")]
    config: Option<PathBuf>,

    /// Print the normalized configuration to the console and exit
    #[arg(long)]
    show_config: bool,

    /// Log configuration
    #[arg(long, env = "GROKMETRICS_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let opt = Arguments::parse();

    let Some(config_path) = opt.config else {
        if opt.show_config {
            eprintln!("Usage: grokmetrics --show-config --config <path>");
        } else {
            eprintln!("Usage: grokmetrics --config <path>");
        }
        return ExitCode::from(1);
    };

    let (config, warning) = match config::load_file(&config_path) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(1);
        }
    };

    if opt.show_config {
        match serde_yaml::to_string(&config) {
            Ok(rendered) => print!("{}", rendered),
            Err(e) => {
                eprintln!("{}", e);
                return ExitCode::from(1);
            }
        }
        return ExitCode::SUCCESS;
    }

    // warning is suppressed when '--show-config' is used
    if let Some(warning) = warning {
        eprintln!("{}", warning);
    }

    setup_logging(&opt.log_level);

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::from(1)
        }
    }
}

#[tokio::main]
async fn run(config: Config) -> Result<(), Box<dyn Error + Send + Sync>> {
    // the https server path needs a process-wide crypto provider
    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        return Err(format!("failed to initialize crypto library: {:?}", e).into());
    }

    let patterns = init_patterns(&config)?;
    let metrics = create_metrics(&config, &patterns)?;

    let registry = Registry::new();
    for metric in &metrics {
        metric
            .register(&registry)
            .map_err(|e| format!("failed to register metric {}: {}", metric.name(), e))?;
    }

    let monitor = SelfMonitoring::new(&config.global.input_label_name)?;
    monitor.register(&registry)?;
    monitor.set_build_info(&get_version());
    let sources: Vec<String> = config.inputs.iter().map(|i| i.id.clone()).collect();
    let metric_names: Vec<String> = metrics.iter().map(|m| m.name().to_string()).collect();
    monitor.zero_init(&sources, &metric_names);

    let mut tailers: HashMap<String, Tailer> = HashMap::with_capacity(config.inputs.len());
    for input in &config.inputs {
        let tailer = match input.input_type {
            InputType::File => {
                run_file_tailer(input.path.clone(), input.readall, DEFAULT_POLL_INTERVAL)
            }
            InputType::Stdin => run_stdin_tailer(),
        };
        tailers.insert(input.id.clone(), tailer);
    }
    let mut multi = MultiTailer::run(tailers, Some(monitor.buffer_load()));

    let (server_error_tx, mut server_error_rx) = bounded::<String>(1);
    let server = ScrapeServer::new(config.server.clone(), registry.clone());
    let server_cancel = CancellationToken::new();
    {
        let server_cancel = server_cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve(server_cancel).await {
                let _ = server_error_tx.send(e.to_string()).await;
            }
        });
    }

    print!("{}", start_message(&config));

    let pipeline = Pipeline::new(metrics, monitor);
    let result = select! {
        result = pipeline.run(&mut multi, &mut server_error_rx) => result.map_err(Into::into),
        _ = signal_wait() => {
            info!("Shutdown signal received.");
            Ok(())
        }
    };

    multi.close();
    server_cancel.cancel();

    result
}

fn init_patterns(config: &Config) -> Result<Patterns, Box<dyn Error + Send + Sync>> {
    let mut patterns = Patterns::new();
    if !config.grok.patterns_dir.is_empty() {
        patterns.add_dir(&config.grok.patterns_dir)?;
    }
    for definition in &config.grok.additional_patterns {
        patterns.add_line(definition)?;
    }
    Ok(patterns)
}

fn create_metrics(
    config: &Config,
    patterns: &Patterns,
) -> Result<Vec<Metric>, Box<dyn Error + Send + Sync>> {
    let mut metrics = Vec::with_capacity(config.metrics.len());
    for metric_config in &config.metrics {
        metrics.push(Metric::build(
            &config.global.input_label_name,
            metric_config,
            patterns,
        )?);
    }
    Ok(metrics)
}

fn start_message(config: &Config) -> String {
    let host = if !config.server.host.is_empty() {
        config.server.host.clone()
    } else {
        gethostname().to_string_lossy().into_owned()
    };
    let protocol = match config.server.protocol {
        Protocol::Http => "http",
        Protocol::Https => "https",
    };
    format!(
        "Starting server on {}://{}:{}/metrics\n",
        protocol, host, config.server.port
    )
}

async fn signal_wait() {
    let mut sig_term = sig(SignalKind::terminate());
    let mut sig_int = sig(SignalKind::interrupt());

    select! {
        _ = sig_term.recv() => {},
        _ = sig_int.recv() => {},
    }
}

fn sig(kind: SignalKind) -> Signal {
    signal(kind).expect("failed to install signal handler")
}

fn setup_logging(log_level: &str) {
    // per-line processing warnings go to stderr alongside the echoed lines
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .compact();

    let subscriber = TracingRegistry::default()
        .with(EnvFilter::new(log_level))
        .with(stderr_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn get_version() -> String {
    // Set during CI
    let version_build = option_env!("GROKMETRICS_BUILD_REVISION").unwrap_or("dev");

    format!("{}-{}", env!("CARGO_PKG_VERSION"), version_build)
}
