use anyhow::Context;
use clap::Parser;
use gatehouse::config::Config;
use gatehouse::policy::PolicyPool;
use gatehouse::{Reactor, ReactorHandle, logging};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "gatehouse")]
#[command(about = "Filtering forward proxy for HTTP, ICAP and TLS", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "gatehouse.toml", env = "GATEHOUSE_CONFIG")]
    config: PathBuf,

    /// Log level for gatehouse events when RUST_LOG is unset
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    if args.check {
        println!("{}: ok", args.config.display());
        return Ok(());
    }

    logging::init(&args.log_level).context("installing log subscriber")?;

    // Worker threads inherit the mask, so only the signal thread sees these.
    let signals = block_shutdown_signals();

    let policy = config.policy.clone();
    let reactor = Reactor::new(config).context("starting reactor")?;
    let pool = PolicyPool::spawn(&policy, reactor.waker()).context("starting policy workers")?;
    let mut reactor = reactor.with_decision_provider(Box::new(pool));

    spawn_signal_thread(signals, reactor.handle())?;

    for (kind, address) in reactor.listener_addrs() {
        info!(%address, ?kind, "accepting");
    }

    if let Err(e) = reactor.run() {
        error!(error = %e, "reactor failed");
        return Err(e.into());
    }

    info!("stopped");
    Ok(())
}

fn block_shutdown_signals() -> libc::sigset_t {
    // SAFETY: the set is initialised by sigemptyset before use.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::sigaddset(&mut set, libc::SIGTERM);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
        set
    }
}

fn spawn_signal_thread(set: libc::sigset_t, handle: ReactorHandle) -> anyhow::Result<()> {
    std::thread::Builder::new()
        .name("gatehouse-signals".into())
        .spawn(move || {
            let mut signal = 0;
            // SAFETY: `set` holds signals blocked in every thread.
            if unsafe { libc::sigwait(&set, &mut signal) } == 0 {
                info!(signal, "shutdown requested");
            }
            handle.shutdown();
        })
        .context("starting signal thread")?;

    Ok(())
}
