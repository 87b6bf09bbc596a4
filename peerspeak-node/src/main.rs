// PeerSpeak node: relay mesh, discovery link and punch-through, with a console front end.

mod config;
mod connection;
mod console;
mod discovery;
mod network;
mod punch;
mod stream;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("peerspeak-node {}", VERSION);
        return Ok(());
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut cfg = config::load();
    cfg.apply_args(args)?;
    let settings = cfg.settings();
    let self_id = settings.self_id;
    log::info!("peer id {}", self_id);

    let (network, handle, mut events) = network::Network::new(settings);

    // The network loop owns its own single-threaded runtime; this thread stays the UI thread.
    let net_handle = handle.clone();
    let listen_port = cfg.listen_port;
    let discovery = cfg
        .discovery_addr
        .as_deref()
        .and_then(config::split_host_port)
        .map(|(host, port)| (host.to_string(), port));
    let net_thread = std::thread::Builder::new()
        .name("network".into())
        .spawn(move || -> std::io::Result<()> {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            rt.block_on(async move {
                if listen_port != 0 {
                    if let Err(e) = network.listen(listen_port).await {
                        log::error!("cannot listen on port {}: {}", listen_port, e);
                    }
                }
                if let Some((host, port)) = discovery {
                    net_handle.connect_to_discovery(&host, port, self_id);
                }
                let signal_handle = net_handle.clone();
                tokio::spawn(async move {
                    match shutdown_signal().await {
                        Ok(()) => log::info!("signal received"),
                        Err(e) => log::warn!("signal handler unavailable: {}", e),
                    }
                    signal_handle.shutdown();
                });
                network.run().await;
            });
            Ok(())
        })?;

    console::spawn_reader(handle, self_id)?;
    eprintln!("{}", console::HELP);

    let mut frontend = console::Console::new(std::io::stdout());
    while let Some(event) = events.blocking_recv() {
        event.deliver(&mut frontend);
    }

    match net_thread.join() {
        Ok(result) => result?,
        Err(_) => log::error!("network thread panicked"),
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
