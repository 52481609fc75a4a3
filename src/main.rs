use log::{error, info};
use trackdeck::app_runtime::{AppRuntime, CliCommand};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut clog = colog::default_builder();
    clog.filter(None, log::LevelFilter::Debug);
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = CliCommand::parse(&args)?;

    let runtime = AppRuntime::build();
    info!("Running {:?}", command);
    if let Err(err) = runtime.execute(&command) {
        error!("{:?} failed: {}", command, err);
        return Err(err.into());
    }
    Ok(())
}
