use std::{
    path::PathBuf,
    sync::{atomic::AtomicBool, Arc},
    thread,
};

use log::{error, info};
use structopt::StructOpt;

use tierplace::{
    admin::{self, AdminContext},
    channel::{KernelChannel, NetlinkTransport, NETLINK_FAMILY},
    controller::Controller,
    migration::{MigrationEngine, SyscallMover, WorkerPool},
    placement::{self, ComponentToggles, PlacementLoop},
    topology::{SysfsProbe, TierTopology},
    ControllerConfiguration, Error,
};

#[derive(Debug, StructOpt)]
#[structopt(name = "tierplaced", about = "DRAM/NVRAM placement controller")]
struct Opt {
    /// Path to a JSON configuration file.
    #[structopt(short, long)]
    config: Option<PathBuf>,
}

fn load_config(opt: &Opt) -> Result<ControllerConfiguration, Error> {
    #[cfg(feature = "figment_config")]
    {
        ControllerConfiguration::load(opt.config.as_deref())
    }
    #[cfg(not(feature = "figment_config"))]
    {
        if opt.config.is_some() {
            return Err(Error::Config(
                "built without figment_config; cannot load a configuration file".into(),
            ));
        }
        let config = ControllerConfiguration::default();
        config.validate()?;
        Ok(config)
    }
}

fn run(opt: Opt) -> Result<(), Error> {
    let config = load_config(&opt)?;

    let transport = NetlinkTransport::connect(NETLINK_FAMILY).map_err(|e| {
        Error::Startup(format!(
            "could not create the kernel channel socket ({}); is the collaborator module loaded?",
            e
        ))
    })?;
    let channel = KernelChannel::new(Box::new(transport));

    let topology = Arc::new(TierTopology::new(&config, Box::new(SysfsProbe)));
    let pool = Arc::new(
        WorkerPool::new(config.workers_max)
            .map_err(|e| Error::Startup(format!("could not spawn the worker pool: {}", e)))?,
    );
    let engine = MigrationEngine::new(
        Arc::clone(&topology),
        Arc::clone(&pool),
        Arc::new(SyscallMover),
        config.workers_max,
    );
    let controller = Arc::new(Controller::new(channel, engine));

    let exit = Arc::new(AtomicBool::new(false));
    let toggles = Arc::new(ComponentToggles::default());

    let admin_ctx = Arc::new(AdminContext {
        controller: Arc::clone(&controller),
        toggles: Arc::clone(&toggles),
        exit: Arc::clone(&exit),
        config: config.clone(),
    });

    let stdin_ctx = Arc::clone(&admin_ctx);
    let stdin_thread = thread::Builder::new()
        .name("admin-stdin".to_string())
        .spawn(move || admin::stdin_loop(&stdin_ctx))
        .map_err(|e| Error::Startup(format!("could not spawn stdin thread: {}", e)))?;

    let socket_ctx = Arc::clone(&admin_ctx);
    let socket_thread = thread::Builder::new()
        .name("admin-socket".to_string())
        .spawn(move || admin::socket_loop(&socket_ctx))
        .map_err(|e| Error::Startup(format!("could not spawn socket thread: {}", e)))?;

    let placement_thread = placement::spawn(PlacementLoop::new(
        Arc::clone(&controller),
        topology,
        toggles,
        Arc::clone(&exit),
        config,
    ))
    .map_err(|e| Error::Startup(format!("could not spawn placement thread: {}", e)))?;

    // the stdin loop raises the exit signal on `exit` or EOF
    let _ = stdin_thread.join();
    info!("exiting controller");
    let _ = socket_thread.join();
    let _ = placement_thread.join();
    pool.shutdown();
    Ok(())
}

fn main() {
    #[cfg(feature = "init_env_logger")]
    tierplace::init_env_logger();

    let opt = Opt::from_args();
    std::process::exit(match run(opt) {
        Ok(()) => 0,
        Err(e) => {
            error!("{}", e);
            eprintln!("{}", e);
            1
        }
    });
}
