use bonsai_runtime::VmConfig;
use clap::Parser;
use tracing_log::log::debug;

#[derive(Parser, Debug)]
#[command(version, about = "A small Java virtual machine")]
pub struct Args {
    #[arg(
        short = 'c',
        long = "classpath",
        visible_alias = "cp",
        visible_alias = "class-path",
        value_delimiter = ':',
        help = "Classpath entries (directories); use ':' as separator"
    )]
    pub class_path: Vec<String>,
    #[arg(long = "ms", help = "Initial heap size in bytes", value_parser = parse_size)]
    pub initial_heap: Option<usize>,
    #[arg(long = "mx", help = "Maximum heap size in bytes", value_parser = parse_size)]
    pub max_heap: Option<usize>,
    #[arg(long = "ss", help = "Java frame-stack depth per thread")]
    pub stack_depth: Option<usize>,
    #[arg(long = "no-finalizers", help = "Do not start the finalizer thread")]
    pub no_finalizers: bool,
    #[arg(
        help = "Main class, dotted or slashed (e.g. com.example.Main or com/example/Main)"
    )]
    pub main_class: String,
}

/// Accepts plain bytes or a k/m/g suffix, e.g. `256k`, `64m`.
fn parse_size(raw: &str) -> Result<usize, String> {
    let raw = raw.trim().to_ascii_lowercase();
    let (digits, scale) = match raw.chars().last() {
        Some('k') => (&raw[..raw.len() - 1], 1024),
        Some('m') => (&raw[..raw.len() - 1], 1024 * 1024),
        Some('g') => (&raw[..raw.len() - 1], 1024 * 1024 * 1024),
        _ => (raw.as_str(), 1),
    };
    digits
        .parse::<usize>()
        .map(|n| n * scale)
        .map_err(|e| format!("bad size {:?}: {}", raw, e))
}

fn create_vm_configuration(mut args: Args) -> VmConfig {
    if args.class_path.is_empty() {
        let current_dir = std::env::current_dir()
            .map(|v| v.to_string_lossy().to_string())
            .expect("cannot get current dir");
        args.class_path.push(current_dir);
    }
    let mut config = VmConfig::with_main_class(args.main_class.replace('.', "/"));
    config.class_path = args.class_path;
    if let Some(initial) = args.initial_heap {
        config.initial_heap_size = initial;
    }
    if let Some(max) = args.max_heap {
        config.max_heap_size = max.max(config.initial_heap_size);
    }
    if let Some(depth) = args.stack_depth {
        config.frame_stack_depth = depth;
    }
    config.enable_finalizers = !args.no_finalizers;
    config
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();
    debug!("provided command line arguments: {:?}", args);

    let config = create_vm_configuration(args);
    match bonsai_runtime::start(config) {
        Ok(status) => std::process::exit(status),
        Err(e) => {
            eprintln!("Error: could not start the VM: {}", e);
            std::process::exit(1);
        }
    }
}
